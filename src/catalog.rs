use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use dashmap::DashMap;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classfile::{ACC_NATIVE, ACC_PUBLIC};
use crate::mapping::IdentityMapper;

/// Id reserved for the message dispatch hook the runtime traces on its own.
pub(crate) const DISPATCH_METHOD_ID: u32 = 16_777_214;

pub(crate) const CATALOG_FILE: &str = "methodMapping.txt";
pub(crate) const IGNORE_FILE: &str = "ignoreMethodMapping.txt";

/// A method as seen in the inputs, named with current (possibly obfuscated) identities.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct MethodRecord {
    pub(crate) id: u32,
    pub(crate) access: u16,
    /// Dotted class name.
    pub(crate) class_name: String,
    pub(crate) method_name: String,
    /// Internal descriptor, `(Ljava/lang/String;)V`.
    pub(crate) descriptor: String,
}

impl MethodRecord {
    pub(crate) fn new(access: u16, internal_class: &str, method_name: &str, descriptor: &str) -> Self {
        MethodRecord {
            id: 0,
            access,
            class_name: internal_class.replace('/', "."),
            method_name: method_name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }

    pub(crate) fn is_native(&self) -> bool {
        self.access & ACC_NATIVE != 0
    }

    /// Identity in the catalog. Native overloads share one key; the first one seen wins.
    pub(crate) fn key(&self) -> String {
        if self.is_native() {
            format!("{}.{}()", self.class_name, self.method_name)
        } else {
            format!("{}.{}{}", self.class_name, self.method_name, self.descriptor)
        }
    }

    /// Same record under original names, descriptor dotted.
    fn reverted(&self, mapper: &IdentityMapper) -> MethodRecord {
        let info = mapper.original_method_info(&self.class_name, &self.method_name, &self.descriptor);
        MethodRecord {
            id: self.id,
            access: self.access,
            class_name: mapper.original_class_name(&self.class_name, &self.class_name),
            method_name: info.name,
            descriptor: info.descriptor.replace('/', "."),
        }
    }

    fn ignore_line(&self) -> String {
        if self.is_native() {
            format!("{} {}", self.class_name, self.method_name)
        } else {
            format!("{} {} {}", self.class_name, self.method_name, self.descriptor)
        }
    }

    fn catalog_line(&self) -> String {
        format!("{},{},{}", self.id, self.access, self.ignore_line())
    }

    fn dispatch() -> MethodRecord {
        MethodRecord {
            id: DISPATCH_METHOD_ID,
            access: ACC_PUBLIC,
            class_name: "android.os.Handler".to_string(),
            method_name: "dispatchMessage".to_string(),
            descriptor: "(Landroid.os.Message;)V".to_string(),
        }
    }
}

/// Registry of instrumented and ignored methods for one run.
#[derive(Debug, Default)]
pub(crate) struct Catalog {
    collected: DashMap<String, MethodRecord>,
    ignored: DashMap<String, MethodRecord>,
    /// Entries of the previous catalog as written, keyed by current identity.
    prior: HashMap<String, MethodRecord>,
    next_id: AtomicU32,
}

impl Catalog {
    /// Start from the catalog a previous run wrote. Read failures leave the catalog empty.
    pub(crate) fn load(path: Option<&Path>, mapper: &IdentityMapper) -> Catalog {
        let Some(path) = path else {
            return Catalog::default();
        };
        match fs::read_to_string(path) {
            Ok(text) => {
                let catalog = Catalog::from_prior(&text, mapper);
                info!(
                    path = %path.display(),
                    methods = catalog.prior.len(),
                    "loaded previous method catalog"
                );
                catalog
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no previous method catalog");
                Catalog::default()
            }
            Err(err) => {
                warn!(path = %path.display(), "failed to read previous method catalog: {err}");
                Catalog::default()
            }
        }
    }

    /// Parse persisted catalog text. Entries are translated from original names to the
    /// identities of the current mapping.
    pub(crate) fn from_prior(text: &str, mapper: &IdentityMapper) -> Catalog {
        let mut prior = HashMap::new();
        let mut max_id = 0;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some(record) = parse_catalog_line(line) else {
                debug!("skipping catalog line `{line}`");
                continue;
            };
            if record.id == DISPATCH_METHOD_ID {
                continue;
            }
            max_id = max_id.max(record.id);
            let class_name = mapper.proguard_class_name(&record.class_name, &record.class_name);
            let current = if record.descriptor.is_empty() {
                let (_, name) =
                    mapper.obfuscated_info_without_desc(&record.class_name, &record.method_name);
                MethodRecord {
                    class_name,
                    method_name: name,
                    ..record.clone()
                }
            } else {
                let descriptor = record.descriptor.replace('.', "/");
                let info =
                    mapper.proguard_method_info(&record.class_name, &record.method_name, &descriptor);
                MethodRecord {
                    class_name,
                    method_name: info.name,
                    descriptor: info.descriptor,
                    ..record.clone()
                }
            };
            prior.insert(current.key(), record);
        }
        Catalog {
            prior,
            next_id: AtomicU32::new(max_id),
            ..Catalog::default()
        }
    }

    /// Register an instrumented method and return its id. Known methods keep their id.
    pub(crate) fn instrument(&self, record: MethodRecord) -> u32 {
        let key = record.key();
        if record.is_native() && self.collected.contains_key(&key) {
            debug!("native overload {}{} merged into {key}", record.method_name, record.descriptor);
        }
        let entry = self.collected.entry(key.clone()).or_insert_with(|| {
            let id = self
                .prior
                .get(&key)
                .map(|known| known.id)
                .unwrap_or_else(|| self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
            MethodRecord { id, ..record }
        });
        entry.id
    }

    pub(crate) fn ignore(&self, record: MethodRecord) {
        self.ignored.entry(record.key()).or_insert(record);
    }

    /// Id of an instrumented method, by class (internal or dotted), name and descriptor.
    pub(crate) fn id_of(&self, class_name: &str, method_name: &str, descriptor: &str, access: u16) -> Option<u32> {
        let key = MethodRecord::new(access, class_name, method_name, descriptor).key();
        self.collected.get(&key).map(|record| record.id)
    }

    pub(crate) fn instrumented_count(&self) -> usize {
        self.collected.len()
    }

    pub(crate) fn ignored_count(&self) -> usize {
        self.ignored.len()
    }

    /// Catalog text with original names, the dispatch entry included. Entries of the
    /// previous catalog that were not collected again are written unchanged, so their ids
    /// stay taken.
    pub(crate) fn render(&self, mapper: &IdentityMapper, build_id: Uuid) -> String {
        let mut records: Vec<MethodRecord> = self
            .collected
            .iter()
            .map(|entry| entry.value().reverted(mapper))
            .collect();
        records.extend(
            self.prior
                .iter()
                .filter(|(key, _)| !self.collected.contains_key(*key))
                .map(|(_, record)| record.clone()),
        );
        records.push(MethodRecord::dispatch());
        records.sort_by_key(|record| record.id);
        let mut out = format!("#{build_id}\n");
        for record in records {
            out.push_str(&record.catalog_line());
            out.push('\n');
        }
        out
    }

    pub(crate) fn render_ignored(&self, mapper: &IdentityMapper) -> String {
        let mut records: Vec<MethodRecord> = self
            .ignored
            .iter()
            .map(|entry| entry.value().reverted(mapper))
            .collect();
        records.sort_by(|a, b| {
            (&a.class_name, &a.method_name, &a.descriptor).cmp(&(
                &b.class_name,
                &b.method_name,
                &b.descriptor,
            ))
        });
        let mut out = String::from("ignore methods:\n");
        for record in records {
            out.push_str(&record.ignore_line());
            out.push('\n');
        }
        out
    }

    /// Write both artifacts into `dir`, each through a temp file and a rename.
    pub(crate) fn persist(&self, dir: &Path, mapper: &IdentityMapper) -> Result<()> {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        write_atomic(&dir.join(CATALOG_FILE), &self.render(mapper, Uuid::new_v4()))?;
        write_atomic(&dir.join(IGNORE_FILE), &self.render_ignored(mapper))?;
        info!(
            instrumented = self.instrumented_count(),
            ignored = self.ignored_count(),
            dir = %dir.display(),
            "wrote method catalog"
        );
        Ok(())
    }
}

/// `id,access,class method[ descriptor]`. The descriptor is empty for natives.
fn parse_catalog_line(line: &str) -> Option<MethodRecord> {
    let mut fields = line.splitn(3, ',');
    let id = fields.next()?.trim().parse().ok()?;
    let access = fields.next()?.trim().parse().ok()?;
    let mut names = fields.next()?.split_whitespace();
    let class_name = names.next()?.to_string();
    let method_name = names.next()?.to_string();
    let descriptor = names.next().unwrap_or_default().to_string();
    Some(MethodRecord {
        id,
        access,
        class_name,
        method_name,
        descriptor,
    })
}

pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let mut file = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    file.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(class_name: &str, name: &str, descriptor: &str) -> MethodRecord {
        MethodRecord::new(ACC_PUBLIC, class_name, name, descriptor)
    }

    #[test]
    fn ids_are_assigned_once() {
        let catalog = Catalog::default();

        let first = catalog.instrument(record("com/example/Foo", "bar", "()V"));
        let second = catalog.instrument(record("com/example/Foo", "qux", "(I)V"));
        let again = catalog.instrument(record("com/example/Foo", "bar", "()V"));

        assert_eq!(1, first);
        assert_eq!(2, second);
        assert_eq!(first, again);
        assert_eq!(Some(2), catalog.id_of("com/example/Foo", "qux", "(I)V", ACC_PUBLIC));
    }

    #[test]
    fn native_overloads_share_an_entry() {
        let catalog = Catalog::default();
        let mut first = record("com/example/Jni", "call", "(I)V");
        first.access |= ACC_NATIVE;
        let mut second = record("com/example/Jni", "call", "(J)V");
        second.access |= ACC_NATIVE;

        assert_eq!(catalog.instrument(first), catalog.instrument(second));
        assert_eq!(1, catalog.instrumented_count());
    }

    #[test]
    fn render_sorts_by_id_and_keeps_dispatch() {
        let catalog = Catalog::default();
        catalog.instrument(record("com/example/Foo", "bar", "(Ljava/lang/String;)V"));
        let mut jni = record("com/example/Jni", "call", "(I)V");
        jni.access |= ACC_NATIVE;
        catalog.instrument(jni);

        let text = catalog.render(&IdentityMapper::default(), Uuid::nil());

        assert_eq!(
            "#00000000-0000-0000-0000-000000000000\n\
             1,1,com.example.Foo bar (Ljava.lang.String;)V\n\
             2,257,com.example.Jni call\n\
             16777214,1,android.os.Handler dispatchMessage (Landroid.os.Message;)V\n",
            text
        );
    }

    #[test]
    fn stable_ids_survive_a_rebuild_under_a_new_mapping() {
        let (first_mapping, _) = IdentityMapper::parse(
            "com.example.Foo -> a.a:\n    void bar() -> a\n    void qux(int) -> b\n",
        );
        let build1 = Catalog::default();
        build1.instrument(record("a/a", "a", "()V"));
        build1.instrument(record("a/a", "b", "(I)V"));
        let persisted = build1.render(&first_mapping, Uuid::new_v4());
        assert!(persisted.contains("2,1,com.example.Foo qux (I)V"));

        let (second_mapping, _) = IdentityMapper::parse(
            "com.example.Foo -> b.c:\n    void bar() -> x\n    void qux(int) -> y\n    void zed() -> z\n",
        );
        let build2 = Catalog::from_prior(&persisted, &second_mapping);
        let zed = build2.instrument(record("b/c", "z", "()V"));
        let qux = build2.instrument(record("b/c", "y", "(I)V"));
        let bar = build2.instrument(record("b/c", "x", "()V"));

        assert_eq!((1, 2, 3), (bar, qux, zed));
    }

    #[test]
    fn prior_entries_outlive_their_methods() {
        let prior = "#00000000-0000-0000-0000-000000000000\n7,1,com.a.Gone x ()V\n";
        let catalog = Catalog::from_prior(prior, &IdentityMapper::default());

        let id = catalog.instrument(record("com/a/Fresh", "y", "()V"));
        let text = catalog.render(&IdentityMapper::default(), Uuid::nil());

        assert_eq!(8, id);
        assert_eq!(
            "#00000000-0000-0000-0000-000000000000\n\
             7,1,com.a.Gone x ()V\n\
             8,1,com.a.Fresh y ()V\n\
             16777214,1,android.os.Handler dispatchMessage (Landroid.os.Message;)V\n",
            text
        );

        let next = Catalog::from_prior(&text, &IdentityMapper::default());
        assert_eq!(9, next.instrument(record("com/a/Later", "z", "()V")));
    }

    #[test]
    fn ignore_ledger_is_sorted_by_class() {
        let catalog = Catalog::default();
        catalog.ignore(record("com/example/Zeta", "get", "()I"));
        catalog.ignore(record("com/example/Foo", "baz", "()I"));
        catalog.ignore(record("com/example/Foo", "baz", "()I"));

        assert_eq!(
            "ignore methods:\ncom.example.Foo baz ()I\ncom.example.Zeta get ()I\n",
            catalog.render_ignored(&IdentityMapper::default())
        );
    }

    #[test]
    fn persist_writes_both_artifacts() {
        let temp = tempfile::tempdir().expect("temp dir");
        let dir = temp.path().join("release");
        let catalog = Catalog::default();
        catalog.instrument(record("com/example/Foo", "bar", "()V"));
        catalog.ignore(record("com/example/Foo", "baz", "()I"));

        catalog
            .persist(&dir, &IdentityMapper::default())
            .expect("persist");

        let written = fs::read_to_string(dir.join(CATALOG_FILE)).expect("catalog");
        assert!(written.starts_with('#'));
        assert!(written.contains("\n1,1,com.example.Foo bar ()V\n"));
        let ignored = fs::read_to_string(dir.join(IGNORE_FILE)).expect("ignored");
        assert_eq!("ignore methods:\ncom.example.Foo baz ()I\n", ignored);

        let reloaded = Catalog::load(Some(&dir.join(CATALOG_FILE)), &IdentityMapper::default());
        assert_eq!(1, reloaded.instrument(record("com/example/Foo", "bar", "()V")));
        assert_eq!(2, reloaded.instrument(record("com/example/Foo", "new", "()V")));
    }

    #[test]
    fn unreadable_prior_catalog_is_empty() {
        let temp = tempfile::tempdir().expect("temp dir");
        let catalog = Catalog::load(Some(&temp.path().join("missing.txt")), &IdentityMapper::default());

        assert_eq!(1, catalog.instrument(record("A", "a", "()V")));
    }
}
