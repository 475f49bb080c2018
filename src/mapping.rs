use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, warn};

use crate::descriptor::{MethodSignature, parse_method_descriptor};
use crate::error::ParseError;

/// One candidate identity for a mapped method.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct MethodInfo {
    pub(crate) class_name: String,
    pub(crate) return_type: String,
    pub(crate) name: String,
    pub(crate) arguments: String,
    /// Descriptor translated to the other side of the mapping, internal form.
    pub(crate) descriptor: String,
}

impl MethodInfo {
    fn matches(&self, arguments: &str) -> bool {
        self.arguments == arguments
    }
}

/// Descriptor decomposed into Java spelling after class translation.
#[derive(Clone, Debug, Default)]
struct DescInfo {
    arguments: String,
    return_type: String,
    descriptor: String,
}

type MethodTable = HashMap<String, HashMap<String, Vec<MethodInfo>>>;

/// Bidirectional original/obfuscated identities built from a ProGuard or R8 mapping file.
#[derive(Debug, Default)]
pub(crate) struct IdentityMapper {
    obfuscated_to_original_class: HashMap<String, String>,
    original_to_obfuscated_class: HashMap<String, String>,
    /// Keyed by obfuscated class then obfuscated method name; entries carry original names.
    obfuscated_methods: MethodTable,
    /// Keyed by original class then original method name; entries carry obfuscated names.
    original_methods: MethodTable,
}

/// Parsed member line of a mapping file.
#[derive(Debug, PartialEq, Eq)]
struct MemberLine<'a> {
    owner: Option<&'a str>,
    return_type: &'a str,
    name: &'a str,
    arguments: Option<&'a str>,
    new_name: &'a str,
}

impl IdentityMapper {
    /// Missing files yield an empty mapper; the pipeline treats the mapping as optional.
    pub(crate) fn load(path: &Path) -> Result<IdentityMapper> {
        if !path.exists() {
            debug!(path = %path.display(), "mapping file absent, using identity mapping");
            return Ok(IdentityMapper::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let (mapper, errors) = IdentityMapper::parse(&text);
        for error in &errors {
            warn!(path = %path.display(), "skipping {error}");
        }
        Ok(mapper)
    }

    /// Parse mapping text, returning the mapper and every line that was skipped.
    pub(crate) fn parse(text: &str) -> (IdentityMapper, Vec<ParseError>) {
        let mut mapper = IdentityMapper::default();
        let mut errors = Vec::new();
        // original name of the most recent class line
        let mut current: Option<String> = None;
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let malformed = || ParseError::MappingLine {
                line: index + 1,
                raw: raw.to_string(),
            };
            if let Some(class_line) = line.strip_suffix(':') {
                match parse_class_line(class_line) {
                    Some((original, obfuscated)) => {
                        mapper.add_class(original, obfuscated);
                        current = Some(original.to_string());
                    }
                    None => {
                        current = None;
                        errors.push(malformed());
                    }
                }
                continue;
            }
            let Some(class_name) = current.as_deref() else {
                continue;
            };
            match parse_member_line(line) {
                Some(member) => {
                    if let Some(arguments) = member.arguments {
                        let owner = member.owner.unwrap_or(class_name);
                        mapper.add_method(
                            owner,
                            member.return_type,
                            member.name,
                            arguments,
                            member.new_name,
                        );
                    }
                }
                None => errors.push(malformed()),
            }
        }
        (mapper, errors)
    }

    fn add_class(&mut self, original: &str, obfuscated: &str) {
        self.obfuscated_to_original_class
            .insert(obfuscated.to_string(), original.to_string());
        self.original_to_obfuscated_class
            .insert(original.to_string(), obfuscated.to_string());
    }

    fn add_method(
        &mut self,
        class_name: &str,
        return_type: &str,
        name: &str,
        arguments: &str,
        new_name: &str,
    ) {
        // Members bound to a class that never had its own class line are dropped.
        let Some(obfuscated_class) = self.original_to_obfuscated_class.get(class_name).cloned()
        else {
            return;
        };
        push_unique(
            &mut self.obfuscated_methods,
            &obfuscated_class,
            new_name,
            MethodInfo {
                class_name: class_name.to_string(),
                return_type: return_type.to_string(),
                name: name.to_string(),
                arguments: arguments.to_string(),
                descriptor: String::new(),
            },
        );
        push_unique(
            &mut self.original_methods,
            class_name,
            name,
            MethodInfo {
                class_name: obfuscated_class,
                return_type: return_type.to_string(),
                name: new_name.to_string(),
                arguments: arguments.to_string(),
                descriptor: String::new(),
            },
        );
    }

    pub(crate) fn original_class_name(&self, proguard_class_name: &str, default: &str) -> String {
        let key = proguard_class_name.replace('/', ".");
        self.obfuscated_to_original_class
            .get(&key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    pub(crate) fn proguard_class_name(&self, original_class_name: &str, default: &str) -> String {
        let key = original_class_name.replace('/', ".");
        self.original_to_obfuscated_class
            .get(&key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    /// Original identity of an obfuscated method. The descriptor is translated type by type
    /// and used to pick among overloads that share an obfuscated name.
    pub(crate) fn original_method_info(
        &self,
        obfuscated_class: &str,
        obfuscated_method: &str,
        obfuscated_desc: &str,
    ) -> MethodInfo {
        let obfuscated_class = obfuscated_class.replace('/', ".");
        let desc_info = self.translate_desc(obfuscated_desc, &self.obfuscated_to_original_class);
        if let Some(candidates) = self
            .obfuscated_methods
            .get(&obfuscated_class)
            .and_then(|methods| methods.get(obfuscated_method))
        {
            if let Some(found) = candidates.iter().find(|info| info.matches(&desc_info.arguments)) {
                return MethodInfo {
                    descriptor: desc_info.descriptor,
                    ..found.clone()
                };
            }
        }
        MethodInfo {
            class_name: obfuscated_class,
            return_type: desc_info.return_type,
            name: obfuscated_method.to_string(),
            arguments: desc_info.arguments,
            descriptor: desc_info.descriptor,
        }
    }

    /// Obfuscated identity of an original method, the inverse of [`Self::original_method_info`].
    pub(crate) fn proguard_method_info(
        &self,
        original_class: &str,
        original_method: &str,
        original_desc: &str,
    ) -> MethodInfo {
        let original_class = original_class.replace('/', ".");
        let desc_info = self.translate_desc(original_desc, &self.original_to_obfuscated_class);
        if let Some(candidates) = self
            .original_methods
            .get(&original_class)
            .and_then(|methods| methods.get(original_method))
        {
            for candidate in candidates {
                let arguments = candidate
                    .arguments
                    .split(',')
                    .map(|argument| self.translate_java_name(argument))
                    .collect::<Vec<_>>()
                    .join(",");
                if arguments == desc_info.arguments {
                    return MethodInfo {
                        class_name: candidate.class_name.clone(),
                        return_type: self.translate_java_name(&candidate.return_type),
                        name: candidate.name.clone(),
                        arguments,
                        descriptor: desc_info.descriptor,
                    };
                }
            }
        }
        MethodInfo {
            class_name: original_class,
            return_type: desc_info.return_type,
            name: original_method.to_string(),
            arguments: desc_info.arguments,
            descriptor: desc_info.descriptor,
        }
    }

    /// First obfuscated candidate for an original `class#method`, ignoring overloads.
    pub(crate) fn obfuscated_info_without_desc(
        &self,
        original_class: &str,
        original_method: &str,
    ) -> (String, String) {
        let original_class = original_class.replace('/', ".");
        self.original_methods
            .get(&original_class)
            .and_then(|methods| methods.get(original_method))
            .and_then(|candidates| candidates.first())
            .map(|info| (info.class_name.clone(), info.name.clone()))
            .unwrap_or_else(|| (original_class.clone(), original_method.to_string()))
    }

    /// `pkg.Class.name(argType,...)returnType` with original names, the string every
    /// filter rule is matched against.
    pub(crate) fn origin_full_method(&self, class_name: &str, method: &str, desc: &str) -> String {
        let class_name = class_name.replace('/', ".");
        let original_class = self.original_class_name(&class_name, &class_name);
        let info = self.original_method_info(&class_name, method, desc);
        let full = format!(
            "{}.{}({}){}",
            original_class, info.name, info.arguments, info.return_type
        );
        strip_synthetic_suffix(&full)
    }

    /// Drop every table. The mapper answers with identity lookups afterwards.
    pub(crate) fn release(&mut self) {
        self.obfuscated_to_original_class.clear();
        self.original_to_obfuscated_class.clear();
        self.obfuscated_methods.clear();
        self.original_methods.clear();
    }

    fn translate_desc(&self, desc: &str, classes: &HashMap<String, String>) -> DescInfo {
        let signature = match parse_method_descriptor(desc) {
            Ok(signature) => signature,
            Err(err) => {
                debug!("{err}, keeping descriptor untranslated");
                return DescInfo {
                    descriptor: desc.replace('.', "/"),
                    ..DescInfo::default()
                };
            }
        };
        let translate = |ty: &crate::descriptor::JavaType| match ty.class_name() {
            Some(class_name) => match classes.get(class_name) {
                Some(mapped) => ty.with_class_name(mapped),
                None => ty.clone(),
            },
            None => ty.clone(),
        };
        let translated = MethodSignature {
            params: signature.params.iter().map(translate).collect(),
            ret: signature.ret.as_ref().map(translate),
        };
        DescInfo {
            arguments: translated.java_arguments(),
            return_type: translated.java_return(),
            descriptor: translated.descriptor(),
        }
    }

    fn translate_java_name(&self, name: &str) -> String {
        let key = name.replace("[]", "");
        match self.original_to_obfuscated_class.get(&key) {
            Some(mapped) => name.replacen(&key, mapped, 1),
            None => name.to_string(),
        }
    }
}

fn push_unique(table: &mut MethodTable, class_name: &str, method: &str, info: MethodInfo) {
    let candidates = table
        .entry(class_name.to_string())
        .or_default()
        .entry(method.to_string())
        .or_default();
    if !candidates.contains(&info) {
        candidates.push(info);
    }
}

/// `original.Name -> obfuscated.name` with the trailing colon already removed.
fn parse_class_line(line: &str) -> Option<(&str, &str)> {
    let (original, obfuscated) = line.split_once("->")?;
    let original = original.trim();
    let obfuscated = obfuscated.trim();
    if original.is_empty() || obfuscated.is_empty() || original.contains(' ') {
        return None;
    }
    Some((original, obfuscated))
}

/// `[a:b:]type name[(args)[:c[:d]]] -> newName`.
fn parse_member_line(line: &str) -> Option<MemberLine<'_>> {
    let (left, new_name) = line.split_once("->")?;
    let new_name = new_name.trim();
    if new_name.is_empty() {
        return None;
    }
    let mut left = left.trim();
    // R8 prefixes members with `start:end:` line ranges.
    while let Some((prefix, rest)) = left.split_once(':') {
        if prefix.is_empty() || !prefix.bytes().all(|byte| byte.is_ascii_digit()) {
            break;
        }
        left = rest;
    }
    let (return_type, rest) = left.split_once(' ')?;
    let rest = rest.trim();
    if return_type.is_empty() || rest.is_empty() {
        return None;
    }
    let (qualified_name, arguments) = match rest.find('(') {
        Some(open) => {
            let close = rest[open..].find(')')? + open;
            (&rest[..open], Some(&rest[open + 1..close]))
        }
        None => (rest, None),
    };
    if qualified_name.is_empty() {
        return None;
    }
    let (owner, name) = match qualified_name.rfind('.') {
        Some(dot) => (Some(&qualified_name[..dot]), &qualified_name[dot + 1..]),
        None => (None, qualified_name),
    };
    Some(MemberLine {
        owner,
        return_type,
        name,
        arguments,
        new_name,
    })
}

/// R8 appends an eight character hash to some synthetic methods, `lambda$run$0$a1b2c3d4(`.
fn strip_synthetic_suffix(full_method: &str) -> String {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(r"\$[A-Za-z0-9]{8}\(").ok());
    match pattern {
        Some(pattern) => pattern.replace_all(full_method, "(").into_owned(),
        None => full_method.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPPING: &str = "\
# compiler: R8
com.example.Foo -> a.a:
    int count -> a
    1:1:void <init>() -> <init>
    void bar(int,java.lang.String) -> a
    void bar(com.example.Foo) -> a
    com.example.Foo[] all():12:14 -> b
    13:13:void com.example.Base.inherited() -> c
com.example.Base -> a.b:
    void hook() -> a
";

    #[test]
    fn class_round_trip_is_identity() {
        let (mapper, errors) = IdentityMapper::parse(MAPPING);
        assert!(errors.is_empty());

        let original = mapper.original_class_name("a.a", "a.a");
        assert_eq!("com.example.Foo", original);
        assert_eq!("a.a", mapper.proguard_class_name(&original, "a.a"));
        assert_eq!("com.example.Foo", mapper.original_class_name("a/a", "a/a"));
    }

    #[test]
    fn unmapped_names_fall_back_to_default() {
        let (mapper, _) = IdentityMapper::parse(MAPPING);

        assert_eq!("x.Y", mapper.original_class_name("x.Y", "x.Y"));
        assert_eq!("x.Y", mapper.proguard_class_name("x.Y", "x.Y"));
        let info = mapper.original_method_info("x.Y", "run", "(I)V");
        assert_eq!("run", info.name);
        assert_eq!("int", info.arguments);
        assert_eq!("void", info.return_type);
    }

    #[test]
    fn overloads_are_disambiguated_by_translated_arguments() {
        let (mapper, _) = IdentityMapper::parse(MAPPING);

        let info = mapper.original_method_info("a.a", "a", "(La/a;)V");
        assert_eq!("bar", info.name);
        assert_eq!("com.example.Foo", info.arguments);
        assert_eq!("(Lcom/example/Foo;)V", info.descriptor);

        let info = mapper.original_method_info("a.a", "a", "(ILjava/lang/String;)V");
        assert_eq!("int,java.lang.String", info.arguments);
    }

    #[test]
    fn array_returns_keep_brackets() {
        let (mapper, _) = IdentityMapper::parse(MAPPING);

        let info = mapper.original_method_info("a.a", "b", "()[La/a;");
        assert_eq!("all", info.name);
        assert_eq!("com.example.Foo[]", info.return_type);
        assert_eq!("()[Lcom/example/Foo;", info.descriptor);
    }

    #[test]
    fn proguard_method_info_inverts_lookup() {
        let (mapper, _) = IdentityMapper::parse(MAPPING);

        let info = mapper.proguard_method_info("com.example.Foo", "bar", "(Lcom/example/Foo;)V");
        assert_eq!("a.a", info.class_name);
        assert_eq!("a", info.name);
        assert_eq!("(La/a;)V", info.descriptor);
    }

    #[test]
    fn qualified_member_binds_to_known_class_only() {
        // Base's class line comes after the qualified member, so it is dropped.
        let (mapper, _) = IdentityMapper::parse(MAPPING);
        let info = mapper.original_method_info("a.b", "c", "()V");
        assert_eq!("c", info.name);

        let info = mapper.original_method_info("a.b", "a", "()V");
        assert_eq!("hook", info.name);
    }

    #[test]
    fn malformed_lines_are_reported_and_skipped() {
        let text = "com.example.Foo -> a.a:\n    garbage\n    void ok() -> b\n";
        let (mapper, errors) = IdentityMapper::parse(text);

        assert_eq!(1, errors.len());
        assert!(matches!(errors[0], ParseError::MappingLine { line: 2, .. }));
        assert_eq!("ok", mapper.original_method_info("a.a", "b", "()V").name);
    }

    #[test]
    fn members_before_any_class_are_dropped() {
        let (mapper, errors) = IdentityMapper::parse("    void x() -> y\n");
        assert!(errors.is_empty());
        assert_eq!("y", mapper.original_method_info("a.a", "y", "()V").name);
        assert_eq!("x", mapper.proguard_method_info("a.a", "x", "()V").name);
    }

    #[test]
    fn parses_all_member_shapes() {
        let field = parse_member_line("int count -> a").expect("field");
        assert_eq!(None, field.arguments);

        let plain = parse_member_line("void run() -> a").expect("method");
        assert_eq!(Some(""), plain.arguments);

        let one = parse_member_line("void run(int):12 -> a").expect("one line");
        assert_eq!(Some("int"), one.arguments);

        let two = parse_member_line("void run(int):12:14 -> a").expect("two lines");
        assert_eq!("run", two.name);

        let r8 = parse_member_line("3:4:void a.B.run() -> c").expect("r8");
        assert_eq!(Some("a.B"), r8.owner);
        assert_eq!("c", r8.new_name);
    }

    #[test]
    fn origin_full_method_strips_synthetic_hash() {
        let mapper = IdentityMapper::default();
        let full = mapper.origin_full_method("com/example/Foo", "lambda$run$0$a1B2c3D4", "()V");
        assert_eq!("com.example.Foo.lambda$run$0()void", full);
    }

    #[test]
    fn release_clears_everything() {
        let (mut mapper, _) = IdentityMapper::parse(MAPPING);
        mapper.release();

        assert_eq!("a.a", mapper.original_class_name("a.a", "a.a"));
        assert_eq!("a", mapper.original_method_info("a.b", "a", "()V").name);
    }
}
