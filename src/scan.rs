use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jclassfile::class_file;
use jclassfile::constant_pool::ConstantPool;
use jclassfile::methods::MethodFlags;
use rayon::ThreadPool;
use rayon::prelude::*;
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::cfg::build_cfg;
use crate::ir::{CallSite, Class, Instruction, Method, MethodAccess};
use crate::opcodes::{self, opcode_length, read_u16};

/// Parsed classes of every input plus counters for the timing summary.
pub(crate) struct ScanOutput {
    pub(crate) classes: Vec<Class>,
    pub(crate) class_count: usize,
    pub(crate) skipped: usize,
}

/// Unit of parallel work: a loose class file or a whole archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ClassSource {
    File(PathBuf),
    Jar(PathBuf),
}

/// Parse every class reachable from `inputs` on the given pool. Unreadable or malformed
/// classes are logged and skipped.
pub(crate) fn scan_inputs(inputs: &[PathBuf], pool: &ThreadPool) -> Result<ScanOutput> {
    let mut sources = Vec::new();
    for input in inputs {
        collect_sources(input, true, &mut sources)?;
    }

    let results: Vec<(Vec<Class>, usize)> =
        pool.install(|| sources.par_iter().map(scan_source).collect());

    let mut classes = Vec::new();
    let mut skipped = 0;
    for (parsed, failed) in results {
        classes.extend(parsed);
        skipped += failed;
    }
    classes.sort_by(|a, b| a.name.cmp(&b.name));
    let class_count = classes.len();
    Ok(ScanOutput {
        classes,
        class_count,
        skipped,
    })
}

pub(crate) fn collect_sources(
    path: &Path,
    strict: bool,
    sources: &mut Vec<ClassSource>,
) -> Result<()> {
    if path.is_dir() {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)
            .with_context(|| format!("failed to read directory {}", path.display()))?
        {
            let entry =
                entry.with_context(|| format!("failed to read entry under {}", path.display()))?;
            entries.push(entry.path());
        }

        // Keep deterministic ordering by sorting directory listings.
        entries.sort_by(|a, b| path_key(a).cmp(&path_key(b)));
        for entry in entries {
            collect_sources(&entry, false, sources)?;
        }
        return Ok(());
    }

    let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    match extension {
        "class" => sources.push(ClassSource::File(path.to_path_buf())),
        "jar" => sources.push(ClassSource::Jar(path.to_path_buf())),
        _ if strict => anyhow::bail!("unsupported input file: {}", path.display()),
        _ => {}
    }
    Ok(())
}

fn scan_source(source: &ClassSource) -> (Vec<Class>, usize) {
    match source {
        ClassSource::File(path) => match scan_class_file(path) {
            Ok(class) => (vec![class], 0),
            Err(err) => {
                warn!("skipping {}: {err:#}", path.display());
                (Vec::new(), 1)
            }
        },
        ClassSource::Jar(path) => match scan_jar_file(path) {
            Ok(result) => result,
            Err(err) => {
                warn!("skipping {}: {err:#}", path.display());
                (Vec::new(), 1)
            }
        },
    }
}

fn scan_class_file(path: &Path) -> Result<Class> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    parse_class_bytes(&data).with_context(|| format!("failed to parse {}", path.display()))
}

fn scan_jar_file(path: &Path) -> Result<(Vec<Class>, usize)> {
    let file = fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))?;

    let mut entry_names = Vec::new();
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if is_class_entry(&name) {
            entry_names.push(name);
        }
    }

    entry_names.sort();

    let mut classes = Vec::new();
    let mut skipped = 0;
    for name in entry_names {
        let mut entry = archive
            .by_name(&name)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        match parse_class_bytes(&data) {
            Ok(class) => classes.push(class),
            Err(err) => {
                warn!("skipping {}:{}: {err:#}", path.display(), name);
                skipped += 1;
            }
        }
    }

    debug!(jar = %path.display(), classes = classes.len(), "scanned archive");
    Ok((classes, skipped))
}

pub(crate) fn is_class_entry(name: &str) -> bool {
    name.ends_with(".class") && !name.ends_with("module-info.class")
}

pub(crate) fn parse_class_bytes(data: &[u8]) -> Result<Class> {
    let class_file = class_file::parse(data).context("failed to parse class file bytes")?;
    let constant_pool = class_file.constant_pool();
    let name =
        resolve_class_name(constant_pool, class_file.this_class()).context("resolve class name")?;
    let super_name = if class_file.super_class() == 0 {
        None
    } else {
        Some(
            resolve_class_name(constant_pool, class_file.super_class())
                .context("resolve super class name")?,
        )
    };
    let mut interfaces = Vec::new();
    for interface in class_file.interfaces() {
        interfaces
            .push(resolve_class_name(constant_pool, *interface).context("resolve interface name")?);
    }
    let methods = parse_methods(constant_pool, class_file.methods())
        .with_context(|| format!("parse methods of {name}"))?;

    Ok(Class {
        name,
        super_name,
        interfaces,
        methods,
    })
}

fn parse_methods(
    constant_pool: &[ConstantPool],
    methods: &[jclassfile::methods::MethodInfo],
) -> Result<Vec<Method>> {
    let mut parsed = Vec::new();
    for method in methods {
        let name =
            resolve_utf8(constant_pool, method.name_index()).context("resolve method name")?;
        let descriptor = resolve_utf8(constant_pool, method.descriptor_index())
            .context("resolve method descriptor")?;
        let access_flags = method.access_flags();
        let access = MethodAccess {
            flags: access_flags.bits(),
            is_native: access_flags.contains(MethodFlags::ACC_NATIVE),
            is_synchronized: access_flags.contains(MethodFlags::ACC_SYNCHRONIZED),
        };
        let annotations = parse_annotations(constant_pool, method.attributes())
            .with_context(|| format!("parse annotations of {name}"))?;
        let code = method
            .attributes()
            .iter()
            .find_map(|attribute| match attribute {
                jclassfile::attributes::Attribute::Code {
                    code,
                    exception_table,
                    ..
                } => Some((code, exception_table)),
                _ => None,
            });
        let (instructions, calls, cfg) = match code {
            Some((code, exception_table)) => {
                let (instructions, calls) = parse_bytecode(code, constant_pool)
                    .with_context(|| format!("parse bytecode of {name}{descriptor}"))?;
                let handler_offsets = exception_table
                    .iter()
                    .map(|entry| entry.handler_pc() as u32)
                    .collect::<Vec<_>>();
                let cfg = build_cfg(code, &instructions, &handler_offsets)
                    .context("build control flow graph")?;
                (instructions, calls, cfg)
            }
            None => Default::default(),
        };
        parsed.push(Method {
            name,
            descriptor,
            access,
            instructions,
            cfg,
            calls,
            annotations,
        });
    }
    Ok(parsed)
}

fn parse_annotations(
    constant_pool: &[ConstantPool],
    attributes: &[jclassfile::attributes::Attribute],
) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for attribute in attributes {
        let annotations = match attribute {
            jclassfile::attributes::Attribute::RuntimeVisibleAnnotations { annotations, .. } => {
                annotations
            }
            jclassfile::attributes::Attribute::RuntimeInvisibleAnnotations {
                annotations, ..
            } => annotations,
            _ => continue,
        };
        for annotation in annotations {
            names.push(annotation_class_name(constant_pool, annotation)?);
        }
    }
    Ok(names)
}

fn annotation_class_name(
    constant_pool: &[ConstantPool],
    annotation: &jclassfile::attributes::Annotation,
) -> Result<String> {
    let descriptor =
        resolve_utf8(constant_pool, annotation.type_index()).context("resolve annotation type")?;
    let trimmed = descriptor
        .strip_prefix('L')
        .and_then(|value| value.strip_suffix(';'))
        .context("invalid annotation descriptor")?;
    Ok(trimmed.to_string())
}

fn resolve_class_name(constant_pool: &[ConstantPool], class_index: u16) -> Result<String> {
    let entry = constant_pool
        .get(class_index as usize)
        .context("missing class entry")?;
    match entry {
        ConstantPool::Class { name_index } => resolve_utf8(constant_pool, *name_index),
        _ => anyhow::bail!("unexpected class entry"),
    }
}

fn resolve_utf8(constant_pool: &[ConstantPool], index: u16) -> Result<String> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing utf8 entry")?;
    match entry {
        ConstantPool::Utf8 { value } => Ok(value.clone()),
        _ => anyhow::bail!("unexpected utf8 entry"),
    }
}

fn parse_bytecode(
    code: &[u8],
    constant_pool: &[ConstantPool],
) -> Result<(Vec<Instruction>, Vec<CallSite>)> {
    let mut instructions = Vec::new();
    let mut calls = Vec::new();
    let mut offset = 0usize;
    while offset < code.len() {
        let opcode = code[offset];
        let start_offset = offset as u32;
        let length = opcode_length(code, offset)?;
        if length == 0 || offset + length > code.len() {
            anyhow::bail!("invalid bytecode length at offset {}", offset);
        }
        if matches!(
            opcode,
            opcodes::INVOKEVIRTUAL
                | opcodes::INVOKESPECIAL
                | opcodes::INVOKESTATIC
                | opcodes::INVOKEINTERFACE
        ) {
            let method_index = read_u16(code, offset + 1)?;
            calls.push(
                resolve_method_ref(constant_pool, method_index).context("resolve method ref")?,
            );
        }
        instructions.push(Instruction {
            offset: start_offset,
            opcode,
        });
        offset += length;
    }
    Ok((instructions, calls))
}

fn resolve_method_ref(constant_pool: &[ConstantPool], index: u16) -> Result<CallSite> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing method ref entry")?;
    let (class_index, name_and_type_index) = match entry {
        ConstantPool::Methodref {
            class_index,
            name_and_type_index,
        } => (*class_index, *name_and_type_index),
        ConstantPool::InterfaceMethodref {
            class_index,
            name_and_type_index,
        } => (*class_index, *name_and_type_index),
        _ => anyhow::bail!("unexpected method ref entry"),
    };
    let owner = resolve_class_name(constant_pool, class_index).context("resolve owner")?;
    let (name_index, descriptor_index) = resolve_name_and_type(constant_pool, name_and_type_index)?;
    let name = resolve_utf8(constant_pool, name_index).context("resolve method name")?;
    let descriptor =
        resolve_utf8(constant_pool, descriptor_index).context("resolve method descriptor")?;
    Ok(CallSite {
        owner,
        name,
        descriptor,
    })
}

fn resolve_name_and_type(constant_pool: &[ConstantPool], index: u16) -> Result<(u16, u16)> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing name and type entry")?;
    match entry {
        ConstantPool::NameAndType {
            name_index,
            descriptor_index,
        } => Ok((*name_index, *descriptor_index)),
        _ => anyhow::bail!("unexpected name and type entry"),
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::testing::ClassBuilder;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn pool() -> ThreadPool {
        rayon::ThreadPoolBuilder::new()
            .num_threads(2)
            .build()
            .expect("thread pool")
    }

    fn sample_class() -> Vec<u8> {
        let mut builder = ClassBuilder::new("com/example/Foo", "java/lang/Object");
        let helper = builder.method_ref("com/example/Foo", "helper", "()V");
        let [hi, lo] = helper.to_be_bytes();
        builder.method(
            0x0001,
            "bar",
            "()V",
            1,
            1,
            vec![opcodes::ALOAD_0, opcodes::INVOKEVIRTUAL, hi, lo, opcodes::RETURN],
        );
        builder.method(0x0101, "nativeCall", "(I)V", 0, 0, Vec::new());
        builder.build()
    }

    #[test]
    fn parses_calls_and_access_flags() {
        let class = parse_class_bytes(&sample_class()).expect("parse class");

        assert_eq!("com/example/Foo", class.name);
        assert_eq!(Some("java/lang/Object".to_string()), class.super_name);
        let bar = &class.methods[0];
        assert_eq!(3, bar.instructions.len());
        assert_eq!(1, bar.calls.len());
        assert_eq!("helper", bar.calls[0].name);
        assert_eq!("com/example/Foo", bar.calls[0].owner);
        let native = &class.methods[1];
        assert!(native.access.is_native);
        assert!(!native.has_body());
    }

    #[test]
    fn rejects_invalid_class_bytes() {
        assert!(parse_class_bytes(b"nope").is_err());
    }

    #[test]
    fn scan_inputs_skips_bad_classes_and_reads_jars() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let classes_dir = temp_dir.path().join("classes");
        fs::create_dir_all(classes_dir.join("com/example")).expect("create dirs");
        fs::write(classes_dir.join("com/example/Foo.class"), sample_class()).expect("write");
        fs::write(classes_dir.join("Bad.class"), b"nope").expect("write bad class");

        let jar_path = temp_dir.path().join("lib.jar");
        let file = fs::File::create(&jar_path).expect("create jar");
        let mut writer = zip::ZipWriter::new(file);
        let builder = ClassBuilder::new("com/lib/Util", "java/lang/Object");
        writer
            .start_file("com/lib/Util.class", SimpleFileOptions::default())
            .expect("start entry");
        writer.write_all(&builder.build()).expect("write entry");
        writer
            .start_file("META-INF/MANIFEST.MF", SimpleFileOptions::default())
            .expect("start entry");
        writer.write_all(b"Manifest-Version: 1.0\n").expect("write entry");
        writer.finish().expect("finish jar");

        let output = scan_inputs(&[classes_dir, jar_path], &pool()).expect("scan");

        assert_eq!(2, output.class_count);
        assert_eq!(1, output.skipped);
        let names: Vec<&str> = output.classes.iter().map(|class| class.name.as_str()).collect();
        assert_eq!(vec!["com/example/Foo", "com/lib/Util"], names);
    }

    #[test]
    fn unsupported_top_level_input_is_rejected() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("notes.txt");
        fs::write(&path, "hello").expect("write");

        let mut sources = Vec::new();
        assert!(collect_sources(&path, true, &mut sources).is_err());
        assert!(collect_sources(temp_dir.path(), true, &mut sources).is_ok());
        assert!(sources.is_empty());
    }
}
