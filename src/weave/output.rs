//! Mirrors inputs into the output directory, rewriting class files on the way.

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::ops::AddAssign;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rayon::ThreadPool;
use rayon::prelude::*;
use serde::Deserialize;
use sha1::{Digest, Sha1};
use tempfile::NamedTempFile;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::scan::is_class_entry;

use super::{Outcome, Weaver};

/// Per-input state reported by an incremental build.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub(crate) enum Status {
    Added,
    Changed,
    Removed,
    #[serde(rename = "NOTCHANGED")]
    NotChanged,
}

/// Paths absent from the set count as changed.
#[derive(Debug, Default)]
pub(crate) struct ChangeSet {
    statuses: BTreeMap<PathBuf, Status>,
}

impl ChangeSet {
    pub(crate) fn load(path: &Path) -> Result<ChangeSet> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        ChangeSet::parse(&text).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub(crate) fn parse(text: &str) -> Result<ChangeSet> {
        let statuses: BTreeMap<PathBuf, Status> = serde_json::from_str(text)?;
        Ok(ChangeSet { statuses })
    }

    pub(crate) fn status(&self, path: &Path) -> Status {
        self.statuses.get(path).copied().unwrap_or(Status::Changed)
    }

    fn removed(&self) -> impl Iterator<Item = &Path> {
        self.statuses
            .iter()
            .filter(|(_, status)| **status == Status::Removed)
            .map(|(path, _)| path.as_path())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct WeaveStats {
    pub(crate) rewritten: usize,
    pub(crate) unchanged: usize,
    pub(crate) passed_through: usize,
    pub(crate) copied: usize,
    pub(crate) skipped: usize,
    pub(crate) removed: usize,
}

impl AddAssign for WeaveStats {
    fn add_assign(&mut self, other: WeaveStats) {
        self.rewritten += other.rewritten;
        self.unchanged += other.unchanged;
        self.passed_through += other.passed_through;
        self.copied += other.copied;
        self.skipped += other.skipped;
        self.removed += other.removed;
    }
}

impl WeaveStats {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Rewritten(_) => self.rewritten += 1,
            Outcome::Unchanged => self.unchanged += 1,
            Outcome::PassedThrough => self.passed_through += 1,
        }
    }
}

/// One file to produce in the output directory.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Unit {
    File { source: PathBuf, dest: PathBuf },
    Jar { source: PathBuf, dest: PathBuf },
}

/// `<stem>_<sha1 of the input path>.jar`, so same-named archives do not collide.
pub(crate) fn jar_output_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "classes".to_string());
    let digest = Sha1::digest(path.to_string_lossy().as_bytes());
    format!("{stem}_{}.jar", hex::encode(digest))
}

/// Rewrite every input into `output` on the pool. Directories are mirrored, loose class
/// files land at the top level, archives get hashed names.
pub(crate) fn weave_inputs(
    inputs: &[PathBuf],
    output: &Path,
    weaver: &Weaver<'_>,
    changes: &ChangeSet,
    pool: &ThreadPool,
) -> Result<WeaveStats> {
    fs::create_dir_all(output)
        .with_context(|| format!("failed to create {}", output.display()))?;
    let mut stats = WeaveStats::default();
    for removed in changes.removed() {
        if let Some(dest) = removed_output(inputs, output, removed) {
            stats.removed += delete_output(&dest)?;
        }
    }

    let mut units = Vec::new();
    for input in inputs {
        if changes.status(input) != Status::Removed {
            plan_units(input, output, &mut units)?;
        }
    }
    units.retain(|unit| {
        let source = match unit {
            Unit::File { source, .. } | Unit::Jar { source, .. } => source,
        };
        let keep = changes.status(source) != Status::NotChanged;
        if !keep {
            stats.skipped += 1;
        }
        keep
    });

    let results: Vec<Result<WeaveStats>> = pool.install(|| {
        units
            .par_iter()
            .map(|unit| match unit {
                Unit::File { source, dest } => weave_file(source, dest, weaver),
                Unit::Jar { source, dest } => weave_jar(source, dest, weaver),
            })
            .collect()
    });
    for result in results {
        stats += result?;
    }
    info!(
        rewritten = stats.rewritten,
        unchanged = stats.unchanged,
        passed_through = stats.passed_through,
        copied = stats.copied,
        skipped = stats.skipped,
        removed = stats.removed,
        "wrote instrumented output"
    );
    Ok(stats)
}

fn plan_units(input: &Path, output: &Path, units: &mut Vec<Unit>) -> Result<()> {
    if input.is_dir() {
        let mut files = Vec::new();
        walk(input, &mut files)?;
        for source in files {
            let relative = source
                .strip_prefix(input)
                .with_context(|| format!("{} escapes {}", source.display(), input.display()))?;
            let dest = output.join(relative);
            units.push(Unit::File { source, dest });
        }
        return Ok(());
    }
    match input.extension().and_then(|ext| ext.to_str()) {
        Some("jar") => units.push(Unit::Jar {
            source: input.to_path_buf(),
            dest: output.join(jar_output_name(input)),
        }),
        Some("class") => {
            let name = input.file_name().context("class input without a file name")?;
            units.push(Unit::File {
                source: input.to_path_buf(),
                dest: output.join(name),
            });
        }
        _ => anyhow::bail!("unsupported input file: {}", input.display()),
    }
    Ok(())
}

fn walk(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("failed to read directory {}", dir.display()))?
    {
        let entry = entry.with_context(|| format!("failed to read entry under {}", dir.display()))?;
        entries.push(entry.path());
    }
    entries.sort();
    for entry in entries {
        if entry.is_dir() {
            walk(&entry, files)?;
        } else {
            files.push(entry);
        }
    }
    Ok(())
}

/// Where a removed input's output lives, if it came from one of the inputs.
fn removed_output(inputs: &[PathBuf], output: &Path, removed: &Path) -> Option<PathBuf> {
    if removed.extension().is_some_and(|ext| ext == "jar") {
        return Some(output.join(jar_output_name(removed)));
    }
    for input in inputs {
        if let Ok(relative) = removed.strip_prefix(input) {
            if !relative.as_os_str().is_empty() {
                return Some(output.join(relative));
            }
        }
        if input == removed {
            return removed.file_name().map(|name| output.join(name));
        }
    }
    None
}

fn delete_output(dest: &Path) -> Result<usize> {
    match fs::remove_file(dest) {
        Ok(()) => {
            debug!(path = %dest.display(), "removed stale output");
            Ok(1)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", dest.display())),
    }
}

fn weave_file(source: &Path, dest: &Path, weaver: &Weaver<'_>) -> Result<WeaveStats> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut stats = WeaveStats::default();
    let name = source.to_string_lossy();
    if !is_class_entry(&name) {
        fs::copy(source, dest).with_context(|| {
            format!("failed to copy {} to {}", source.display(), dest.display())
        })?;
        stats.copied += 1;
        return Ok(stats);
    }
    let data = fs::read(source).with_context(|| format!("failed to read {}", source.display()))?;
    let outcome = weaver.rewrite_entry(&data, &name);
    stats.record(&outcome);
    let bytes = match &outcome {
        Outcome::Rewritten(rewritten) => rewritten.as_slice(),
        Outcome::Unchanged | Outcome::PassedThrough => data.as_slice(),
    };
    fs::write(dest, bytes).with_context(|| format!("failed to write {}", dest.display()))?;
    Ok(stats)
}

fn weave_jar(source: &Path, dest: &Path, weaver: &Weaver<'_>) -> Result<WeaveStats> {
    let file =
        fs::File::open(source).with_context(|| format!("failed to open {}", source.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", source.display()))?;
    let dir = dest.parent().unwrap_or(Path::new("."));
    let temp = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    let mut writer = ZipWriter::new(temp);
    let mut stats = WeaveStats::default();

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read {}", source.display()))?;
        if !entry.is_file() || !is_class_entry(entry.name()) {
            // release the borrow on the archive before the raw copy
            drop(entry);
            let raw = archive
                .by_index_raw(index)
                .with_context(|| format!("failed to read {}", source.display()))?;
            writer
                .raw_copy_file(raw)
                .with_context(|| format!("failed to copy entry of {}", source.display()))?;
            stats.copied += 1;
            continue;
        }
        let name = entry.name().to_string();
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut data)
            .with_context(|| format!("failed to read {}:{}", source.display(), name))?;
        let options = SimpleFileOptions::default()
            .compression_method(entry.compression())
            .large_file(entry.size() > u32::MAX as u64);
        drop(entry);

        let outcome = weaver.rewrite_entry(&data, &format!("{}:{name}", source.display()));
        stats.record(&outcome);
        let bytes = match &outcome {
            Outcome::Rewritten(rewritten) => rewritten.as_slice(),
            Outcome::Unchanged | Outcome::PassedThrough => data.as_slice(),
        };
        writer
            .start_file(name.as_str(), options)
            .with_context(|| format!("failed to write {}:{name}", dest.display()))?;
        writer
            .write_all(bytes)
            .with_context(|| format!("failed to write {}:{name}", dest.display()))?;
    }

    let temp = writer
        .finish()
        .with_context(|| format!("failed to finish {}", dest.display()))?;
    temp.persist(dest)
        .with_context(|| format!("failed to replace {}", dest.display()))?;
    debug!(jar = %source.display(), output = %dest.display(), "wrote archive");
    Ok(stats)
}
