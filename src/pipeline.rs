//! Stage ordering for one instrumentation run.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rayon::prelude::*;
use tracing::{error, info, warn};

use crate::catalog::{CATALOG_FILE, Catalog, MethodRecord, write_atomic};
use crate::config::WeaveConfig;
use crate::filter::{FilterConfig, MethodFilter};
use crate::ir::Class;
use crate::mapping::IdentityMapper;
use crate::risk;
use crate::scan::scan_inputs;
use crate::weave::output::{ChangeSet, Status, WeaveStats, weave_inputs};
use crate::weave::{WeaveContext, Weaver};

pub(crate) const EVIL_METHODS_FILE: &str = "evilMethods.txt";

/// Paths for one run, as given on the command line.
#[derive(Clone, Debug, Default)]
pub(crate) struct Request {
    pub(crate) inputs: Vec<PathBuf>,
    pub(crate) output: PathBuf,
    pub(crate) mapping: Option<PathBuf>,
    pub(crate) filter: Option<PathBuf>,
    pub(crate) applied_method_map: Option<PathBuf>,
    pub(crate) changes: Option<PathBuf>,
    pub(crate) timing: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Summary {
    pub(crate) classes: usize,
    pub(crate) skipped_classes: usize,
    pub(crate) instrumented: usize,
    pub(crate) ignored: usize,
    pub(crate) evil: usize,
    pub(crate) weave: WeaveStats,
}

/// Records how long each stage took.
struct StageTimer {
    started: Instant,
    stages: Vec<(&'static str, Duration)>,
}

impl StageTimer {
    fn new() -> StageTimer {
        StageTimer {
            started: Instant::now(),
            stages: Vec::new(),
        }
    }

    fn stage<T>(&mut self, name: &'static str, run: impl FnOnce() -> T) -> T {
        let started = Instant::now();
        let result = run();
        self.stages.push((name, started.elapsed()));
        result
    }

    fn report(&self) {
        for (name, elapsed) in &self.stages {
            info!(stage = name, ms = elapsed.as_millis() as u64, "timing");
        }
        info!(total_ms = self.started.elapsed().as_millis() as u64, "timing");
    }
}

/// Load everything, decide every method, persist the catalog, then rewrite. Only a
/// contradictory filter file or an unusable input aborts the run.
pub(crate) fn run(request: &Request, config: &WeaveConfig) -> Result<Summary> {
    let mut timer = StageTimer::new();

    let mut mapper = timer.stage("mapping", || load_mapping(request));
    let filter = timer.stage("filter", || load_filter(request, config))?;
    let changes = match &request.changes {
        Some(path) => ChangeSet::load(path).unwrap_or_else(|err| {
            warn!("{err:#}, rewriting every input");
            ChangeSet::default()
        }),
        None => ChangeSet::default(),
    };
    let variant_dir = config.variant_dir();
    let prior = request
        .applied_method_map
        .clone()
        .unwrap_or_else(|| variant_dir.join(CATALOG_FILE));
    let catalog = timer.stage("prior-catalog", || Catalog::load(Some(&prior), &mapper));

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers)
        .build()
        .context("failed to build worker pool")?;

    let inputs: Vec<PathBuf> = request
        .inputs
        .iter()
        .filter(|input| changes.status(input) != Status::Removed)
        .cloned()
        .collect();
    if let Some(missing) = inputs.iter().find(|input| !input.exists()) {
        anyhow::bail!("input not found: {}", missing.display());
    }
    let scan = timer.stage("scan", || scan_inputs(&inputs, &pool))?;
    info!(classes = scan.class_count, skipped = scan.skipped, "scanned inputs");

    let evil = if filter.precise {
        timer.stage("risk", || {
            let evil = risk::classify(
                &scan.classes,
                &filter.risk,
                &MethodFilter::new(&filter, &mapper),
                &mapper,
                &pool,
            );
            let report = risk::render_report(&evil, &mapper);
            if let Err(err) = std::fs::create_dir_all(&variant_dir)
                .map_err(anyhow::Error::from)
                .and_then(|()| write_atomic(&variant_dir.join(EVIL_METHODS_FILE), &report))
            {
                error!("failed to write evil method report: {err:#}");
            }
            evil
        })
    } else {
        Vec::new()
    };

    let method_filter =
        MethodFilter::new(&filter, &mapper).with_flagged(evil.iter().map(|method| method.method_ref()));
    timer.stage("collect", || {
        pool.install(|| {
            scan.classes
                .par_iter()
                .for_each(|class| collect_class(class, &method_filter, &catalog));
        })
    });
    info!(
        instrumented = catalog.instrumented_count(),
        ignored = catalog.ignored_count(),
        "collected methods"
    );

    timer.stage("persist", || {
        if let Err(err) = catalog.persist(&variant_dir, &mapper) {
            error!("method catalog may be stale: {err:#}");
        }
    });

    let weaver = Weaver::new(WeaveContext {
        catalog: &catalog,
        mapper: &mapper,
        filter: &filter,
        config,
    });
    let weave = timer.stage("rewrite", || {
        weave_inputs(&inputs, &request.output, &weaver, &changes, &pool)
    })?;
    drop(weaver);
    mapper.release();

    if request.timing {
        timer.report();
    }
    Ok(Summary {
        classes: scan.class_count,
        skipped_classes: scan.skipped,
        instrumented: catalog.instrumented_count(),
        ignored: catalog.ignored_count(),
        evil: evil.len(),
        weave,
    })
}

fn load_mapping(request: &Request) -> IdentityMapper {
    let Some(path) = &request.mapping else {
        return IdentityMapper::default();
    };
    IdentityMapper::load(path).unwrap_or_else(|err| {
        warn!("{err:#}, continuing without a mapping");
        IdentityMapper::default()
    })
}

fn load_filter(request: &Request, config: &WeaveConfig) -> Result<FilterConfig> {
    let mut filter = FilterConfig::load(request.filter.as_deref())?;
    filter.block_runtime_class(&config.hooks.trace_class);
    filter.block_runtime_class(&config.hooks.lifecycle_class);
    filter
        .check()
        .context("contradictory filter configuration")?;
    Ok(filter)
}

fn collect_class(class: &Class, filter: &MethodFilter<'_>, catalog: &Catalog) {
    for method in &class.methods {
        let record =
            MethodRecord::new(method.access.flags, &class.name, &method.name, &method.descriptor);
        if filter.need_filter(method, class) {
            catalog.ignore(record);
        } else {
            catalog.instrument(record);
        }
    }
}
