//! Suite discovery and aggregation.

use crate::config::HarnessConfig;
use crate::pool::{Job, PoolError, WorkerPool};
use crate::report::{RunSummary, TestReport};
use crate::suite::{SuiteDefinition, SuiteResult, SuiteRunner};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Suite files matching `pattern`, sorted. Directories are skipped.
pub fn discover(pattern: &str) -> Result<Vec<PathBuf>, glob::PatternError> {
    let mut paths: Vec<PathBuf> = glob::glob(pattern)?
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Skipping unreadable path: {}", e);
                None
            }
        })
        .filter(|path| path.is_file())
        .collect();
    paths.sort();
    Ok(paths)
}

/// Load every suite file, keeping failures next to their path
pub fn load_suites(paths: &[PathBuf]) -> Vec<(PathBuf, SuiteResult<SuiteDefinition>)> {
    paths
        .iter()
        .map(|path| (path.clone(), SuiteDefinition::load(path)))
        .collect()
}

fn fallback_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

pub struct Orchestrator {
    config: HarnessConfig,
    filter: Option<String>,
}

impl Orchestrator {
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            config,
            filter: None,
        }
    }

    /// Only run suites whose name contains `filter`
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    fn selected(&self, name: &str) -> bool {
        match &self.filter {
            Some(filter) => name.contains(filter.as_str()),
            None => true,
        }
    }

    /// Discover suites with the configured glob and run them
    pub async fn run_discovered(&self) -> Result<RunSummary, glob::PatternError> {
        let paths = discover(&self.config.run.suites)?;
        Ok(self.run(&paths).await)
    }

    pub async fn run(&self, paths: &[PathBuf]) -> RunSummary {
        let mut summary = RunSummary::new();
        let results_dir = self.config.run.results_dir.clone();
        let keep_results = self.config.run.keep_results;

        let mut jobs = Vec::new();
        for (path, loaded) in load_suites(paths) {
            match loaded {
                Ok(definition) => {
                    if !self.selected(&definition.name) {
                        continue;
                    }
                    let dir = results_dir.clone();
                    jobs.push(Job::new(definition.name.clone(), async move {
                        let runner = SuiteRunner::new(definition, dir).keep_results(keep_results);
                        Ok(runner.run().await)
                    }));
                }
                Err(e) => {
                    let name = fallback_name(&path);
                    if !self.selected(&name) {
                        continue;
                    }
                    warn!("Could not load {}: {}", path.display(), e);
                    let mut report = TestReport::new(name.clone());
                    report.fail("load suite", e.to_string());
                    report.finish();
                    jobs.push(Job::new(name, async move { Ok(report) }));
                }
            }
        }

        info!(
            "Running {} suite(s) with {} job(s)",
            jobs.len(),
            self.config.run.jobs
        );

        let outcomes = WorkerPool::new(self.config.run.jobs).run(jobs).await;
        for outcome in outcomes {
            match outcome.result {
                Ok(report) => summary.add(report),
                Err(e) => {
                    let reason = match &e {
                        PoolError::Panicked { .. } => "suite runner panicked".to_string(),
                        other => other.to_string(),
                    };
                    let mut report = TestReport::new(outcome.name);
                    report.fail("run suite", reason);
                    report.finish();
                    summary.add(report);
                }
            }
        }

        summary.finish();
        info!(
            "{} of {} suites passed",
            summary.suites_passed(),
            summary.reports.len()
        );
        summary
    }
}
