//! Bounded fan-out of independent jobs.
//!
//! At most `limit` jobs run at once. There is no queue beyond the submitted
//! list, and outcomes are returned in submission order regardless of which
//! job finished first.

use crate::results::{ResultFile, ResultsResult};
use futures::future::BoxFuture;
use serde::Deserialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Stem of the result files written by [`run_commands`]
pub const TASK_RESULT_STEM: &str = "task";

const STDERR_TAIL_CHARS: usize = 200;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Job '{name}' failed: {reason}")]
    Failed { name: String, reason: String },

    #[error("Job '{name}' panicked")]
    Panicked { name: String },

    #[error("Job '{name}' was cancelled")]
    Cancelled { name: String },
}

pub type PoolResult<T> = Result<T, PoolError>;

/// A named unit of work
pub struct Job<T> {
    pub name: String,
    future: BoxFuture<'static, Result<T, String>>,
}

impl<T> Job<T> {
    pub fn new<F>(name: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = Result<T, String>> + Send + 'static,
    {
        Self {
            name: name.into(),
            future: Box::pin(future),
        }
    }
}

#[derive(Debug)]
pub struct JobOutcome<T> {
    pub name: String,
    pub result: PoolResult<T>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    limit: usize,
}

impl WorkerPool {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub async fn run<T: Send + 'static>(&self, jobs: Vec<Job<T>>) -> Vec<JobOutcome<T>> {
        let semaphore = Arc::new(Semaphore::new(self.limit));
        let mut handles = Vec::with_capacity(jobs.len());

        for job in jobs {
            let name = job.name.clone();
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    handles.push((name, None));
                    continue;
                }
            };

            let handle = tokio::spawn(async move {
                let _permit = permit;
                debug!("Job '{}' started", job.name);
                let started = Instant::now();
                let result = job.future.await;
                let elapsed = started.elapsed();
                debug!("Job '{}' finished in {:?}", job.name, elapsed);
                (result, elapsed)
            });
            handles.push((name, Some(handle)));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            let outcome = match handle {
                None => JobOutcome {
                    result: Err(PoolError::Cancelled { name: name.clone() }),
                    name,
                    elapsed: Duration::ZERO,
                },
                Some(handle) => match handle.await {
                    Ok((result, elapsed)) => JobOutcome {
                        result: result.map_err(|reason| PoolError::Failed {
                            name: name.clone(),
                            reason,
                        }),
                        name,
                        elapsed,
                    },
                    Err(e) if e.is_panic() => {
                        warn!("Job '{}' panicked", name);
                        JobOutcome {
                            result: Err(PoolError::Panicked { name: name.clone() }),
                            name,
                            elapsed: Duration::ZERO,
                        }
                    }
                    Err(_) => JobOutcome {
                        result: Err(PoolError::Cancelled { name: name.clone() }),
                        name,
                        elapsed: Duration::ZERO,
                    },
                },
            };
            outcomes.push(outcome);
        }

        outcomes
    }
}

/// An external command run alongside a suite
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Run every task as a subprocess, at most `limit` at once. Each task leaves
/// a result file in `results_dir` with its name, exit status, elapsed time
/// and the tail of its stderr.
pub async fn run_commands(
    tasks: Vec<TaskSpec>,
    limit: usize,
    results_dir: &Path,
) -> Vec<JobOutcome<PathBuf>> {
    let pool = WorkerPool::new(limit);
    info!(
        "Running {} task(s), {} at a time",
        tasks.len(),
        pool.limit()
    );

    let jobs = tasks
        .into_iter()
        .map(|task| {
            let dir = results_dir.to_path_buf();
            let name = task.name.clone();
            Job::new(name, async move {
                run_task(&task, &dir).await.map_err(|e| e.to_string())
            })
        })
        .collect();

    pool.run(jobs).await
}

async fn run_task(task: &TaskSpec, dir: &Path) -> ResultsResult<PathBuf> {
    let file = ResultFile::create(dir, TASK_RESULT_STEM)?;
    file.append("name", &task.name)?;

    let mut command = Command::new(&task.program);
    command
        .args(&task.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &task.working_dir {
        command.current_dir(dir);
    }

    let started = Instant::now();
    let (status, stderr) = match command.output().await {
        Ok(output) => (
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ),
        Err(e) => {
            warn!("Task '{}' could not start '{}': {}", task.name, task.program, e);
            (-1, e.to_string())
        }
    };
    let elapsed = started.elapsed();

    file.append("status", status)?;
    file.append("elapsed_ms", elapsed.as_millis())?;
    file.append("stderr_tail", stderr_tail(&stderr))?;
    debug!("Task '{}' exited with {}", task.name, status);

    Ok(file.path().to_path_buf())
}

fn stderr_tail(stderr: &str) -> String {
    let joined = stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" | ");

    let count = joined.chars().count();
    if count <= STDERR_TAIL_CHARS {
        joined
    } else {
        joined.chars().skip(count - STDERR_TAIL_CHARS).collect()
    }
}
