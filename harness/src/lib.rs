pub mod config;
pub mod logscan;
pub mod orchestrator;
pub mod pool;
pub mod report;
pub mod results;
pub mod subject;
pub mod suite;

pub use config::{expand_env, ConfigError, ConfigResult, HarnessConfig, RunConfig};
pub use logscan::{
    DependencyReport, DependencyStatus, LogEntry, LogLevel, LogScanError, LogScanResult,
    LogScanner,
};
pub use orchestrator::{discover, load_suites, Orchestrator};
pub use pool::{run_commands, Job, JobOutcome, PoolError, PoolResult, TaskSpec, WorkerPool};
pub use report::{emit, OutputFormat, Outcome, Render, RunSummary, Subtest, TestReport};
pub use results::{collect, ResultError, ResultFile, ResultRecord, ResultsResult};
pub use subject::{
    locate_binary, log_contains, start_subject, ShutdownReport, SubjectConfig, SubjectError,
    SubjectHandle, SubjectResult, POLL_INTERVAL,
};
pub use suite::{
    CheckSpec, SuiteDefinition, SuiteError, SuiteResult, SuiteRunner, NOT_RUNNING, NO_TOKEN,
};
