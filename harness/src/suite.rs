//! Declarative test suites.
//!
//! A suite file describes one subject run: how to start the binary, which
//! requests to send while it is up, which commands to fan out alongside it,
//! and what its log must (or must not) contain once it has stopped.

use crate::config::{expand_env, read_to_string, ConfigError};
use crate::logscan::{DependencyStatus, LogLevel, LogScanError, LogScanner};
use crate::pool::{run_commands, TaskSpec};
use crate::report::TestReport;
use crate::results::ResultRecord;
use crate::subject::{start_subject, SubjectConfig, SubjectHandle};
use probe::{
    HttpProbe, LoginRequest, Method, Probe, ProbeConfig, ProbeRequest, ProbeResponse,
    WebSocketProbe,
};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Failure reason for subtests that need a subject which never came up
pub const NOT_RUNNING: &str = "subject not running";
/// Failure reason for authenticated checks when no token was acquired
pub const NO_TOKEN: &str = "no bearer token";

#[derive(Error, Debug)]
pub enum SuiteError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid suite '{suite}': {message}")]
    Invalid { suite: String, message: String },
}

pub type SuiteResult<T> = Result<T, SuiteError>;

#[derive(Debug, Clone, Deserialize)]
pub struct SuiteDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub subject: Option<SubjectSpec>,
    pub probe: Option<ProbeSpec>,
    pub auth: Option<AuthSpec>,
    #[serde(default, rename = "check")]
    pub checks: Vec<CheckSpec>,
    #[serde(default)]
    pub tasks: TasksSpec,
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubjectSpec {
    pub binary: PathBuf,
    pub config: Option<PathBuf>,
    /// Defaults to `<results_dir>/logs/<suite>.log`
    pub log_file: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    pub startup_marker: Option<String>,
    pub shutdown_marker: Option<String>,
}

fn default_startup_timeout() -> u64 {
    15
}

fn default_shutdown_timeout() -> u64 {
    10
}

impl SubjectSpec {
    pub fn to_subject_config(&self, suite: &str, results_dir: &Path) -> SubjectConfig {
        let defaults = SubjectConfig::default();
        SubjectConfig {
            binary: self.binary.clone(),
            config_path: self.config.clone(),
            log_file: self.log_file.clone().unwrap_or_else(|| {
                results_dir
                    .join("logs")
                    .join(format!("{}.log", file_stem(suite)))
            }),
            working_dir: self.working_dir.clone(),
            env_vars: self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            startup_timeout: Duration::from_secs(self.startup_timeout_secs),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            startup_marker: self
                .startup_marker
                .clone()
                .unwrap_or(defaults.startup_marker),
            shutdown_marker: self
                .shutdown_marker
                .clone()
                .unwrap_or(defaults.shutdown_marker),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeSpec {
    pub base_url: String,
    pub ws_url: Option<String>,
    #[serde(default = "default_protocol")]
    pub websocket_protocol: String,
    pub websocket_key: Option<String>,
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
}

fn default_protocol() -> String {
    ProbeConfig::default().websocket_protocol
}

fn default_probe_timeout() -> u64 {
    10
}

impl ProbeSpec {
    pub fn to_probe_config(&self) -> ProbeConfig {
        let mut config = ProbeConfig::new()
            .with_base_url(&self.base_url)
            .with_protocol(&self.websocket_protocol)
            .with_timeout(Duration::from_secs(self.timeout_secs));
        if let Some(ws_url) = &self.ws_url {
            config = config.with_ws_url(ws_url);
        }
        // An unset key expands to an empty string
        if let Some(key) = self.websocket_key.as_deref().filter(|k| !k.is_empty()) {
            config = config.with_websocket_key(key);
        }
        config
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSpec {
    #[serde(default = "default_login_path")]
    pub path: String,
    pub login_id: String,
    pub password: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_tz")]
    pub tz: String,
    #[serde(default)]
    pub database: String,
}

fn default_login_path() -> String {
    "/api/auth/login".to_string()
}

fn default_tz() -> String {
    "UTC".to_string()
}

impl AuthSpec {
    pub fn login_request(&self) -> LoginRequest {
        LoginRequest {
            login_id: self.login_id.clone(),
            password: self.password.clone(),
            api_key: self.api_key.clone(),
            tz: self.tz.clone(),
            database: self.database.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TasksSpec {
    #[serde(default = "default_jobs")]
    pub jobs: usize,
    #[serde(default)]
    pub keep_results: bool,
    #[serde(default)]
    pub run: Vec<TaskSpec>,
}

fn default_jobs() -> usize {
    1
}

impl Default for TasksSpec {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            keep_results: false,
            run: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckSpec {
    Http(HttpCheck),
    Websocket(WebSocketCheck),
    LogContains(PatternCheck),
    LogAbsent(PatternCheck),
    Dependency(DependencyCheck),
    LogLevelMax(LevelCheck),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HttpCheck {
    pub name: Option<String>,
    #[serde(default)]
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    /// Send the suite's bearer token
    #[serde(default)]
    pub auth: bool,
    #[serde(default = "default_expect_status")]
    pub expect_status: u16,
    /// JSON pointer to expected value
    #[serde(default)]
    pub expect_fields: BTreeMap<String, Value>,
    pub expect_body_contains: Option<String>,
}

fn default_expect_status() -> u16 {
    200
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WebSocketCheck {
    pub name: Option<String>,
    #[serde(default)]
    pub path: String,
    /// Strings go out verbatim as a text frame, tables and arrays as JSON
    pub message: Option<Value>,
    #[serde(default = "default_true")]
    pub use_key: bool,
    pub expect_contains: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PatternCheck {
    pub name: Option<String>,
    pub pattern: String,
    #[serde(default)]
    pub regex: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DependencyCheck {
    pub name: Option<String>,
    pub library: String,
    pub status: DependencyStatus,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LevelCheck {
    pub name: Option<String>,
    pub level: LogLevel,
    #[serde(default)]
    pub max: usize,
}

impl CheckSpec {
    pub fn display_name(&self) -> String {
        let (explicit, derived) = match self {
            CheckSpec::Http(c) => (&c.name, format!("{} {}", c.method, c.path)),
            CheckSpec::Websocket(c) => (
                &c.name,
                format!(
                    "websocket {}",
                    if c.path.is_empty() { "/" } else { c.path.as_str() }
                ),
            ),
            CheckSpec::LogContains(c) => (&c.name, format!("log contains '{}'", c.pattern)),
            CheckSpec::LogAbsent(c) => (&c.name, format!("log lacks '{}'", c.pattern)),
            CheckSpec::Dependency(c) => (&c.name, format!("dependency {} {}", c.library, c.status)),
            CheckSpec::LogLevelMax(c) => (
                &c.name,
                format!("at most {} {}+ entries", c.max, c.level),
            ),
        };
        explicit.clone().unwrap_or(derived)
    }

    /// Evaluated while the subject is running
    pub fn is_live(&self) -> bool {
        matches!(self, CheckSpec::Http(_) | CheckSpec::Websocket(_))
    }

    pub fn needs_auth(&self) -> bool {
        matches!(self, CheckSpec::Http(c) if c.auth)
    }

    fn pattern(&self) -> Option<&PatternCheck> {
        match self {
            CheckSpec::LogContains(c) | CheckSpec::LogAbsent(c) => Some(c),
            _ => None,
        }
    }
}

impl SuiteDefinition {
    pub fn load(path: &Path) -> SuiteResult<Self> {
        let raw = read_to_string(path)?;
        let mut definition = Self::parse(&raw)?;
        definition.source = Some(path.to_path_buf());
        Ok(definition)
    }

    /// Expand `${env.NAME}` placeholders, parse and validate.
    pub fn parse(text: &str) -> SuiteResult<Self> {
        let expanded = expand_env(text)?;
        let definition: SuiteDefinition =
            toml::from_str(&expanded).map_err(ConfigError::from)?;
        definition.validate()?;
        Ok(definition)
    }

    fn invalid(&self, message: impl Into<String>) -> SuiteError {
        SuiteError::Invalid {
            suite: self.name.clone(),
            message: message.into(),
        }
    }

    pub fn validate(&self) -> SuiteResult<()> {
        if self.name.trim().is_empty() {
            return Err(self.invalid("name cannot be empty"));
        }

        if self.subject.is_none() && self.tasks.run.is_empty() {
            return Err(self.invalid("nothing to run: no [subject] and no tasks"));
        }

        if self.tasks.jobs == 0 {
            return Err(self.invalid("tasks.jobs must be at least 1"));
        }

        if self.auth.is_some() && self.probe.is_none() {
            return Err(self.invalid("[auth] requires [probe]"));
        }

        if let Some(probe) = &self.probe {
            probe
                .to_probe_config()
                .validate()
                .map_err(|message| self.invalid(message))?;
        }

        for check in &self.checks {
            let name = check.display_name();

            if self.subject.is_none() {
                return Err(self.invalid(format!("check '{}' requires [subject]", name)));
            }

            if check.is_live() && self.probe.is_none() {
                return Err(self.invalid(format!("check '{}' requires [probe]", name)));
            }

            if check.needs_auth() && self.auth.is_none() {
                return Err(self.invalid(format!("check '{}' requires [auth]", name)));
            }

            if let Some(pattern) = check.pattern() {
                if pattern.regex {
                    Regex::new(&pattern.pattern).map_err(|e| {
                        self.invalid(format!("check '{}' has a bad regex: {}", name, e))
                    })?;
                }
            }
        }

        Ok(())
    }

    pub fn live_checks(&self) -> impl Iterator<Item = &CheckSpec> {
        self.checks.iter().filter(|c| c.is_live())
    }

    pub fn post_checks(&self) -> impl Iterator<Item = &CheckSpec> {
        self.checks.iter().filter(|c| !c.is_live())
    }
}

/// Filesystem-safe form of a suite name
pub(crate) fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Runs one suite against a fresh subject
pub struct SuiteRunner {
    definition: SuiteDefinition,
    results_dir: PathBuf,
    keep_results: bool,
}

impl SuiteRunner {
    pub fn new(definition: SuiteDefinition, results_dir: impl Into<PathBuf>) -> Self {
        let keep_results = definition.tasks.keep_results;
        Self {
            definition,
            results_dir: results_dir.into(),
            keep_results,
        }
    }

    pub fn keep_results(mut self, keep: bool) -> Self {
        self.keep_results = self.keep_results || keep;
        self
    }

    pub async fn run(self) -> TestReport {
        let def = &self.definition;
        let mut report = TestReport::new(&def.name);
        info!("Suite '{}' starting", def.name);

        let subject_config = def
            .subject
            .as_ref()
            .map(|spec| spec.to_subject_config(&def.name, &self.results_dir));

        let mut subject: Option<SubjectHandle> = None;
        let mut ready = false;

        if let Some(config) = &subject_config {
            let started = Instant::now();
            match start_subject(config) {
                Ok(handle) => {
                    report.record_timed("start subject", started.elapsed(), Ok::<(), String>(()));
                    subject = Some(handle);
                }
                Err(e) => report.fail("start subject", e.to_string()),
            }

            match subject.as_mut() {
                Some(handle) => {
                    match handle
                        .wait_for_marker(&config.startup_marker, config.startup_timeout)
                        .await
                    {
                        Ok(elapsed) => {
                            report.record_timed("startup marker", elapsed, Ok::<(), String>(()));
                            ready = true;
                        }
                        Err(e) => report.fail("startup marker", e.to_string()),
                    }
                }
                None => report.fail("startup marker", NOT_RUNNING),
            }
        }

        let probe_config = def.probe.as_ref().map(ProbeSpec::to_probe_config);
        let http = probe_config
            .clone()
            .map(|config| HttpProbe::new(config).map_err(|e| e.to_string()));

        let mut token: Option<String> = None;
        if let Some(auth) = &def.auth {
            if !ready {
                report.fail("acquire token", NOT_RUNNING);
            } else {
                match &http {
                    Some(Ok(http)) => {
                        let started = Instant::now();
                        let result = http.acquire_token(&auth.path, &auth.login_request()).await;
                        match result {
                            Ok(grant) => {
                                report.record_timed(
                                    "acquire token",
                                    started.elapsed(),
                                    Ok::<(), String>(()),
                                );
                                token = Some(grant.token);
                            }
                            Err(e) => report.fail("acquire token", e.to_string()),
                        }
                    }
                    Some(Err(reason)) => report.fail("acquire token", reason.clone()),
                    None => report.fail("acquire token", "no [probe] configured"),
                }
            }
        }

        for check in def.live_checks() {
            let name = check.display_name();
            if !ready {
                report.fail(name, NOT_RUNNING);
                continue;
            }

            let (elapsed, result) = match check {
                CheckSpec::Http(spec) => match &http {
                    Some(Ok(http)) => run_http_check(http, spec, token.as_deref()).await,
                    Some(Err(reason)) => (Duration::ZERO, Err(reason.clone())),
                    None => (Duration::ZERO, Err("no [probe] configured".to_string())),
                },
                CheckSpec::Websocket(spec) => match &probe_config {
                    Some(config) => run_websocket_check(config, spec).await,
                    None => (Duration::ZERO, Err("no [probe] configured".to_string())),
                },
                _ => continue,
            };
            report.record_timed(name, elapsed, result);
        }

        if !def.tasks.run.is_empty() {
            self.run_tasks(&mut report).await;
        }

        if let Some(config) = &subject_config {
            let stop_name = format!("shutdown within {}s", config.shutdown_timeout.as_secs());
            match subject.as_mut() {
                Some(handle) => {
                    match handle
                        .shutdown(config.shutdown_timeout, &config.shutdown_marker)
                        .await
                    {
                        Ok(stop) => {
                            if stop.forced {
                                report.fail(stop_name, "ignored SIGINT and was killed");
                            } else {
                                report.record_timed(stop_name, stop.elapsed, Ok::<(), String>(()));
                            }
                            if stop.marker_seen {
                                report.pass("shutdown marker");
                            } else {
                                report.fail(
                                    "shutdown marker",
                                    format!("'{}' not in log", config.shutdown_marker),
                                );
                            }
                        }
                        Err(e) => {
                            report.fail(stop_name, e.to_string());
                            report.fail("shutdown marker", e.to_string());
                        }
                    }
                }
                None => {
                    report.fail(stop_name, NOT_RUNNING);
                    report.fail("shutdown marker", NOT_RUNNING);
                }
            }

            let scanner = LogScanner::open(&config.log_file);
            for check in def.post_checks() {
                let name = check.display_name();
                if subject.is_none() {
                    report.fail(name, NOT_RUNNING);
                    continue;
                }
                let result = evaluate_log_check(&scanner, check);
                report.record(name, result);
            }
        }

        report.finish();
        info!(
            "Suite '{}' finished: {}/{} passed",
            def.name,
            report.passed(),
            report.total()
        );
        report
    }

    async fn run_tasks(&self, report: &mut TestReport) {
        let tasks = &self.definition.tasks;
        let dir = self
            .results_dir
            .join("tasks")
            .join(file_stem(&self.definition.name));

        let outcomes = run_commands(tasks.run.clone(), tasks.jobs, &dir).await;
        for outcome in outcomes {
            let name = format!("task {}", outcome.name);
            let path = match outcome.result {
                Ok(path) => path,
                Err(e) => {
                    report.fail(name, e.to_string());
                    continue;
                }
            };

            let result = match ResultRecord::read(&path) {
                Ok(record) => task_status(&record),
                Err(e) => Err(e.to_string()),
            };
            report.record_timed(name, outcome.elapsed, result);

            if !self.keep_results {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("Could not remove {}: {}", path.display(), e);
                }
            }
        }
    }
}

fn task_status(record: &ResultRecord) -> Result<(), String> {
    match record.get("status") {
        Some("0") => Ok(()),
        Some(status) => {
            let tail = record.get("stderr_tail").unwrap_or_default();
            if tail.is_empty() {
                Err(format!("exit status {}", status))
            } else {
                Err(format!("exit status {}: {}", status, tail))
            }
        }
        None => Err("result file has no status".to_string()),
    }
}

async fn run_http_check(
    http: &HttpProbe,
    spec: &HttpCheck,
    token: Option<&str>,
) -> (Duration, Result<(), String>) {
    let mut request = ProbeRequest::new(spec.method, &spec.path);
    if let Some(body) = &spec.body {
        request = request.with_body(body.clone());
    }
    if spec.auth {
        match token {
            Some(token) => request = request.with_bearer(token),
            None => return (Duration::ZERO, Err(NO_TOKEN.to_string())),
        }
    }

    match http.exchange(request).await {
        Ok(response) => (response.latency, verify_http(spec, &response)),
        Err(e) => (Duration::ZERO, Err(e.to_string())),
    }
}

fn verify_http(spec: &HttpCheck, response: &ProbeResponse) -> Result<(), String> {
    if response.status != spec.expect_status {
        return Err(format!(
            "expected status {}, got {}",
            spec.expect_status, response.status
        ));
    }

    for (pointer, expected) in &spec.expect_fields {
        match response.field(pointer) {
            Some(actual) if &actual == expected => {}
            Some(actual) => {
                return Err(format!(
                    "field {} is {}, expected {}",
                    pointer, actual, expected
                ))
            }
            None => return Err(format!("field {} missing from response", pointer)),
        }
    }

    if let Some(needle) = &spec.expect_body_contains {
        if !response.body.contains(needle.as_str()) {
            return Err(format!("body does not contain '{}'", needle));
        }
    }

    Ok(())
}

async fn run_websocket_check(
    config: &ProbeConfig,
    spec: &WebSocketCheck,
) -> (Duration, Result<(), String>) {
    let mut config = config.clone();
    if !spec.use_key {
        config.websocket_key = None;
    }

    let probe = match WebSocketProbe::new(config) {
        Ok(probe) => probe,
        Err(e) => return (Duration::ZERO, Err(e.to_string())),
    };

    let mut request = ProbeRequest::get(&spec.path);
    if let Some(message) = &spec.message {
        request = request.with_body(message.clone());
    }

    match probe.exchange(request).await {
        Ok(response) => {
            let result = match &spec.expect_contains {
                Some(needle) if !response.body.contains(needle.as_str()) => Err(format!(
                    "reply '{}' does not contain '{}'",
                    response.body, needle
                )),
                _ => Ok(()),
            };
            (response.latency, result)
        }
        Err(e) => (Duration::ZERO, Err(e.to_string())),
    }
}

fn evaluate_log_check(scanner: &LogScanner, check: &CheckSpec) -> Result<(), String> {
    let check_result = || -> Result<Result<(), String>, LogScanError> {
        Ok(match check {
            CheckSpec::LogContains(c) => {
                let found = if c.regex {
                    !scanner.matches(&c.pattern)?.is_empty()
                } else {
                    scanner.contains(&c.pattern)?
                };
                if found {
                    Ok(())
                } else {
                    Err(format!("'{}' not found in log", c.pattern))
                }
            }
            CheckSpec::LogAbsent(c) => {
                let hits = if c.regex {
                    scanner.matches(&c.pattern)?
                } else {
                    scanner
                        .lines()?
                        .into_iter()
                        .filter(|line| line.contains(c.pattern.as_str()))
                        .collect()
                };
                match hits.first() {
                    None => Ok(()),
                    Some(first) => Err(format!(
                        "{} matching line(s), first: {}",
                        hits.len(),
                        first.trim()
                    )),
                }
            }
            CheckSpec::Dependency(c) => match scanner.dependency(&c.library)? {
                Some(dep) if dep.status == c.status => Ok(()),
                Some(dep) => Err(format!(
                    "{} status is {}, expected {}",
                    c.library, dep.status, c.status
                )),
                None => Err(format!("no dependency line for {}", c.library)),
            },
            CheckSpec::LogLevelMax(c) => {
                let count = scanner.entries_at_least(c.level)?.len();
                if count <= c.max {
                    Ok(())
                } else {
                    Err(format!(
                        "{} entries at {} or above, at most {} allowed",
                        count, c.level, c.max
                    ))
                }
            }
            CheckSpec::Http(_) | CheckSpec::Websocket(_) => Ok(()),
        })
    };

    check_result().unwrap_or_else(|e| Err(e.to_string()))
}
