//! Subtest bookkeeping and run summaries.
//!
//! A [`TestReport`] is the pass/fail ledger of one suite. Its exit code is 0
//! exactly when every recorded subtest passed, and a report with no subtests
//! counts as a failure.

use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::Serialize;
use std::fmt::Display;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Coloured, human-readable lines
    Text,
    /// Pretty-printed JSON
    Json,
}

/// Human-readable rendering alongside `Serialize`.
pub trait Render {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()>;
}

/// Write `payload` to stdout in the requested format.
pub fn emit<T: Render + Serialize>(payload: &T, format: OutputFormat) -> std::io::Result<()> {
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    match format {
        OutputFormat::Text => payload.render_text(&mut handle)?,
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut handle, payload)?;
            writeln!(handle)?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail { reason: String },
}

impl Outcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, Outcome::Pass)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Subtest {
    pub name: String,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub suite: String,
    pub subtests: Vec<Subtest>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TestReport {
    pub fn new(suite: impl Into<String>) -> Self {
        Self {
            suite: suite.into(),
            subtests: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn push(&mut self, name: impl Into<String>, outcome: Outcome, elapsed: Duration) {
        let name = name.into();
        match &outcome {
            Outcome::Pass => tracing::debug!("[{}] PASS {}", self.suite, name),
            Outcome::Fail { reason } => {
                tracing::warn!("[{}] FAIL {}: {}", self.suite, name, reason)
            }
        }
        self.subtests.push(Subtest {
            name,
            outcome,
            elapsed_ms: elapsed.as_millis() as u64,
        });
    }

    pub fn pass(&mut self, name: impl Into<String>) {
        self.push(name, Outcome::Pass, Duration::ZERO);
    }

    pub fn fail(&mut self, name: impl Into<String>, reason: impl Into<String>) {
        self.push(
            name,
            Outcome::Fail {
                reason: reason.into(),
            },
            Duration::ZERO,
        );
    }

    pub fn record<E: Display>(&mut self, name: impl Into<String>, result: Result<(), E>) {
        self.record_timed(name, Duration::ZERO, result);
    }

    pub fn record_timed<E: Display>(
        &mut self,
        name: impl Into<String>,
        elapsed: Duration,
        result: Result<(), E>,
    ) {
        let outcome = match result {
            Ok(()) => Outcome::Pass,
            Err(e) => Outcome::Fail {
                reason: e.to_string(),
            },
        };
        self.push(name, outcome, elapsed);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn passed(&self) -> usize {
        self.subtests.iter().filter(|s| s.outcome.is_pass()).count()
    }

    pub fn failed(&self) -> usize {
        self.total() - self.passed()
    }

    pub fn total(&self) -> usize {
        self.subtests.len()
    }

    pub fn is_success(&self) -> bool {
        self.total() > 0 && self.passed() == self.total()
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &Subtest> {
        self.subtests.iter().filter(|s| !s.outcome.is_pass())
    }
}

impl Render for TestReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        writeln!(w, "{}", self.suite.bold())?;
        for subtest in &self.subtests {
            match &subtest.outcome {
                Outcome::Pass => writeln!(w, "  {}  {}", "PASS".green(), subtest.name)?,
                Outcome::Fail { reason } => {
                    writeln!(w, "  {}  {}: {}", "FAIL".red(), subtest.name, reason)?
                }
            }
        }

        let tally = format!("{}/{} passed", self.passed(), self.total());
        let tally = if self.is_success() {
            tally.green()
        } else {
            tally.red()
        };
        writeln!(w, "  {}: {}", self.suite, tally)?;
        Ok(())
    }
}

/// Aggregate of every suite run in one invocation
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub reports: Vec<TestReport>,
}

impl Default for RunSummary {
    fn default() -> Self {
        Self::new()
    }
}

impl RunSummary {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            reports: Vec::new(),
        }
    }

    pub fn add(&mut self, report: TestReport) {
        self.reports.push(report);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn passed(&self) -> usize {
        self.reports.iter().map(TestReport::passed).sum()
    }

    pub fn failed(&self) -> usize {
        self.reports.iter().map(TestReport::failed).sum()
    }

    pub fn total(&self) -> usize {
        self.reports.iter().map(TestReport::total).sum()
    }

    pub fn suites_passed(&self) -> usize {
        self.reports.iter().filter(|r| r.is_success()).count()
    }

    pub fn is_success(&self) -> bool {
        !self.reports.is_empty() && self.reports.iter().all(TestReport::is_success)
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    /// Write `summary-<run_id>.json` into `dir`.
    pub fn write_json(&self, dir: &Path) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("summary-{}.json", self.run_id));
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;
        Ok(path)
    }
}

impl Render for RunSummary {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        for report in &self.reports {
            report.render_text(w)?;
        }

        writeln!(w)?;
        let line = format!(
            "{} of {} suites passed, {} of {} subtests passed",
            self.suites_passed(),
            self.reports.len(),
            self.passed(),
            self.total()
        );
        if self.is_success() {
            writeln!(w, "{}", line.green().bold())?;
        } else {
            writeln!(w, "{}", line.red().bold())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(render: &dyn Render) -> String {
        colored::control::set_override(false);
        let mut buf = Vec::new();
        render.render_text(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_counters_add_up() {
        let mut report = TestReport::new("startup");
        report.pass("start subject");
        report.fail("health endpoint", "status 503");
        report.record("shutdown", Ok::<(), String>(()));
        report.record("marker", Err::<(), _>("missing"));

        assert_eq!(report.total(), 4);
        assert_eq!(report.passed(), 2);
        assert_eq!(report.failed(), 2);
        assert_eq!(report.passed() + report.failed(), report.total());
        assert!(!report.is_success());
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.failures().count(), 2);
    }

    #[test]
    fn test_all_passed_is_success() {
        let mut report = TestReport::new("startup");
        report.pass("a");
        report.record_timed("b", Duration::from_millis(42), Ok::<(), String>(()));

        assert!(report.is_success());
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.subtests[1].elapsed_ms, 42);
    }

    #[test]
    fn test_empty_report_is_not_success() {
        let report = TestReport::new("empty");
        assert_eq!(report.total(), 0);
        assert!(!report.is_success());
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_report_text_rendering() {
        let mut report = TestReport::new("api");
        report.pass("health endpoint");
        report.fail("login", "no bearer token");

        let text = plain(&report);
        assert!(text.contains("PASS  health endpoint"));
        assert!(text.contains("FAIL  login: no bearer token"));
        assert!(text.contains("api: 1/2 passed"));
    }

    #[test]
    fn test_report_serialization() {
        let mut report = TestReport::new("api");
        report.fail("login", "rejected");
        report.finish();

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["suite"], "api");
        assert_eq!(json["subtests"][0]["result"], "fail");
        assert_eq!(json["subtests"][0]["reason"], "rejected");
        assert!(json["finished_at"].is_string());
    }

    #[test]
    fn test_summary_totals() {
        let mut ok = TestReport::new("ok");
        ok.pass("a");
        ok.pass("b");
        let mut bad = TestReport::new("bad");
        bad.pass("a");
        bad.fail("b", "nope");

        let mut summary = RunSummary::new();
        summary.add(ok);
        summary.add(bad);
        summary.finish();

        assert_eq!(summary.total(), 4);
        assert_eq!(summary.passed(), 3);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.suites_passed(), 1);
        assert!(!summary.is_success());
        assert_eq!(summary.exit_code(), 1);

        let text = plain(&summary);
        assert!(text.contains("1 of 2 suites passed, 3 of 4 subtests passed"));
    }

    #[test]
    fn test_empty_summary_is_not_success() {
        let summary = RunSummary::new();
        assert!(!summary.is_success());
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn test_summary_write_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut report = TestReport::new("ok");
        report.pass("a");
        let mut summary = RunSummary::new();
        summary.add(report);

        let path = summary.write_json(dir.path()).unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("summary-"));

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["run_id"], summary.run_id.to_string());
        assert_eq!(value["reports"][0]["suite"], "ok");
    }
}
