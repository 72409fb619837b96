//! Parsing and searching the subject's log output.
//!
//! Lines look like
//!
//! ```text
//! 2025-01-01 12:00:00.123  [ STATE ]  [ DepCheck   ]  jansson Expecting: 2.13 Found: 2.13 Status: Good
//! ```
//!
//! and the timestamp is optional, since console captures sometimes strip it.

use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LogScanError {
    #[error("Cannot read log {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Unknown log level '{0}'")]
    UnknownLevel(String),
}

pub type LogScanResult<T> = Result<T, LogScanError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE", try_from = "String")]
pub enum LogLevel {
    Trace,
    Debug,
    State,
    Alert,
    Error,
    Fatal,
    Quiet,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::State => "STATE",
            LogLevel::Alert => "ALERT",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
            LogLevel::Quiet => "QUIET",
        };
        write!(f, "{}", label)
    }
}

impl TryFrom<String> for LogLevel {
    type Error = LogScanError;

    fn try_from(value: String) -> Result<Self, <LogLevel as TryFrom<String>>::Error> {
        value.parse()
    }
}

impl FromStr for LogLevel {
    type Err = LogScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TRACE" => Ok(LogLevel::Trace),
            "DEBUG" => Ok(LogLevel::Debug),
            "STATE" => Ok(LogLevel::State),
            "ALERT" => Ok(LogLevel::Alert),
            "ERROR" => Ok(LogLevel::Error),
            "FATAL" => Ok(LogLevel::Fatal),
            "QUIET" => Ok(LogLevel::Quiet),
            other => Err(LogScanError::UnknownLevel(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub timestamp: Option<NaiveDateTime>,
    pub level: LogLevel,
    pub subsystem: String,
    pub message: String,
}

fn line_pattern() -> &'static Regex {
    static LINE: OnceLock<Regex> = OnceLock::new();
    LINE.get_or_init(|| {
        Regex::new(
            r"^(?:(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}(?:\.\d{1,6})?)\s+)?\[\s*([A-Za-z]+)\s*\]\s+\[\s*([^\]]*?)\s*\]\s*(.*)$",
        )
        .expect("log line regex is valid")
    })
}

fn dependency_pattern() -> &'static Regex {
    static DEPENDENCY: OnceLock<Regex> = OnceLock::new();
    DEPENDENCY.get_or_init(|| {
        Regex::new(r"^(\S+)\s+Expecting:\s*(\S+)\s+Found:\s*(\S+)\s+Status:\s*(.+?)\s*$")
            .expect("dependency regex is valid")
    })
}

impl LogEntry {
    /// Parse one log line; anything not in the subject's format yields `None`.
    pub fn parse(line: &str) -> Option<LogEntry> {
        let caps = line_pattern().captures(line.trim_end())?;
        let level = caps[2].parse().ok()?;
        let timestamp = caps
            .get(1)
            .and_then(|m| NaiveDateTime::parse_from_str(m.as_str(), "%Y-%m-%d %H:%M:%S%.f").ok());

        Some(LogEntry {
            timestamp,
            level,
            subsystem: caps[3].to_string(),
            message: caps[4].trim_end().to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependencyStatus {
    #[serde(rename = "Good")]
    Good,
    #[serde(rename = "Less Good")]
    LessGood,
    #[serde(rename = "Trouble awaits")]
    TroubleAwaits,
    #[serde(rename = "Unknown")]
    Unknown,
}

impl DependencyStatus {
    pub fn parse(text: &str) -> Self {
        match text.trim() {
            "Good" => DependencyStatus::Good,
            "Less Good" => DependencyStatus::LessGood,
            "Trouble awaits" => DependencyStatus::TroubleAwaits,
            _ => DependencyStatus::Unknown,
        }
    }
}

impl fmt::Display for DependencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DependencyStatus::Good => "Good",
            DependencyStatus::LessGood => "Less Good",
            DependencyStatus::TroubleAwaits => "Trouble awaits",
            DependencyStatus::Unknown => "Unknown",
        };
        write!(f, "{}", label)
    }
}

/// One library line from the startup dependency check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyReport {
    pub library: String,
    pub expected: String,
    pub found: Option<String>,
    pub status: DependencyStatus,
}

impl DependencyReport {
    pub fn parse(message: &str) -> Option<DependencyReport> {
        let caps = dependency_pattern().captures(message)?;
        let found = match &caps[3] {
            "None" => None,
            version => Some(version.to_string()),
        };

        Some(DependencyReport {
            library: caps[1].to_string(),
            expected: caps[2].to_string(),
            found,
            status: DependencyStatus::parse(&caps[4]),
        })
    }
}

/// Read-only view over a log file. Every query rereads the file so it can be
/// used while the subject is still writing.
#[derive(Debug, Clone)]
pub struct LogScanner {
    path: PathBuf,
}

impl LogScanner {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lines(&self) -> LogScanResult<Vec<String>> {
        let bytes = std::fs::read(&self.path).map_err(|source| LogScanError::Io {
            path: self.path.display().to_string(),
            source,
        })?;
        Ok(String::from_utf8_lossy(&bytes)
            .lines()
            .map(str::to_string)
            .collect())
    }

    pub fn entries(&self) -> LogScanResult<Vec<LogEntry>> {
        Ok(self
            .lines()?
            .iter()
            .filter_map(|line| LogEntry::parse(line))
            .collect())
    }

    pub fn contains(&self, needle: &str) -> LogScanResult<bool> {
        Ok(self.lines()?.iter().any(|line| line.contains(needle)))
    }

    pub fn count(&self, needle: &str) -> LogScanResult<usize> {
        Ok(self
            .lines()?
            .iter()
            .filter(|line| line.contains(needle))
            .count())
    }

    /// Lines matching a regular expression.
    pub fn matches(&self, pattern: &str) -> LogScanResult<Vec<String>> {
        let regex = Regex::new(pattern)?;
        Ok(self
            .lines()?
            .into_iter()
            .filter(|line| regex.is_match(line))
            .collect())
    }

    pub fn entries_at_least(&self, level: LogLevel) -> LogScanResult<Vec<LogEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|entry| entry.level >= level)
            .collect())
    }

    pub fn entries_for(&self, subsystem: &str) -> LogScanResult<Vec<LogEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|entry| entry.subsystem.eq_ignore_ascii_case(subsystem))
            .collect())
    }

    /// Every dependency line, whichever subsystem label it was logged under.
    pub fn dependencies(&self) -> LogScanResult<Vec<DependencyReport>> {
        Ok(self
            .entries()?
            .iter()
            .filter_map(|entry| DependencyReport::parse(&entry.message))
            .collect())
    }

    /// The last report logged for `library`.
    pub fn dependency(&self, library: &str) -> LogScanResult<Option<DependencyReport>> {
        Ok(self
            .dependencies()?
            .into_iter()
            .rev()
            .find(|report| report.library == library))
    }
}
