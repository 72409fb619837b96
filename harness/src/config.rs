//! Harness configuration and `${env.NAME}` placeholder expansion.
//!
//! Both the harness config and every suite file go through [`expand_env`]
//! before TOML parsing, so credentials and key material can stay in the
//! environment instead of on disk.

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable '{name}' referenced as ${{env.{name}}} is not set")]
    MissingEnv { name: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HarnessConfig {
    pub run: RunConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Glob used to discover suite files
    pub suites: String,
    /// Where result files and run summaries are written
    pub results_dir: PathBuf,
    /// Number of suites allowed to run at once
    pub jobs: usize,
    /// Keep per-task result files after analysis
    pub keep_results: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            suites: "suites/*.toml".to_string(),
            results_dir: PathBuf::from("target/harness"),
            jobs: 1,
            keep_results: false,
        }
    }
}

impl HarnessConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> ConfigResult<Self> {
        let raw = read_to_string(path)?;
        let config: HarnessConfig = toml::from_str(&expand_env(&raw)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.run.jobs = jobs;
        self
    }

    pub fn with_results_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.run.results_dir = dir.into();
        self
    }

    pub fn with_suites(mut self, pattern: impl Into<String>) -> Self {
        self.run.suites = pattern.into();
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.run.jobs == 0 {
            return Err(ConfigError::Invalid {
                message: "run.jobs must be at least 1".to_string(),
            });
        }

        if self.run.suites.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "run.suites cannot be empty".to_string(),
            });
        }

        Ok(())
    }
}

pub(crate) fn read_to_string(path: &Path) -> ConfigResult<String> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\$\{env\.([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex is valid")
    })
}

/// Replace every `${env.NAME}` with the variable's value. Values landing in
/// a basic string are escaped for it, values in a literal string are copied
/// as they are, and comments are left alone.
pub fn expand_env(text: &str) -> ConfigResult<String> {
    let mut missing = None;
    let mut expanded = String::with_capacity(text.len());

    for (region, run) in regions(text) {
        match region {
            Region::Comment => expanded.push_str(run),
            Region::Literal => {
                expanded.push_str(&substitute(run, &mut missing, |value| value.to_string()))
            }
            Region::Code | Region::Basic => {
                expanded.push_str(&substitute(run, &mut missing, escape_toml))
            }
        }
    }

    match missing {
        Some(name) => Err(ConfigError::MissingEnv { name }),
        None => Ok(expanded),
    }
}

fn substitute(text: &str, missing: &mut Option<String>, escape: fn(&str) -> String) -> String {
    placeholder()
        .replace_all(text, |caps: &Captures| {
            let name = &caps[1];
            match std::env::var(name) {
                Ok(value) => escape(&value),
                Err(_) => {
                    missing.get_or_insert_with(|| name.to_string());
                    String::new()
                }
            }
        })
        .into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Code,
    Basic,
    Literal,
    Comment,
}

/// Split TOML text into lexical runs. Multi-line strings count as their
/// single-line kind, and an unterminated single-line string ends at the
/// newline.
fn regions(text: &str) -> Vec<(Region, &str)> {
    const BASIC_MULTI: &[u8] = b"\"\"\"";
    const LITERAL_MULTI: &[u8] = b"'''";

    let bytes = text.as_bytes();
    let mut runs = Vec::new();
    let mut region = Region::Code;
    let mut multi = false;
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let rest = &bytes[i..];
        match region {
            Region::Code => {
                let opened = if rest.starts_with(BASIC_MULTI) {
                    Some((Region::Basic, true, 3))
                } else if rest.starts_with(LITERAL_MULTI) {
                    Some((Region::Literal, true, 3))
                } else {
                    match rest[0] {
                        b'"' => Some((Region::Basic, false, 1)),
                        b'\'' => Some((Region::Literal, false, 1)),
                        b'#' => Some((Region::Comment, false, 1)),
                        _ => None,
                    }
                };
                match opened {
                    Some((next, is_multi, len)) => {
                        if start < i {
                            runs.push((region, &text[start..i]));
                        }
                        start = i;
                        region = next;
                        multi = is_multi;
                        i += len;
                    }
                    None => i += 1,
                }
            }
            Region::Basic | Region::Literal => {
                let quote: &[u8] = match (region, multi) {
                    (Region::Basic, true) => BASIC_MULTI,
                    (Region::Basic, false) => b"\"",
                    (_, true) => LITERAL_MULTI,
                    (_, false) => b"'",
                };
                if region == Region::Basic && rest[0] == b'\\' {
                    i += 2;
                } else if rest.starts_with(quote) {
                    i += quote.len();
                    runs.push((region, &text[start..i]));
                    start = i;
                    region = Region::Code;
                } else if !multi && rest[0] == b'\n' {
                    runs.push((region, &text[start..i]));
                    start = i;
                    region = Region::Code;
                } else {
                    i += 1;
                }
            }
            Region::Comment => {
                if rest[0] == b'\n' {
                    runs.push((region, &text[start..i]));
                    start = i;
                    region = Region::Code;
                } else {
                    i += 1;
                }
            }
        }
    }

    if start < bytes.len() {
        runs.push((region, &text[start..]));
    }
    runs
}

fn escape_toml(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            other => escaped.push(other),
        }
    }
    escaped
}
