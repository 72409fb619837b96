//! Flat `key=value` result files.
//!
//! A launch phase writes one file per job, an analysis phase reads them back.
//! File names carry a v4 UUID so parallel writers never collide.

use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ResultError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid result key '{key}'")]
    InvalidKey { key: String },

    #[error("Value for '{key}' contains a newline")]
    InvalidValue { key: String },

    #[error("{path}:{line}: expected key=value")]
    Malformed { path: String, line: usize },

    #[error("Invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

pub type ResultsResult<T> = Result<T, ResultError>;

pub const RESULT_EXTENSION: &str = "result";

/// Writer side of a result file
#[derive(Debug)]
pub struct ResultFile {
    path: PathBuf,
}

impl ResultFile {
    pub fn create(dir: &Path, stem: &str) -> ResultsResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}-{}.{}", stem, Uuid::new_v4(), RESULT_EXTENSION));
        std::fs::File::create(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, key: &str, value: impl ToString) -> ResultsResult<()> {
        validate_key(key)?;
        let value = value.to_string();
        if value.contains('\n') || value.contains('\r') {
            return Err(ResultError::InvalidValue {
                key: key.to_string(),
            });
        }

        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        writeln!(file, "{}={}", key, value)?;
        Ok(())
    }

    pub fn remove(self) -> ResultsResult<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

fn validate_key(key: &str) -> ResultsResult<()> {
    if key.is_empty() || key.contains('=') || key.chars().any(char::is_whitespace) {
        return Err(ResultError::InvalidKey {
            key: key.to_string(),
        });
    }
    Ok(())
}

/// Reader side: the parsed lines of one result file, in file order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultRecord {
    pub path: PathBuf,
    pub entries: Vec<(String, String)>,
}

impl ResultRecord {
    pub fn read(path: &Path) -> ResultsResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut entries = Vec::new();

        for (index, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| ResultError::Malformed {
                path: path.display().to_string(),
                line: index + 1,
            })?;
            entries.push((key.trim().to_string(), value.to_string()));
        }

        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    /// Last value written for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read every `<stem>-*.result` in `dir`, sorted by path.
pub fn collect(dir: &Path, stem: &str) -> ResultsResult<Vec<ResultRecord>> {
    let pattern = format!(
        "{}/{}-*.{}",
        glob::Pattern::escape(&dir.to_string_lossy()),
        glob::Pattern::escape(stem),
        RESULT_EXTENSION
    );
    let mut paths: Vec<PathBuf> = glob::glob(&pattern)?
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    paths.iter().map(|p| ResultRecord::read(p)).collect()
}
