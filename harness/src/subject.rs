//! Lifecycle of the binary under test.
//!
//! The subject is spawned with its JSON config path as the only argument,
//! its stdout and stderr both land in one log file, and every wait loop polls
//! at [`POLL_INTERVAL`].

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Error, Debug)]
pub enum SubjectError {
    #[error("Subject binary '{path}' not found")]
    BinaryNotFound { path: String },

    #[error("Subject binary '{path}' is not executable")]
    NotExecutable { path: String },

    #[error("Failed to spawn '{binary}': {reason}")]
    SpawnFailed { binary: String, reason: String },

    #[error("'{marker}' not seen in the log within {timeout_secs}s")]
    StartupTimeout { marker: String, timeout_secs: u64 },

    #[error("Subject exited early with {}", describe_code(.code))]
    ExitedEarly { code: Option<i32> },

    #[error("Failed to signal pid {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    }
}

pub type SubjectResult<T> = Result<T, SubjectError>;

#[derive(Debug, Clone)]
pub struct SubjectConfig {
    /// Path to the server executable
    pub binary: PathBuf,
    /// JSON config passed as the sole argument
    pub config_path: Option<PathBuf>,
    /// Receives both stdout and stderr
    pub log_file: PathBuf,
    pub working_dir: Option<PathBuf>,
    pub env_vars: Vec<(String, String)>,
    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub startup_marker: String,
    pub shutdown_marker: String,
}

impl Default for SubjectConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("./hydrogen"),
            config_path: None,
            log_file: PathBuf::from("target/harness/logs/subject.log"),
            working_dir: None,
            env_vars: Vec::new(),
            startup_timeout: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(10),
            startup_marker: "STARTUP COMPLETE".to_string(),
            shutdown_marker: "SHUTDOWN COMPLETE".to_string(),
        }
    }
}

/// Outcome of stopping the subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
    /// The subject ignored SIGINT and had to be killed
    pub forced: bool,
    pub marker_seen: bool,
}

/// Handle for a running subject
#[derive(Debug)]
pub struct SubjectHandle {
    pub pid: u32,
    pub log_file: PathBuf,
    pub started_at: Instant,
    child: Child,
    exited: Option<ExitStatus>,
}

impl Drop for SubjectHandle {
    fn drop(&mut self) {
        if self.exited.is_none() {
            let _ = self.child.start_kill();
        }
    }
}

/// Check that the binary exists and can be executed
pub fn locate_binary(path: &Path) -> SubjectResult<PathBuf> {
    let metadata = std::fs::metadata(path).map_err(|_| SubjectError::BinaryNotFound {
        path: path.display().to_string(),
    })?;

    if !metadata.is_file() {
        return Err(SubjectError::BinaryNotFound {
            path: path.display().to_string(),
        });
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(SubjectError::NotExecutable {
                path: path.display().to_string(),
            });
        }
    }

    Ok(path.to_path_buf())
}

impl SubjectConfig {
    /// Absolute path of the binary that will run. A relative `binary` is
    /// taken from `working_dir` when one is set, since that is where the
    /// child starts.
    pub fn resolved_binary(&self) -> SubjectResult<PathBuf> {
        let path = match &self.working_dir {
            Some(dir) if self.binary.is_relative() => dir.join(&self.binary),
            _ => self.binary.clone(),
        };
        if path.is_absolute() {
            Ok(path)
        } else {
            Ok(std::env::current_dir()?.join(path))
        }
    }
}

/// Spawn the subject with its output redirected to the configured log file
pub fn start_subject(config: &SubjectConfig) -> SubjectResult<SubjectHandle> {
    let binary = locate_binary(&config.resolved_binary()?)?;

    if let Some(parent) = config.log_file.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let stdout = File::create(&config.log_file)?;
    let stderr = stdout.try_clone()?;

    let mut cmd = Command::new(&binary);
    if let Some(config_path) = &config.config_path {
        cmd.arg(config_path);
    }
    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }
    for (key, value) in &config.env_vars {
        cmd.env(key, value);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| SubjectError::SpawnFailed {
        binary: binary.display().to_string(),
        reason: e.to_string(),
    })?;

    let pid = child.id().ok_or_else(|| SubjectError::SpawnFailed {
        binary: binary.display().to_string(),
        reason: "process exited before its pid could be read".to_string(),
    })?;

    info!("Started {} (pid {})", binary.display(), pid);

    Ok(SubjectHandle {
        pid,
        log_file: config.log_file.clone(),
        started_at: Instant::now(),
        child,
        exited: None,
    })
}

/// Whether any line of the log contains `needle`. A log that does not exist
/// yet contains nothing.
pub fn log_contains(path: &Path, needle: &str) -> SubjectResult<bool> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).contains(needle)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

impl SubjectHandle {
    fn poll_exit(&mut self) -> SubjectResult<Option<ExitStatus>> {
        if self.exited.is_none() {
            self.exited = self.child.try_wait()?;
        }
        Ok(self.exited)
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.poll_exit(), Ok(None))
    }

    /// Poll the log until `marker` shows up, returning the time it took.
    pub async fn wait_for_marker(
        &mut self,
        marker: &str,
        timeout: Duration,
    ) -> SubjectResult<Duration> {
        let start = Instant::now();

        loop {
            if log_contains(&self.log_file, marker)? {
                let elapsed = start.elapsed();
                info!("pid {}: '{}' after {:?}", self.pid, marker, elapsed);
                return Ok(elapsed);
            }

            if let Some(status) = self.poll_exit()? {
                warn!("pid {} exited before '{}'", self.pid, marker);
                return Err(SubjectError::ExitedEarly {
                    code: status.code(),
                });
            }

            if start.elapsed() >= timeout {
                return Err(SubjectError::StartupTimeout {
                    marker: marker.to_string(),
                    timeout_secs: timeout.as_secs(),
                });
            }

            sleep(POLL_INTERVAL).await;
        }
    }

    /// Ask the subject to stop, escalating to a kill after `timeout`.
    pub async fn shutdown(
        &mut self,
        timeout: Duration,
        marker: &str,
    ) -> SubjectResult<ShutdownReport> {
        let start = Instant::now();
        let mut forced = false;

        if self.poll_exit()?.is_none() {
            self.interrupt()?;

            while self.poll_exit()?.is_none() {
                if start.elapsed() >= timeout {
                    warn!(
                        "pid {} still running after {:?}, killing it",
                        self.pid, timeout
                    );
                    self.child.start_kill()?;
                    self.exited = Some(self.child.wait().await?);
                    forced = true;
                    break;
                }
                sleep(POLL_INTERVAL).await;
            }
        }

        let elapsed = start.elapsed();
        let marker_seen = log_contains(&self.log_file, marker)?;
        let exit_code = self.exited.and_then(|status| status.code());

        info!(
            "pid {} stopped in {:?} (code {:?}, forced {})",
            self.pid, elapsed, exit_code, forced
        );

        Ok(ShutdownReport {
            exit_code,
            elapsed,
            forced,
            marker_seen,
        })
    }

    #[cfg(unix)]
    fn interrupt(&mut self) -> SubjectResult<()> {
        debug!("Sending SIGINT to pid {}", self.pid);
        let pid = libc::pid_t::try_from(self.pid).map_err(|_| SubjectError::SignalFailed {
            pid: self.pid,
            reason: "pid out of range".to_string(),
        })?;

        // SAFETY: kill(2) with a pid we spawned and still own the handle for.
        let rc = unsafe { libc::kill(pid, libc::SIGINT) };
        if rc != 0 {
            return Err(SubjectError::SignalFailed {
                pid: self.pid,
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn interrupt(&mut self) -> SubjectResult<()> {
        debug!("No SIGINT on this platform, killing pid {}", self.pid);
        self.child.start_kill()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_config_default() {
        let config = SubjectConfig::default();
        assert_eq!(config.startup_marker, "STARTUP COMPLETE");
        assert_eq!(config.shutdown_marker, "SHUTDOWN COMPLETE");
        assert_eq!(config.startup_timeout, Duration::from_secs(15));
        assert!(config.config_path.is_none());
    }

    #[test]
    fn test_locate_missing_binary() {
        let result = locate_binary(Path::new("/nonexistent/hydrogen"));
        assert!(matches!(result, Err(SubjectError::BinaryNotFound { .. })));
    }

    #[test]
    fn test_locate_directory_is_not_a_binary() {
        let dir = tempfile::tempdir().unwrap();
        let result = locate_binary(dir.path());
        assert!(matches!(result, Err(SubjectError::BinaryNotFound { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_locate_non_executable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hydrogen");
        std::fs::write(&path, "not a program").unwrap();
        let result = locate_binary(&path);
        assert!(matches!(result, Err(SubjectError::NotExecutable { .. })));
    }

    #[test]
    fn test_log_contains_missing_file() {
        assert!(!log_contains(Path::new("/nonexistent/log"), "anything").unwrap());
    }

    #[test]
    fn test_log_contains() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subject.log");
        std::fs::write(&path, "a\n[ STATE ]  [ Startup ]  STARTUP COMPLETE\n").unwrap();
        assert!(log_contains(&path, "STARTUP COMPLETE").unwrap());
        assert!(!log_contains(&path, "SHUTDOWN COMPLETE").unwrap());
    }

    #[test]
    fn test_error_display() {
        let error = SubjectError::ExitedEarly { code: Some(3) };
        assert_eq!(error.to_string(), "Subject exited early with exit code 3");

        let error = SubjectError::ExitedEarly { code: None };
        assert!(error.to_string().contains("a signal"));

        let error = SubjectError::StartupTimeout {
            marker: "STARTUP COMPLETE".to_string(),
            timeout_secs: 15,
        };
        assert!(error.to_string().contains("15s"));
    }

    #[test]
    fn test_resolved_binary_follows_working_dir() {
        let config = SubjectConfig {
            binary: PathBuf::from("./hydrogen"),
            working_dir: Some(PathBuf::from("/srv/work")),
            ..SubjectConfig::default()
        };
        assert_eq!(
            config.resolved_binary().unwrap(),
            PathBuf::from("/srv/work/./hydrogen")
        );

        let config = SubjectConfig {
            binary: PathBuf::from("/bin/sh"),
            working_dir: Some(PathBuf::from("/srv/work")),
            ..SubjectConfig::default()
        };
        assert_eq!(config.resolved_binary().unwrap(), PathBuf::from("/bin/sh"));

        let config = SubjectConfig::default();
        assert!(config.resolved_binary().unwrap().is_absolute());
    }

    #[cfg(unix)]
    fn write_script(path: &Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::write(path, body).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_relative_binary_runs_from_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        std::fs::create_dir(&work).unwrap();
        write_script(&work.join("inner-subject.sh"), "#!/bin/sh\necho INNER\n");

        let config = SubjectConfig {
            binary: PathBuf::from("./inner-subject.sh"),
            working_dir: Some(work.clone()),
            log_file: dir.path().join("logs/inner.log"),
            ..SubjectConfig::default()
        };

        let mut handle = start_subject(&config).unwrap();
        let result = handle
            .wait_for_marker("STARTUP COMPLETE", Duration::from_secs(5))
            .await;
        assert!(matches!(
            result,
            Err(SubjectError::ExitedEarly { code: Some(0) })
        ));
        assert_eq!(std::fs::read_to_string(&config.log_file).unwrap(), "INNER\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_relative_binary_missing_from_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        std::fs::create_dir(&work).unwrap();
        write_script(&dir.path().join("outer-subject.sh"), "#!/bin/sh\necho OUTER\n");

        let config = SubjectConfig {
            binary: PathBuf::from("./outer-subject.sh"),
            working_dir: Some(work),
            log_file: dir.path().join("logs/outer.log"),
            ..SubjectConfig::default()
        };

        let result = start_subject(&config);
        assert!(matches!(result, Err(SubjectError::BinaryNotFound { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_and_exit_early() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("early.sh");
        std::fs::write(&script, "echo booting\nexit 3\n").unwrap();

        let config = SubjectConfig {
            binary: PathBuf::from("/bin/sh"),
            config_path: Some(script),
            log_file: dir.path().join("logs/early.log"),
            ..SubjectConfig::default()
        };

        let mut handle = start_subject(&config).unwrap();
        let result = handle
            .wait_for_marker("STARTUP COMPLETE", Duration::from_secs(5))
            .await;
        assert!(matches!(
            result,
            Err(SubjectError::ExitedEarly { code: Some(3) })
        ));
        assert!(!handle.is_running());
        assert!(log_contains(&config.log_file, "booting").unwrap());
    }
}
