//! Spawning and stopping detached worker processes.
//!
//! Workers are plain `queuectl worker run` processes. The supervisor records
//! their pids in a JSON file so a later `worker stop` or `status` can find
//! them; the processes themselves coordinate only through the job store.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Where detached workers write their logs unless told otherwise.
pub const DEFAULT_LOG_FILE: &str = "queuectl-workers.log";

/// Errors from managing worker processes.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to spawn worker: {0}")]
    Spawn(io::Error),

    #[error("failed to signal worker {pid}: {source}")]
    Signal { pid: u32, source: io::Error },

    #[error("pid file is malformed: {0}")]
    PidFile(#[from] serde_json::Error),
}

/// A running (or once-running) worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerHandle {
    pub pid: u32,
}

/// Starts and stops worker processes.
pub trait WorkerSupervisor {
    /// Launch up to `count` detached workers, stopping at the first failure.
    ///
    /// Workers launched before the failure are still reported so they can be
    /// recorded.
    fn start(&self, count: u32) -> StartReport;

    /// Ask each worker to shut down gracefully. Returns the per-worker failures.
    fn stop(&self, handles: &[WorkerHandle]) -> Vec<SupervisorError>;

    /// Whether the process behind `handle` still exists.
    fn is_alive(&self, handle: WorkerHandle) -> bool;
}

/// Result of a `worker start`.
#[derive(Debug, Default)]
pub struct StartReport {
    pub started: Vec<WorkerHandle>,
    pub failure: Option<SupervisorError>,
}

/// Runs workers as child processes of the current executable.
pub struct ProcessSupervisor {
    exe: PathBuf,
    db: PathBuf,
    log_file: PathBuf,
}

impl ProcessSupervisor {
    /// Supervise workers of the running binary against `db`.
    pub fn new(db: impl Into<PathBuf>) -> Result<Self, SupervisorError> {
        Ok(Self {
            exe: std::env::current_exe()?,
            db: db.into(),
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
        })
    }

    /// Append worker output to `log_file` instead of the default.
    pub fn with_log_file(mut self, log_file: impl Into<PathBuf>) -> Self {
        self.log_file = log_file.into();
        self
    }

    fn open_log(&self) -> Result<File, SupervisorError> {
        Ok(OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)?)
    }

    fn spawn_one(&self) -> Result<WorkerHandle, SupervisorError> {
        let log = self.open_log()?;
        let mut command = Command::new(&self.exe);
        command
            .arg("--db")
            .arg(&self.db)
            .args(["worker", "run"])
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log);
        detach(&mut command);

        let child = command.spawn().map_err(SupervisorError::Spawn)?;
        Ok(WorkerHandle { pid: child.id() })
    }
}

impl WorkerSupervisor for ProcessSupervisor {
    fn start(&self, count: u32) -> StartReport {
        let mut report = StartReport::default();

        for _ in 0..count {
            match self.spawn_one() {
                Ok(handle) => {
                    info!(pid = handle.pid, "started worker");
                    report.started.push(handle);
                }
                Err(e) => {
                    warn!(error = %e, started = report.started.len(), "failed to start worker");
                    report.failure = Some(e);
                    break;
                }
            }
        }

        report
    }

    fn stop(&self, handles: &[WorkerHandle]) -> Vec<SupervisorError> {
        handles
            .iter()
            .filter_map(|handle| match terminate(handle.pid) {
                Ok(()) => {
                    info!(pid = handle.pid, "sent SIGTERM to worker");
                    None
                }
                Err(source) => {
                    warn!(pid = handle.pid, error = %source, "failed to stop worker");
                    Some(SupervisorError::Signal {
                        pid: handle.pid,
                        source,
                    })
                }
            })
            .collect()
    }

    fn is_alive(&self, handle: WorkerHandle) -> bool {
        process_exists(handle.pid)
    }
}

/// Put the child in its own process group so it outlives the terminal.
#[cfg(unix)]
fn detach(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(unix))]
fn detach(_command: &mut Command) {}

#[cfg(unix)]
fn terminate(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;

    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "signalling workers requires a unix platform",
    ))
}

#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };

    // Signal 0 checks for existence; EPERM still means the process is there
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_exists(_pid: u32) -> bool {
    false
}

#[derive(Debug, Serialize, Deserialize)]
struct PidFileContents {
    #[serde(default)]
    workers: Vec<WorkerHandle>,
}

/// JSON record of started workers: `{"workers": [pid, ...]}`.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Recorded workers. A missing file means none.
    pub fn load(&self) -> Result<Vec<WorkerHandle>, SupervisorError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }

        let contents: PidFileContents = serde_json::from_str(&raw)?;
        Ok(contents.workers)
    }

    pub fn save(&self, workers: &[WorkerHandle]) -> Result<(), SupervisorError> {
        let contents = PidFileContents {
            workers: workers.to_vec(),
        };
        std::fs::write(&self.path, serde_json::to_string_pretty(&contents)?)?;
        Ok(())
    }

    pub fn clear(&self) -> Result<(), SupervisorError> {
        self.save(&[])
    }
}

/// Start `count` workers and append them to the pid file.
///
/// Every worker that did start is recorded, even when a later one fails; the
/// failure is left in the returned report.
pub fn start_workers(
    supervisor: &dyn WorkerSupervisor,
    pid_file: &PidFile,
    count: u32,
) -> Result<StartReport, SupervisorError> {
    let mut recorded = pid_file.load()?;
    let report = supervisor.start(count);

    if !report.started.is_empty() {
        recorded.extend(report.started.iter().copied());
        pid_file.save(&recorded)?;
    }
    Ok(report)
}

/// Result of a `worker stop`.
#[derive(Debug)]
pub struct StopReport {
    pub signalled: usize,
    pub failures: Vec<SupervisorError>,
}

/// Signal every recorded worker, then clear the pid file.
///
/// Workers that cannot be signalled (usually already gone) are reported, not
/// treated as fatal.
pub fn stop_workers(
    supervisor: &dyn WorkerSupervisor,
    pid_file: &PidFile,
) -> Result<StopReport, SupervisorError> {
    let recorded = pid_file.load()?;
    if recorded.is_empty() {
        return Ok(StopReport {
            signalled: 0,
            failures: Vec::new(),
        });
    }

    let failures = supervisor.stop(&recorded);
    pid_file.clear()?;

    Ok(StopReport {
        signalled: recorded.len() - failures.len(),
        failures,
    })
}
