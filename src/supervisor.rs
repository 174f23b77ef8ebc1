//! Backend process supervision
//!
//! [`BackendSupervisor`] makes sure a single backend process has been
//! launched before traffic is forwarded. Launching is fire-and-forget: the
//! supervisor does not wait for the backend to accept connections unless a
//! readiness timeout is configured.

use crate::config::BackendConfig;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Interval between connect attempts while waiting for the backend port
const READY_POLL_INTERVAL_MS: u64 = 50;

/// State of the backend process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BackendState {
    /// No launch has been attempted yet
    NotStarted = 0,
    /// A launch is in progress
    Starting = 1,
    /// The process was launched and has not exited
    Running = 2,
    /// The last launch failed or the process exited
    Failed = 3,
}

impl BackendState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => BackendState::Starting,
            2 => BackendState::Running,
            3 => BackendState::Failed,
            _ => BackendState::NotStarted,
        }
    }
}

/// What `ensure_running` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// The backend was already running; nothing was done
    AlreadyRunning,
    /// Another caller is launching the backend right now
    Starting,
    /// This call launched the backend
    Launched,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The OS refused to start the backend process
    #[error("failed to spawn backend '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: io::Error,
    },
    /// A relaunch was suppressed because the last failure is too recent
    #[error("backend relaunch suppressed for another {}ms", .remaining.as_millis())]
    BackingOff { remaining: Duration },
}

/// Resolves with the exit code once the launched process terminates
pub type ExitFuture = BoxFuture<'static, io::Result<Option<i32>>>;

/// A freshly launched backend process
pub struct LaunchedProcess {
    /// OS process id, when known
    pub pid: Option<u32>,
    /// Completes when the process exits
    pub exited: ExitFuture,
}

/// Starts backend processes. Swapped out in tests.
pub trait ProcessLauncher: Send + Sync + 'static {
    fn launch(&self, config: &BackendConfig) -> io::Result<LaunchedProcess>;
}

/// Launches the configured command as a detached child process
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandLauncher;

impl ProcessLauncher for CommandLauncher {
    fn launch(&self, config: &BackendConfig) -> io::Result<LaunchedProcess> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        cmd.stdin(Stdio::null());

        let (stdout, stderr) = backend_output(config)?;
        cmd.stdout(stdout);
        cmd.stderr(stderr);

        if let Some(ref working_dir) = config.working_dir {
            cmd.current_dir(working_dir);
        }

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        // Tell the backend which port it is expected to serve on
        cmd.env("PORT", config.port.to_string());

        // Own process group: terminal signals aimed at the proxy do not reach it
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let pid = child.id();

        let exited: ExitFuture = async move {
            let status = child.wait().await?;
            Ok(status.code())
        }
        .boxed();

        Ok(LaunchedProcess { pid, exited })
    }
}

/// Where backend stdout/stderr go: an append-mode log file or nowhere
fn backend_output(config: &BackendConfig) -> io::Result<(Stdio, Stdio)> {
    match config.log_file {
        Some(ref path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let err_file = file.try_clone()?;
            Ok((Stdio::from(file), Stdio::from(err_file)))
        }
        None => Ok((Stdio::null(), Stdio::null())),
    }
}

struct SupervisorInner {
    /// Incremented on every launch so stale exit notifications are ignored
    generation: u64,
    pid: Option<u32>,
    last_failure: Option<Instant>,
    launches: u64,
}

/// Owns the state of the single backend process.
///
/// Created behind an `Arc` and shared by every connection task. The
/// `Running` fast path is a single atomic load; the decision to launch is
/// serialized by a mutex so concurrent cold requests launch exactly once.
/// The supervisor never stops the backend.
pub struct BackendSupervisor {
    config: BackendConfig,
    launcher: Arc<dyn ProcessLauncher>,
    state: AtomicU8,
    inner: Mutex<SupervisorInner>,
}

impl BackendSupervisor {
    /// Create a supervisor that launches `config.command` as a child process
    pub fn new(config: BackendConfig) -> Arc<Self> {
        Self::with_launcher(config, Arc::new(CommandLauncher))
    }

    /// Create a supervisor with a custom launcher
    pub fn with_launcher(config: BackendConfig, launcher: Arc<dyn ProcessLauncher>) -> Arc<Self> {
        Arc::new(Self {
            config,
            launcher,
            state: AtomicU8::new(BackendState::NotStarted as u8),
            inner: Mutex::new(SupervisorInner {
                generation: 0,
                pid: None,
                last_failure: None,
                launches: 0,
            }),
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Current state (lock-free)
    pub fn state(&self) -> BackendState {
        BackendState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: BackendState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// PID of the most recently launched process, while it is running
    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().pid
    }

    /// Number of successful launches so far
    pub fn launch_count(&self) -> u64 {
        self.inner.lock().launches
    }

    /// Make sure the backend has been launched.
    ///
    /// Returns immediately when the backend is running or being launched by
    /// another caller. Otherwise launches it and returns without waiting for
    /// it to accept connections.
    pub fn ensure_running(self: &Arc<Self>) -> Result<EnsureOutcome, SupervisorError> {
        if self.state() == BackendState::Running {
            return Ok(EnsureOutcome::AlreadyRunning);
        }

        let generation = {
            let mut inner = self.inner.lock();
            match self.state() {
                BackendState::Running => return Ok(EnsureOutcome::AlreadyRunning),
                BackendState::Starting => return Ok(EnsureOutcome::Starting),
                BackendState::NotStarted | BackendState::Failed => {}
            }

            if let Some(failed_at) = inner.last_failure {
                let backoff = self.config.respawn_backoff();
                let elapsed = failed_at.elapsed();
                if elapsed < backoff {
                    return Err(SupervisorError::BackingOff {
                        remaining: backoff - elapsed,
                    });
                }
            }

            self.set_state(BackendState::Starting);
            inner.generation += 1;
            inner.generation
        };

        info!(
            command = %self.config.command,
            args = ?self.config.args,
            working_dir = ?self.config.working_dir,
            "Starting backend"
        );

        // Launch outside the lock; concurrent callers observe Starting
        match self.launcher.launch(&self.config) {
            Ok(launched) => {
                {
                    let mut inner = self.inner.lock();
                    inner.pid = launched.pid;
                    inner.launches += 1;
                    inner.last_failure = None;
                    self.set_state(BackendState::Running);
                }
                info!(pid = ?launched.pid, generation, "Backend process spawned");
                self.watch_exit(generation, launched.exited);
                Ok(EnsureOutcome::Launched)
            }
            Err(e) => {
                {
                    let mut inner = self.inner.lock();
                    inner.pid = None;
                    inner.last_failure = Some(Instant::now());
                    self.set_state(BackendState::Failed);
                }
                error!(command = %self.config.command, error = %e, "Failed to spawn backend");
                Err(SupervisorError::SpawnFailed {
                    command: self.config.command.clone(),
                    source: e,
                })
            }
        }
    }

    /// Move to Failed when the process launched as `generation` exits
    fn watch_exit(self: &Arc<Self>, generation: u64, exited: ExitFuture) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let result = exited.await;

            let mut inner = supervisor.inner.lock();
            if inner.generation != generation || supervisor.state() != BackendState::Running {
                debug!(generation, "Ignoring exit of superseded backend process");
                return;
            }
            inner.pid = None;
            inner.last_failure = Some(Instant::now());
            supervisor.set_state(BackendState::Failed);

            match result {
                Ok(code) => warn!(generation, exit_code = ?code, "Backend process exited"),
                Err(e) => warn!(generation, error = %e, "Lost track of backend process"),
            }
        });
    }

    /// Poll the backend port until it accepts a connection or `timeout` passes
    pub async fn wait_until_listening(&self, timeout: Duration) -> bool {
        let authority = self.config.authority();
        let start = Instant::now();

        loop {
            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                debug!(%authority, "Backend not listening before readiness timeout");
                return false;
            }

            if let Ok(Ok(_)) = tokio::time::timeout(remaining, TcpStream::connect(&authority)).await {
                debug!(%authority, waited_ms = start.elapsed().as_millis(), "Backend is listening");
                return true;
            }

            tokio::time::sleep(Duration::from_millis(READY_POLL_INTERVAL_MS).min(remaining)).await;
        }
    }
}
