//! Backend process supervision.
//!
//! One backend process per session. The supervisor launches it with its data
//! directory and a fresh endpoint, connects to that endpoint once the backend
//! has bound it, and on shutdown sends SIGTERM, waits a grace period, then
//! kills. The child is always reaped by the supervisor; callers never see a
//! raw `Child`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::error::{FlowError, Result};
use crate::transport::{generate_endpoint_path, PipeCleanup, PipeStream};

const INITIAL_CONNECT_BACKOFF: Duration = Duration::from_millis(10);
const MAX_CONNECT_BACKOFF: Duration = Duration::from_millis(500);
const WRITE_PROBE: &str = ".flow-write-probe";

/// A running (or already stopped) backend instance.
#[derive(Debug)]
pub struct ProcessHandle {
    session_id: String,
    child: Option<Child>,
    pid: Option<u32>,
    endpoint: String,
    storage_dir: PathBuf,
    _cleanup: PipeCleanup,
}

impl ProcessHandle {
    fn new(session_id: &str, child: Child, endpoint: String, storage_dir: &Path) -> Self {
        let pid = child.id();
        Self {
            session_id: session_id.to_string(),
            child: Some(child),
            pid,
            _cleanup: PipeCleanup::new(endpoint.clone()),
            endpoint,
            storage_dir: storage_dir.to_path_buf(),
        }
    }

    /// OS process id, kept after the process has exited.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// True once `stop` has reaped the process.
    pub fn is_stopped(&self) -> bool {
        self.child.is_none()
    }

    /// Send SIGKILL without waiting. For synchronous teardown paths; the
    /// runtime reaps the child once the handle is dropped.
    pub fn start_kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.start_kill() {
                debug!(session = %self.session_id, error = %e, "start_kill failed");
            }
        }
    }
}

/// Launches and stops backend processes.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    config: BackendConfig,
}

impl ProcessSupervisor {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Launch a backend for `session_id` and connect to it.
    ///
    /// # Errors
    ///
    /// `FlowError::Launch` when the binary is missing, the storage directory
    /// is not writable, the process cannot be spawned or exits early, or the
    /// endpoint does not accept connections within `startup_timeout`. A
    /// process that was spawned is stopped before the error is returned.
    pub async fn start(
        &self,
        storage_dir: &Path,
        session_id: &str,
    ) -> Result<(ProcessHandle, PipeStream)> {
        let program = resolve_program(&self.config.program)?;
        prepare_storage(storage_dir)?;

        let endpoint = generate_endpoint_path();
        let child = self.spawn(&program, storage_dir, &endpoint)?;
        let mut handle = ProcessHandle::new(session_id, child, endpoint, storage_dir);

        info!(
            session = %session_id,
            pid = ?handle.pid,
            endpoint = %handle.endpoint,
            "backend spawned"
        );

        match self.connect(&mut handle).await {
            Ok(stream) => Ok((handle, stream)),
            Err(e) => {
                if let Err(stop_err) = self.stop(&mut handle).await {
                    warn!(session = %session_id, error = %stop_err, "failed to stop half-started backend");
                }
                Err(e)
            }
        }
    }

    fn spawn(&self, program: &Path, storage_dir: &Path, endpoint: &str) -> Result<Child> {
        let stderr = match &self.config.log_file {
            Some(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| {
                        FlowError::Launch(format!("cannot open log {}: {}", path.display(), e))
                    })?;
                Stdio::from(file)
            }
            None => Stdio::null(),
        };

        Command::new(program)
            .arg("--data-dir")
            .arg(storage_dir)
            .arg("--endpoint")
            .arg(endpoint)
            .args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FlowError::Launch(format!("cannot spawn {}: {}", program.display(), e)))
    }

    /// Poll the endpoint with exponential backoff until it accepts.
    async fn connect(&self, handle: &mut ProcessHandle) -> Result<PipeStream> {
        let deadline = Instant::now().checked_add(self.config.startup_timeout);
        let mut delay = INITIAL_CONNECT_BACKOFF;
        let mut attempts = 0u32;

        loop {
            if let Some(child) = handle.child.as_mut() {
                let exited = child
                    .try_wait()
                    .map_err(|e| FlowError::Launch(format!("cannot poll backend: {}", e)))?;
                if let Some(status) = exited {
                    return Err(FlowError::Launch(format!(
                        "backend exited during start-up ({})",
                        status
                    )));
                }
            }

            attempts += 1;
            match PipeStream::connect(&handle.endpoint).await {
                Ok(stream) => {
                    debug!(session = %handle.session_id, attempts, "connected to backend");
                    return Ok(stream);
                }
                Err(e) => debug!(session = %handle.session_id, attempts, error = %e, "endpoint not ready"),
            }

            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                return Err(FlowError::Launch(format!(
                    "endpoint {} did not accept within {:?}",
                    handle.endpoint, self.config.startup_timeout
                )));
            }
            let remaining = deadline.map_or(delay, |deadline| deadline - now);
            tokio::time::sleep(delay.min(remaining)).await;
            delay = (delay * 2).min(MAX_CONNECT_BACKOFF);
        }
    }

    /// Stop the backend: SIGTERM, wait up to `stop_grace`, then SIGKILL.
    ///
    /// Idempotent. Only a failure to kill a still-running process is
    /// returned; everything else is logged.
    pub async fn stop(&self, handle: &mut ProcessHandle) -> Result<()> {
        let Some(mut child) = handle.child.take() else {
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!(session = %handle.session_id, %status, "backend already exited");
            return Ok(());
        }

        request_exit(&mut child, handle.pid);

        match tokio::time::timeout(self.config.stop_grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(session = %handle.session_id, %status, "backend exited");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(session = %handle.session_id, error = %e, "waiting for backend failed");
                Ok(())
            }
            Err(_) => {
                warn!(
                    session = %handle.session_id,
                    grace = ?self.config.stop_grace,
                    "backend ignored SIGTERM, killing"
                );
                child.kill().await?;
                Ok(())
            }
        }
    }
}

#[cfg(unix)]
fn request_exit(child: &mut Child, pid: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        let _ = child.start_kill();
        return;
    };
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            warn!(pid, error = %e, "SIGTERM failed, killing");
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn request_exit(child: &mut Child, _pid: Option<u32>) {
    // No graceful signal for console-less children on Windows.
    let _ = child.start_kill();
}

/// Resolve the backend executable. Bare names are searched on `PATH`.
pub(crate) fn resolve_program(program: &Path) -> Result<PathBuf> {
    if program.components().count() > 1 || program.is_absolute() {
        if program.is_file() {
            return Ok(program.to_path_buf());
        }
        return Err(FlowError::Launch(format!(
            "backend binary not found: {}",
            program.display()
        )));
    }

    let paths = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&paths) {
        let candidate = dir.join(program);
        if candidate.is_file() {
            return Ok(candidate);
        }
        #[cfg(windows)]
        {
            let exe = candidate.with_extension("exe");
            if exe.is_file() {
                return Ok(exe);
            }
        }
    }

    Err(FlowError::Launch(format!(
        "backend binary {} not found on PATH",
        program.display()
    )))
}

/// Create the storage directory (owner-only on Unix) and check it accepts
/// writes.
pub(crate) fn prepare_storage(dir: &Path) -> Result<()> {
    let unwritable = |e: std::io::Error| {
        FlowError::Launch(format!(
            "storage directory {} is not writable: {}",
            dir.display(),
            e
        ))
    };

    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir).map_err(unwritable)?;

    let probe = dir.join(WRITE_PROBE);
    std::fs::write(&probe, b"").map_err(unwritable)?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}
