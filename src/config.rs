//! Runtime configuration.
//!
//! Everything has a default, so `FlowConfig::default()` is usable as is. A
//! JSON file can override any subset of fields, and two environment variables
//! override the paths most often changed on developer machines:
//!
//! - `FLOW_BACKEND_PATH`: backend executable
//! - `FLOW_STORAGE_ROOT`: parent of the per-session storage directories

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::notification::DEFAULT_NOTIFICATION_BUFFER;
use crate::writer::DEFAULT_MAX_PENDING_FRAMES;

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default window for the backend to open its endpoint.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time between SIGTERM and SIGKILL.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Backend executable looked up on `PATH` when no path is configured.
/// Upper bound accepted for every configured timeout.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

pub const DEFAULT_BACKEND_PROGRAM: &str = "flowappglue";

pub const ENV_BACKEND_PATH: &str = "FLOW_BACKEND_PATH";
pub const ENV_STORAGE_ROOT: &str = "FLOW_STORAGE_ROOT";

mod serde_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// How to launch and stop the backend process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Executable name or path. Bare names are resolved on `PATH`.
    pub program: PathBuf,
    /// Extra arguments appended after `--data-dir` and `--endpoint`.
    pub args: Vec<String>,
    /// File receiving the backend's stderr. Discarded when unset.
    pub log_file: Option<PathBuf>,
    #[serde(with = "serde_millis")]
    pub startup_timeout: Duration,
    #[serde(with = "serde_millis")]
    pub stop_grace: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_BACKEND_PROGRAM),
            args: Vec::new(),
            log_file: None,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

/// Server settings forwarded to the backend in the `Config` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    /// Server identifier sent with onboarding calls.
    pub uri: String,
    /// Schema directory shipped with the backend. Must exist when set.
    pub schema_dir: Option<PathBuf>,
    /// Attachment directory. Defaults to `attachments/` inside the session
    /// storage directory.
    pub attachment_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "flow.spideroak.com".to_string(),
            port: 443,
            use_tls: true,
            uri: "flow.spideroak.com".to_string(),
            schema_dir: None,
            attachment_dir: None,
        }
    }
}

/// Top-level configuration for a [`crate::Flow`] instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub backend: BackendConfig,
    pub server: ServerConfig,
    /// Per-session directories are created below this root.
    pub storage_root: PathBuf,
    #[serde(with = "serde_millis")]
    pub call_timeout: Duration,
    /// Notifications kept for `wait_for_notification` before the oldest is
    /// dropped.
    pub notification_buffer: usize,
    /// Buffer notifications from session start rather than from the first
    /// `wait_for_notification`.
    pub buffer_notifications: bool,
    pub max_pending_frames: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            server: ServerConfig::default(),
            storage_root: default_storage_root(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            notification_buffer: DEFAULT_NOTIFICATION_BUFFER,
            buffer_notifications: false,
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
        }
    }
}

/// `<user config dir>/flow`, or `./flow` when the platform has none.
pub fn default_storage_root() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("flow")
}

impl FlowConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| FlowError::Config(format!("{}: {}", path.display(), e)))?;
        let config: FlowConfig = serde_json::from_str(&raw)
            .map_err(|e| FlowError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `FLOW_BACKEND_PATH` and `FLOW_STORAGE_ROOT` when set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(program) = std::env::var_os(ENV_BACKEND_PATH) {
            self.backend.program = PathBuf::from(program);
        }
        if let Some(root) = std::env::var_os(ENV_STORAGE_ROOT) {
            self.storage_root = PathBuf::from(root);
        }
        self
    }

    pub fn with_backend_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.backend.program = program.into();
        self
    }

    pub fn with_backend_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.backend.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_backend_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.backend.log_file = Some(path.into());
        self
    }

    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = root.into();
        self
    }

    pub fn with_server(mut self, server: ServerConfig) -> Self {
        self.server = server;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.backend.startup_timeout = timeout;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.backend.stop_grace = grace;
        self
    }

    pub fn with_notification_buffer(mut self, capacity: usize) -> Self {
        self.notification_buffer = capacity;
        self
    }

    pub fn with_buffered_notifications(mut self, enabled: bool) -> Self {
        self.buffer_notifications = enabled;
        self
    }

    /// Reject values no session could run with.
    pub fn validate(&self) -> Result<()> {
        if self.backend.program.as_os_str().is_empty() {
            return Err(FlowError::Config("backend program is empty".into()));
        }
        if self.call_timeout.is_zero() {
            return Err(FlowError::Config("call_timeout must be non-zero".into()));
        }
        if self.backend.startup_timeout.is_zero() {
            return Err(FlowError::Config("startup_timeout must be non-zero".into()));
        }
        for (name, value) in [
            ("call_timeout", self.call_timeout),
            ("startup_timeout", self.backend.startup_timeout),
            ("stop_grace", self.backend.stop_grace),
        ] {
            if value > MAX_TIMEOUT {
                return Err(FlowError::Config(format!(
                    "{} must not exceed {:?}",
                    name, MAX_TIMEOUT
                )));
            }
        }
        if self.notification_buffer == 0 {
            return Err(FlowError::Config("notification_buffer must be non-zero".into()));
        }
        if self.max_pending_frames == 0 {
            return Err(FlowError::Config("max_pending_frames must be non-zero".into()));
        }
        Ok(())
    }

    /// Storage directory for one session.
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.storage_root.join(session_id)
    }
}
