//! One account's live connection to its backend.
//!
//! A [`Session`] bundles the backend process, the writer task, the call
//! engine, the dispatcher task and the notification buffer of one
//! identifier. Sessions are created by the registry; [`Session::attach`]
//! builds one over an already-connected stream instead of a spawned backend.
//!
//! Lifecycle:
//!
//! ```text
//! STARTING ──onboarding ok──► ACTIVE ──terminate / channel lost──► TERMINATING ──► TERMINATED
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::callbacks::{CallbackId, CallbackRegistry, Handler};
use crate::config::{FlowConfig, DEFAULT_CALL_TIMEOUT};
use crate::dispatcher::{
    spawn_dispatcher, wait_stopped, DispatchTargets, DispatcherHandle, DispatcherState,
};
use crate::engine::CallEngine;
use crate::error::{Disconnect, FlowError, Result};
use crate::notification::{NotificationCategory, NotificationEvent, DEFAULT_NOTIFICATION_BUFFER};
use crate::queue::NotificationQueue;
use crate::supervisor::{ProcessHandle, ProcessSupervisor};
use crate::transport::FrameReader;
use crate::writer::{spawn_writer_task, WriterConfig, DEFAULT_MAX_PENDING_FRAMES};

const DISPATCHER_STOP_TIMEOUT: Duration = Duration::from_secs(2);
const WRITER_STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Starting = 0,
    Active = 1,
    Terminating = 2,
    Terminated = 3,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => SessionState::Starting,
            1 => SessionState::Active,
            2 => SessionState::Terminating,
            _ => SessionState::Terminated,
        }
    }

    /// Starting or active.
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Active)
    }
}

/// Session state shared with the dispatcher task.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: SessionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// STARTING → ACTIVE. False when the session already left STARTING.
    pub fn activate(&self) -> bool {
        self.0
            .compare_exchange(
                SessionState::Starting as u8,
                SessionState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move a live session to TERMINATING. No-op otherwise.
    pub fn begin_terminating(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                SessionState::from_u8(raw)
                    .is_live()
                    .then_some(SessionState::Terminating as u8)
            });
    }
}

/// Per-session knobs.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub storage_dir: PathBuf,
    pub call_timeout: Duration,
    pub notification_buffer: usize,
    /// Buffer notifications from the start instead of from the first
    /// `wait_for_notification`.
    pub buffer_notifications: bool,
    pub max_pending_frames: usize,
}

impl SessionOptions {
    /// Options for `session_id` under `config`.
    pub fn from_config(config: &FlowConfig, session_id: &str) -> Self {
        Self {
            storage_dir: config.session_dir(session_id),
            call_timeout: config.call_timeout,
            notification_buffer: config.notification_buffer,
            buffer_notifications: config.buffer_notifications,
            max_pending_frames: config.max_pending_frames,
        }
    }

    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = dir.into();
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_buffered_notifications(mut self, enabled: bool) -> Self {
        self.buffer_notifications = enabled;
        self
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::new(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            notification_buffer: DEFAULT_NOTIFICATION_BUFFER,
            buffer_notifications: false,
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
        }
    }
}

pub struct Session {
    id: String,
    storage_dir: PathBuf,
    call_timeout: Duration,
    state: Arc<StateCell>,
    engine: Arc<CallEngine>,
    callbacks: Arc<CallbackRegistry>,
    queue: Arc<NotificationQueue>,
    dispatcher_state: watch::Receiver<DispatcherState>,
    dispatcher: Mutex<Option<DispatcherHandle>>,
    writer_task: Mutex<Option<JoinHandle<Result<()>>>>,
    process: Mutex<Option<ProcessHandle>>,
    supervisor: Option<ProcessSupervisor>,
    teardown: tokio::sync::Mutex<()>,
}

impl Session {
    /// Spawn a backend for `id` and wire a session to it. The session starts
    /// in STARTING; the registry activates it after onboarding.
    pub(crate) async fn launch(
        id: &str,
        supervisor: ProcessSupervisor,
        callbacks: Arc<CallbackRegistry>,
        options: SessionOptions,
    ) -> Result<Self> {
        // 1. Spawn the backend and connect to its endpoint
        let (process, stream) = supervisor.start(&options.storage_dir, id).await?;

        // 2. Split the stream between writer task and dispatcher
        let (read_half, write_half) = stream.into_split();

        // 3. Assemble engine, buffer and tasks
        let session = Self::assemble(
            id,
            read_half,
            write_half,
            callbacks,
            options,
            SessionState::Starting,
            Some(supervisor),
        );
        *session.process.lock() = Some(process);

        info!(session = %id, pid = ?session.backend_pid(), "session launched");
        Ok(session)
    }

    /// Build an ACTIVE session over an already-connected byte stream.
    ///
    /// No process is supervised; `terminate` only closes the channel.
    pub fn attach<R, W>(
        id: &str,
        reader: R,
        writer: W,
        callbacks: Arc<CallbackRegistry>,
        options: SessionOptions,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::assemble(id, reader, writer, callbacks, options, SessionState::Active, None)
    }

    fn assemble<R, W>(
        id: &str,
        reader: R,
        writer: W,
        callbacks: Arc<CallbackRegistry>,
        options: SessionOptions,
        initial: SessionState,
        supervisor: Option<ProcessSupervisor>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let writer_config = WriterConfig {
            max_pending_frames: options.max_pending_frames,
            ..WriterConfig::default()
        };
        let (writer, writer_task) = spawn_writer_task(writer, writer_config);

        let state = Arc::new(StateCell::new(initial));
        let engine = Arc::new(CallEngine::new(writer));
        let queue = Arc::new(NotificationQueue::new(options.notification_buffer));
        if options.buffer_notifications {
            queue.subscribe();
        }

        let dispatcher = spawn_dispatcher(
            id,
            FrameReader::new(reader),
            DispatchTargets {
                engine: engine.clone(),
                callbacks: callbacks.clone(),
                queue: queue.clone(),
                session_state: state.clone(),
            },
        );

        Self {
            id: id.to_string(),
            storage_dir: options.storage_dir,
            call_timeout: options.call_timeout,
            state,
            engine,
            callbacks,
            queue,
            dispatcher_state: dispatcher.subscribe(),
            dispatcher: Mutex::new(Some(dispatcher)),
            writer_task: Mutex::new(Some(writer_task)),
            process: Mutex::new(None),
            supervisor,
            teardown: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn dispatcher_state(&self) -> DispatcherState {
        *self.dispatcher_state.borrow()
    }

    /// OS pid of the backend, if this session supervises one.
    pub fn backend_pid(&self) -> Option<u32> {
        self.process.lock().as_ref().and_then(ProcessHandle::pid)
    }

    /// Default timeout applied by [`Session::call`].
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Calls currently waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.engine.pending_count()
    }

    pub(crate) fn mark_active(&self) -> bool {
        self.state.activate()
    }

    /// Call `method` with the session's default timeout.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.engine.call(method, &params, self.call_timeout).await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.engine.call(method, &params, timeout).await
    }

    /// Call and decode the result into `T`.
    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        self.engine.call_as(method, &params, self.call_timeout).await
    }

    /// Start buffering notifications for [`Session::wait_for_notification`].
    ///
    /// Without it, buffering starts with the first wait and events that
    /// arrived earlier reach callbacks only.
    pub fn subscribe_notifications(&self) {
        self.queue.subscribe();
    }

    /// Next notification, in arrival order.
    ///
    /// Returns `Ok(None)` when `timeout` elapses first; `None` waits without
    /// limit. Each event goes to exactly one waiter. Once the session is
    /// closed and the buffer drained, returns the close reason.
    pub async fn wait_for_notification(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<NotificationEvent>> {
        self.queue.wait(timeout).await
    }

    /// Block until the dispatcher stops.
    ///
    /// Callbacks keep running on the dispatcher task meanwhile. Returns
    /// `Ok(())` after `terminate` and `Err(ConnectionLost)` when the channel
    /// failed.
    pub async fn process_notifications(&self) -> Result<()> {
        wait_stopped(self.dispatcher_state.clone()).await;
        match self.engine.disconnect_reason() {
            Some(Disconnect::ConnectionLost) => Err(FlowError::ConnectionLost),
            _ => Ok(()),
        }
    }

    /// Register a handler for `category`. Takes effect from the next
    /// notification on.
    pub fn register_callback<H: Handler>(
        &self,
        category: impl Into<NotificationCategory>,
        handler: H,
    ) -> CallbackId {
        self.callbacks.register(category, handler)
    }

    /// Register a handler receiving payloads decoded into `T`.
    pub fn register_typed<F, T>(
        &self,
        category: impl Into<NotificationCategory>,
        handler: F,
    ) -> CallbackId
    where
        F: Fn(T) + Send + Sync + 'static,
        T: DeserializeOwned + 'static,
    {
        self.callbacks.register_typed(category, handler)
    }

    pub fn unregister_callback(&self, id: CallbackId) -> bool {
        self.callbacks.unregister(id)
    }

    /// Tear the session down.
    ///
    /// Fails every waiting caller with `Terminated`, stops the dispatcher,
    /// closes the channel and stops the backend. Idempotent and safe to run
    /// after any partial failure; errors from parts that already failed are
    /// logged, never returned.
    pub async fn terminate(&self) {
        let _teardown = self.teardown.lock().await;
        if self.state.get() == SessionState::Terminated {
            return;
        }
        self.state.begin_terminating();
        debug!(session = %self.id, "terminating");

        // 1. Wake callers and waiters
        self.engine.close(Disconnect::Terminated);
        self.queue.close(Disconnect::Terminated);

        // 2. Stop the read side
        let dispatcher = self.dispatcher.lock().take();
        if let Some(mut dispatcher) = dispatcher {
            dispatcher.stop(DISPATCHER_STOP_TIMEOUT).await;
        }

        // 3. Flush and close the write side
        let writer_task = self.writer_task.lock().take();
        if let Some(mut task) = writer_task {
            match tokio::time::timeout(WRITER_STOP_TIMEOUT, &mut task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => debug!(session = %self.id, error = %e, "writer ended with error"),
                Ok(Err(e)) => warn!(session = %self.id, error = %e, "writer task ended abnormally"),
                Err(_) => {
                    warn!(session = %self.id, "writer did not stop in time, aborting");
                    task.abort();
                }
            }
        }

        // 4. Stop the backend
        let process = self.process.lock().take();
        if let (Some(mut process), Some(supervisor)) = (process, self.supervisor.as_ref()) {
            if let Err(e) = supervisor.stop(&mut process).await {
                warn!(session = %self.id, error = %e, "failed to stop backend");
            }
        }

        self.state.set(SessionState::Terminated);
        info!(session = %self.id, "session terminated");
    }

    /// Synchronous teardown for `Drop` paths.
    ///
    /// Wakes everyone with `Terminated` and kills the backend. The process
    /// is reaped on the current runtime when there is one, otherwise by the
    /// runtime's orphan reaper once the handle is dropped.
    pub fn abort(&self) {
        if self.state.get() == SessionState::Terminated {
            return;
        }
        self.state.begin_terminating();
        warn!(session = %self.id, "aborting session");

        self.engine.close(Disconnect::Terminated);
        self.queue.close(Disconnect::Terminated);
        if let Some(mut dispatcher) = self.dispatcher.lock().take() {
            dispatcher.signal_stop();
        }
        // The writer task exits on its own once the engine's handle is gone.
        self.writer_task.lock().take();

        if let Some(mut process) = self.process.lock().take() {
            process.start_kill();
            match (tokio::runtime::Handle::try_current(), self.supervisor.clone()) {
                (Ok(runtime), Some(supervisor)) => {
                    runtime.spawn(async move {
                        if let Err(e) = supervisor.stop(&mut process).await {
                            warn!(session = %process.session_id(), error = %e, "failed to reap backend");
                        }
                    });
                }
                _ => drop(process),
            }
        }

        self.state.set(SessionState::Terminated);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state.get() != SessionState::Terminated {
            self.abort();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .field("storage_dir", &self.storage_dir)
            .field("backend_pid", &self.backend_pid())
            .finish()
    }
}
