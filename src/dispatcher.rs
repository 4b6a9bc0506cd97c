//! Notification dispatcher: the one task that reads a session's channel.
//!
//! ```text
//! IDLE ──spawn──► RUNNING ──EOF / read error / shutdown──► STOPPING ──► STOPPED
//! ```
//!
//! Responses go to the engine by call id. Notifications go to every callback
//! registered for their category, in order, and then to the notification
//! buffer. Frames that fail validation or match no pending call are logged
//! and dropped; only channel failures end the loop.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::callbacks::CallbackRegistry;
use crate::codec::MsgPackCodec;
use crate::engine::CallEngine;
use crate::error::{Disconnect, FlowError, Result};
use crate::notification::NotificationEvent;
use crate::protocol::{Frame, NotificationPayload};
use crate::queue::NotificationQueue;
use crate::session::StateCell;
use crate::transport::FrameReader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Everything the dispatcher routes into.
pub struct DispatchTargets {
    pub engine: Arc<CallEngine>,
    pub callbacks: Arc<CallbackRegistry>,
    pub queue: Arc<NotificationQueue>,
    pub session_state: Arc<StateCell>,
}

struct Dispatcher<R> {
    session_id: String,
    reader: FrameReader<R>,
    targets: DispatchTargets,
    state: watch::Sender<DispatcherState>,
}

/// Owner's side of a running dispatcher.
pub struct DispatcherHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    state: watch::Receiver<DispatcherState>,
}

/// Start the dispatcher task for one session.
pub fn spawn_dispatcher<R>(
    session_id: &str,
    reader: FrameReader<R>,
    targets: DispatchTargets,
) -> DispatcherHandle
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (state_tx, state_rx) = watch::channel(DispatcherState::Idle);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let dispatcher = Dispatcher {
        session_id: session_id.to_string(),
        reader,
        targets,
        state: state_tx,
    };
    let task = tokio::spawn(dispatcher.run(shutdown_rx));

    DispatcherHandle {
        shutdown: Some(shutdown_tx),
        task: Some(task),
        state: state_rx,
    }
}

impl DispatcherHandle {
    pub fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    /// Receiver for state changes; resolves waiters of `process_notifications`.
    pub fn subscribe(&self) -> watch::Receiver<DispatcherState> {
        self.state.clone()
    }

    /// Ask the loop to stop and join it, aborting after `timeout`.
    ///
    /// Idempotent.
    pub async fn stop(&mut self, timeout: Duration) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let Some(mut task) = self.task.take() else {
            return;
        };
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "dispatcher task ended abnormally"),
            Err(_) => {
                warn!(?timeout, "dispatcher did not stop in time, aborting");
                task.abort();
            }
        }
    }

    /// Signal shutdown without waiting. For `Drop` paths.
    pub fn signal_stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Wait until the dispatcher reaches `Stopped` (or its task is gone).
pub async fn wait_stopped(mut state: watch::Receiver<DispatcherState>) {
    let _ = state.wait_for(|s| *s == DispatcherState::Stopped).await;
}

impl<R> Dispatcher<R>
where
    R: AsyncRead + Unpin,
{
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        self.state.send_replace(DispatcherState::Running);
        debug!(session = %self.session_id, "dispatcher running");

        let reason = loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break Disconnect::Terminated,
                received = self.reader.receive() => match received {
                    Ok(Some(frame)) => self.dispatch(frame),
                    Ok(None) => {
                        info!(session = %self.session_id, "backend closed the channel");
                        break Disconnect::ConnectionLost;
                    }
                    Err(e) => {
                        error!(session = %self.session_id, error = %e, "channel read failed");
                        break Disconnect::ConnectionLost;
                    }
                },
            }
        };

        self.state.send_replace(DispatcherState::Stopping);
        self.targets.session_state.begin_terminating();
        self.targets.engine.close(reason);
        self.targets.queue.close(reason);
        self.state.send_replace(DispatcherState::Stopped);
        debug!(session = %self.session_id, ?reason, "dispatcher stopped");
    }

    fn dispatch(&self, frame: Frame) {
        if let Err(e) = frame.header.validate() {
            warn!(
                session = %self.session_id,
                flags = frame.header.flags,
                call_id = frame.call_id(),
                error = %e,
                "dropping invalid frame"
            );
            return;
        }

        if frame.is_notification() {
            self.deliver_notifications(&frame);
        } else if frame.is_response() {
            self.route_response(&frame);
        } else {
            warn!(
                session = %self.session_id,
                call_id = frame.call_id(),
                "dropping request frame sent by backend"
            );
        }
    }

    fn route_response(&self, frame: &Frame) {
        let id = frame.call_id();
        let outcome = decode_response(frame);
        if let Err(FlowError::Protocol(e)) = &outcome {
            warn!(session = %self.session_id, call_id = id, error = %e, "undecodable response");
        }
        if !self.targets.engine.complete(id, outcome) {
            warn!(
                session = %self.session_id,
                call_id = id,
                "dropping response with no pending call"
            );
        }
    }

    fn deliver_notifications(&self, frame: &Frame) {
        let value: Value = match MsgPackCodec::decode(frame.payload()) {
            Ok(value) => value,
            Err(e) => {
                warn!(session = %self.session_id, error = %e, "dropping undecodable notification");
                return;
            }
        };

        // The backend may batch several changes into one frame.
        let items = match value {
            Value::Array(items) => items,
            single => vec![single],
        };
        for item in items {
            match serde_json::from_value::<NotificationPayload>(item) {
                Ok(payload) => self.deliver(NotificationEvent::new(payload.category, payload.data)),
                Err(e) => {
                    warn!(session = %self.session_id, error = %e, "dropping malformed notification")
                }
            }
        }
    }

    fn deliver(&self, event: NotificationEvent) {
        let handlers = self.targets.callbacks.snapshot(event.category());
        trace!(
            session = %self.session_id,
            category = %event.category(),
            handlers = handlers.len(),
            "notification"
        );

        for handler in handlers {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&event)));
            if outcome.is_err() {
                error!(
                    session = %self.session_id,
                    category = %event.category(),
                    "notification callback panicked"
                );
            }
        }

        self.targets.queue.push(event);
    }
}

/// Turn a response frame into the caller's result.
fn decode_response(frame: &Frame) -> Result<Value> {
    if frame.payload().is_empty() {
        return if frame.is_error() {
            Err(FlowError::Api(String::new()))
        } else {
            Ok(Value::Null)
        };
    }

    let value: Value = MsgPackCodec::decode(frame.payload())
        .map_err(|e| FlowError::Protocol(format!("response {}: {}", frame.call_id(), e)))?;

    if !frame.is_error() {
        return Ok(value);
    }
    let message = match value {
        Value::String(message) => message,
        Value::Object(mut map) => match map.remove("message") {
            Some(Value::String(message)) => message,
            Some(other) => other.to_string(),
            None => Value::Object(map).to_string(),
        },
        other => other.to_string(),
    };
    Err(FlowError::Api(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::NotificationCategory;
    use crate::protocol::{build_frame, Header};
    use crate::session::SessionState;
    use crate::writer::spawn_writer_task_default;
    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    struct Harness {
        backend: DuplexStream,
        engine: Arc<CallEngine>,
        callbacks: Arc<CallbackRegistry>,
        queue: Arc<NotificationQueue>,
        session_state: Arc<StateCell>,
        handle: DispatcherHandle,
    }

    fn harness() -> Harness {
        let (client, backend) = duplex(64 * 1024);
        let (read_half, write_half) = tokio::io::split(client);
        let (writer, _task) = spawn_writer_task_default(write_half);

        let engine = Arc::new(CallEngine::new(writer));
        let callbacks = Arc::new(CallbackRegistry::new());
        let queue = Arc::new(NotificationQueue::new(16));
        queue.subscribe();
        let session_state = Arc::new(StateCell::new(SessionState::Active));

        let handle = spawn_dispatcher(
            "test",
            FrameReader::new(read_half),
            DispatchTargets {
                engine: engine.clone(),
                callbacks: callbacks.clone(),
                queue: queue.clone(),
                session_state: session_state.clone(),
            },
        );

        Harness {
            backend,
            engine,
            callbacks,
            queue,
            session_state,
            handle,
        }
    }

    fn notification(category: &str, data: Value) -> Vec<u8> {
        let payload = MsgPackCodec::encode(&json!({ "type": category, "data": data })).unwrap();
        build_frame(&Header::notification(payload.len() as u32), &payload)
    }

    #[tokio::test]
    async fn test_callbacks_in_order_then_buffer() {
        let mut h = harness();
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b", "c"] {
            let log = log.clone();
            h.callbacks.register(NotificationCategory::Message, move |e: &NotificationEvent| {
                log.lock().push((name, e.data().clone()));
            });
        }

        h.backend
            .write_all(&notification("message", json!({"text": "hi", "channelId": "c1"})))
            .await
            .unwrap();

        let event = h.queue.wait(Some(Duration::from_secs(2))).await.unwrap().unwrap();
        assert_eq!(event.category(), &NotificationCategory::Message);

        let log = log.lock();
        let names: Vec<_> = log.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert!(log.iter().all(|(_, d)| *d == json!({"text": "hi", "channelId": "c1"})));
    }

    #[tokio::test]
    async fn test_batched_notifications_keep_order() {
        let mut h = harness();
        let payload = MsgPackCodec::encode(&json!([
            {"type": "org", "data": 1},
            {"type": "hwm", "data": 2}
        ]))
        .unwrap();
        h.backend
            .write_all(&build_frame(&Header::notification(payload.len() as u32), &payload))
            .await
            .unwrap();

        let first = h.queue.wait(Some(Duration::from_secs(2))).await.unwrap().unwrap();
        let second = h.queue.wait(Some(Duration::from_secs(2))).await.unwrap().unwrap();
        assert_eq!(first.category(), &NotificationCategory::Org);
        assert_eq!(second.category(), &NotificationCategory::Hwm);
    }

    #[tokio::test]
    async fn test_invalid_and_unmatched_frames_dropped() {
        let mut h = harness();

        // reserved flag bits
        h.backend
            .write_all(&build_frame(&Header::new(0x80 | 0x02, 5, 0), b""))
            .await
            .unwrap();
        // response for a call nobody made
        let body = MsgPackCodec::encode(&json!("stray")).unwrap();
        h.backend
            .write_all(&build_frame(&Header::response(999, body.len() as u32), &body))
            .await
            .unwrap();
        // garbage notification body
        h.backend
            .write_all(&build_frame(&Header::notification(3), b"\xc1\xc1\xc1"))
            .await
            .unwrap();
        // still alive
        h.backend
            .write_all(&notification("profile", json!({})))
            .await
            .unwrap();

        let event = h.queue.wait(Some(Duration::from_secs(2))).await.unwrap().unwrap();
        assert_eq!(event.category(), &NotificationCategory::Profile);
        assert_eq!(h.handle.state(), DispatcherState::Running);
    }

    #[tokio::test]
    async fn test_panicking_callback_does_not_stop_loop() {
        let mut h = harness();
        h.callbacks.register("org", |_: &NotificationEvent| panic!("boom"));
        let hits = Arc::new(Mutex::new(0));
        {
            let hits = hits.clone();
            h.callbacks.register("org", move |_: &NotificationEvent| *hits.lock() += 1);
        }

        for _ in 0..2 {
            h.backend.write_all(&notification("org", json!({}))).await.unwrap();
        }
        for _ in 0..2 {
            h.queue.wait(Some(Duration::from_secs(2))).await.unwrap().unwrap();
        }
        assert_eq!(*hits.lock(), 2);
    }

    #[tokio::test]
    async fn test_unregister_during_dispatch_affects_next_event_only() {
        let mut h = harness();
        let log = Arc::new(Mutex::new(Vec::new()));

        let second_id = Arc::new(Mutex::new(None));
        {
            let callbacks = h.callbacks.clone();
            let second_id = second_id.clone();
            let log = log.clone();
            h.callbacks.register("channel", move |_: &NotificationEvent| {
                log.lock().push("first");
                if let Some(id) = second_id.lock().take() {
                    callbacks.unregister(id);
                }
            });
        }
        {
            let log = log.clone();
            let id = h.callbacks.register("channel", move |_: &NotificationEvent| {
                log.lock().push("second");
            });
            *second_id.lock() = Some(id);
        }

        for _ in 0..2 {
            h.backend.write_all(&notification("channel", json!({}))).await.unwrap();
        }
        for _ in 0..2 {
            h.queue.wait(Some(Duration::from_secs(2))).await.unwrap().unwrap();
        }

        assert_eq!(*log.lock(), vec!["first", "second", "first"]);
    }

    #[tokio::test]
    async fn test_eof_closes_session_with_connection_lost() {
        let h = harness();
        let call = {
            let engine = h.engine.clone();
            tokio::spawn(async move {
                engine.call("Hang", &json!({}), Duration::from_secs(5)).await
            })
        };
        while h.engine.pending_count() == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        drop(h.backend);

        assert!(matches!(call.await.unwrap(), Err(FlowError::ConnectionLost)));
        wait_stopped(h.handle.subscribe()).await;
        assert_eq!(h.handle.state(), DispatcherState::Stopped);
        assert_eq!(h.session_state.get(), SessionState::Terminating);
        assert!(matches!(h.queue.wait(None).await, Err(FlowError::ConnectionLost)));
    }

    #[tokio::test]
    async fn test_stop_reports_terminated() {
        let mut h = harness();
        h.handle.stop(Duration::from_secs(1)).await;

        assert_eq!(h.handle.state(), DispatcherState::Stopped);
        assert_eq!(h.engine.disconnect_reason(), Some(Disconnect::Terminated));
        h.handle.stop(Duration::from_secs(1)).await;
    }

    #[test]
    fn test_decode_error_response_shapes() {
        let frame = |header: Header, value: Value| {
            let body = MsgPackCodec::encode(&value).unwrap();
            Frame::new(header, bytes::Bytes::from(body))
        };

        let err = decode_response(&frame(Header::error_response(1, 0), json!({"message": "denied"})));
        assert!(matches!(err, Err(FlowError::Api(m)) if m == "denied"));

        let err = decode_response(&frame(Header::error_response(1, 0), json!("plain")));
        assert!(matches!(err, Err(FlowError::Api(m)) if m == "plain"));

        let ok = decode_response(&Frame::new(Header::response(1, 0), bytes::Bytes::new()));
        assert_eq!(ok.unwrap(), Value::Null);
    }
}
