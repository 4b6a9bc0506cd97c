//! Request/response engine.
//!
//! ```text
//! call() ──► pending.insert(id) ──► writer ──► backend
//!                                                │
//! call() ◄── oneshot ◄── complete(id) ◄── dispatcher
//! ```
//!
//! Every call owns one entry in the pending table, keyed by call id. The entry
//! leaves the table exactly once: on response, on timeout, on send failure, when
//! the caller's future is dropped, or when the engine is closed. A response
//! whose entry is already gone is reported to the dispatcher, which drops it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::codec::MsgPackCodec;
use crate::error::{Disconnect, FlowError, Result};
use crate::protocol::{Header, RequestRef, DEFAULT_MAX_PAYLOAD_SIZE, NOTIFICATION_CALL_ID};
use crate::writer::{OutboundFrame, WriterHandle};

struct PendingCall {
    method: String,
    tx: oneshot::Sender<Result<Value>>,
    /// None when `timeout` is too large to represent.
    deadline: Option<Instant>,
}

struct Inner {
    pending: HashMap<u32, PendingCall>,
    writer: Option<WriterHandle>,
    closed: Option<Disconnect>,
}

/// Issues calls over one session's channel and matches responses by id.
pub struct CallEngine {
    inner: Mutex<Inner>,
    next_id: AtomicU32,
}

impl CallEngine {
    pub fn new(writer: WriterHandle) -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: HashMap::new(),
                writer: Some(writer),
                closed: None,
            }),
            next_id: AtomicU32::new(1),
        }
    }

    /// Send `method` with `params` and wait for the matching response.
    ///
    /// # Errors
    ///
    /// - `Timeout` when no response arrives within `timeout`
    /// - `Api` when the backend answered with an error
    /// - `ConnectionLost`/`Terminated` when the session closes first
    /// - `Channel` when the frame could not be written
    pub async fn call(&self, method: &str, params: &Value, timeout: Duration) -> Result<Value> {
        let payload = MsgPackCodec::encode_bytes(&RequestRef { method, params })?;
        if payload.len() > DEFAULT_MAX_PAYLOAD_SIZE as usize {
            return Err(FlowError::InvalidArgument(format!(
                "{} request is {} bytes, limit is {}",
                method,
                payload.len(),
                DEFAULT_MAX_PAYLOAD_SIZE
            )));
        }

        let (tx, rx) = oneshot::channel();
        let (id, writer) = {
            let mut inner = self.inner.lock();
            if let Some(reason) = inner.closed {
                return Err(reason.into());
            }
            let writer = match inner.writer.clone() {
                Some(writer) => writer,
                None => return Err(FlowError::ConnectionLost),
            };
            let id = self.allocate_id(&inner.pending);
            inner.pending.insert(
                id,
                PendingCall {
                    method: method.to_string(),
                    tx,
                    deadline: Instant::now().checked_add(timeout),
                },
            );
            (id, writer)
        };
        let mut guard = PendingGuard {
            engine: self,
            id,
            armed: true,
        };

        trace!(call_id = id, method, "sending request");
        let header = Header::request(id, payload.len() as u32);
        let sent = writer.send(OutboundFrame::new(&header, payload)).await;
        drop(writer);
        if let Err(e) = sent {
            return Err(self.disconnect_reason().map(FlowError::from).unwrap_or(e));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => {
                guard.armed = false;
                outcome
            }
            Ok(Err(_)) => {
                guard.armed = false;
                Err(self
                    .disconnect_reason()
                    .map(FlowError::from)
                    .unwrap_or(FlowError::ConnectionLost))
            }
            Err(_) => {
                debug!(call_id = id, method, ?timeout, "call timed out");
                Err(FlowError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// `call` with the result decoded into `T`.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &Value,
        timeout: Duration,
    ) -> Result<T> {
        let value = self.call(method, params, timeout).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Hand a response to its waiting call.
    ///
    /// Returns false when no call is waiting for `id` (timed out, cancelled
    /// or never issued); the caller drops the frame.
    pub fn complete(&self, id: u32, outcome: Result<Value>) -> bool {
        let call = self.inner.lock().pending.remove(&id);
        match call {
            Some(call) => {
                trace!(
                    call_id = id,
                    method = %call.method,
                    slack = ?call.deadline.map(|d| d.saturating_duration_since(Instant::now())),
                    "response matched"
                );
                let _ = call.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Refuse new calls and fail every pending one with `reason`.
    ///
    /// Drops the engine's writer handle, so once in-flight sends finish the
    /// writer task half-closes the channel. Returns false if the engine was
    /// already closed; the first reason is kept.
    pub fn close(&self, reason: Disconnect) -> bool {
        let (pending, writer) = {
            let mut inner = self.inner.lock();
            if inner.closed.is_some() {
                return false;
            }
            inner.closed = Some(reason);
            (std::mem::take(&mut inner.pending), inner.writer.take())
        };
        drop(writer);

        if !pending.is_empty() {
            debug!(count = pending.len(), ?reason, "failing pending calls");
        }
        for (_, call) in pending {
            let _ = call.tx.send(Err(reason.into()));
        }
        true
    }

    pub fn disconnect_reason(&self) -> Option<Disconnect> {
        self.inner.lock().closed
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Methods of the calls currently waiting, for diagnostics.
    pub fn pending_methods(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut methods: Vec<String> = inner.pending.values().map(|c| c.method.clone()).collect();
        methods.sort();
        methods
    }

    /// Next id that is neither 0 nor still pending. Ids wrap after
    /// `u32::MAX` calls.
    fn allocate_id(&self, pending: &HashMap<u32, PendingCall>) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != NOTIFICATION_CALL_ID && !pending.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Evicts the pending entry unless the call completed normally.
struct PendingGuard<'a> {
    engine: &'a CallEngine,
    id: u32,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.engine.inner.lock().pending.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Request;
    use crate::transport::FrameReader;
    use crate::writer::spawn_writer_task_default;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::io::{duplex, DuplexStream};

    const LONG: Duration = Duration::from_secs(5);

    fn engine() -> (Arc<CallEngine>, FrameReader<DuplexStream>) {
        let (client, server) = duplex(64 * 1024);
        let (writer, _task) = spawn_writer_task_default(client);
        (Arc::new(CallEngine::new(writer)), FrameReader::new(server))
    }

    async fn next_request(reader: &mut FrameReader<DuplexStream>) -> (u32, Request) {
        let frame = reader.receive().await.unwrap().unwrap();
        assert!(frame.header.is_to_backend());
        let request: Request = MsgPackCodec::decode(frame.payload()).unwrap();
        (frame.call_id(), request)
    }

    async fn wait_pending(engine: &CallEngine, n: usize) {
        while engine.pending_count() < n {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let (engine, mut backend) = engine();

        let call = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.call("AccountId", &json!({}), LONG).await })
        };

        let (id, request) = next_request(&mut backend).await;
        assert_ne!(id, 0);
        assert_eq!(request.method, "AccountId");
        assert!(engine.complete(id, Ok(json!("acct-1"))));

        assert_eq!(call.await.unwrap().unwrap(), json!("acct-1"));
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_match_by_id() {
        let (engine, mut backend) = engine();

        let mut calls = Vec::new();
        for n in 0..10 {
            let engine = engine.clone();
            calls.push(tokio::spawn(async move {
                engine.call("Echo", &json!({ "n": n }), LONG).await
            }));
        }

        let mut requests = Vec::new();
        for _ in 0..10 {
            requests.push(next_request(&mut backend).await);
        }
        let ids: std::collections::HashSet<u32> = requests.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids.len(), 10);

        for (id, request) in requests.into_iter().rev() {
            assert!(engine.complete(id, Ok(request.params)));
        }

        for (n, call) in calls.into_iter().enumerate() {
            assert_eq!(call.await.unwrap().unwrap(), json!({ "n": n }));
        }
    }

    #[tokio::test]
    async fn test_api_error_passthrough() {
        let (engine, mut backend) = engine();
        let call = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.call("NewOrg", &json!({}), LONG).await })
        };

        let (id, _) = next_request(&mut backend).await;
        engine.complete(id, Err(FlowError::Api("org name taken".into())));

        match call.await.unwrap() {
            Err(FlowError::Api(message)) => assert_eq!(message, "org name taken"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unbounded_timeout_waits_for_response() {
        let (engine, mut backend) = engine();

        let call = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.call("Hang", &json!({}), Duration::MAX).await })
        };

        let (id, _) = next_request(&mut backend).await;
        assert!(engine.complete(id, Ok(json!("done"))));
        assert_eq!(call.await.unwrap().unwrap(), json!("done"));
    }

    #[tokio::test]
    async fn test_timeout_then_late_response_discarded() {
        let (engine, mut backend) = engine();

        let result = engine
            .call("Hang", &json!({}), Duration::from_millis(30))
            .await;
        assert!(matches!(result, Err(FlowError::Timeout { .. })));
        assert_eq!(engine.pending_count(), 0);

        let (id, _) = next_request(&mut backend).await;
        assert!(!engine.complete(id, Ok(json!("late"))));
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_future_calls() {
        let (engine, _backend) = engine();

        let mut calls = Vec::new();
        for _ in 0..5 {
            let engine = engine.clone();
            calls.push(tokio::spawn(async move {
                engine.call("Hang", &json!({}), LONG).await
            }));
        }
        wait_pending(&engine, 5).await;

        assert!(engine.close(Disconnect::Terminated));
        assert!(!engine.close(Disconnect::ConnectionLost));

        for call in calls {
            assert!(matches!(call.await.unwrap(), Err(FlowError::Terminated)));
        }
        let after = engine.call("AccountId", &json!({}), LONG).await;
        assert!(matches!(after, Err(FlowError::Terminated)));
        assert_eq!(engine.disconnect_reason(), Some(Disconnect::Terminated));
    }

    #[tokio::test]
    async fn test_cancelled_call_is_evicted() {
        let (engine, _backend) = engine();

        let call = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.call("Hang", &json!({}), LONG).await })
        };
        wait_pending(&engine, 1).await;
        assert_eq!(engine.pending_methods(), vec!["Hang".to_string()]);

        call.abort();
        let _ = call.await;
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_call_as_decodes() {
        let (engine, mut backend) = engine();
        let call = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .call_as::<Vec<String>>("EnumerateOrgs", &json!({}), LONG)
                    .await
            })
        };

        let (id, _) = next_request(&mut backend).await;
        engine.complete(id, Ok(json!(["o1", "o2"])));
        assert_eq!(call.await.unwrap().unwrap(), vec!["o1", "o2"]);
    }

    #[test]
    fn test_allocate_id_skips_zero_and_pending() {
        let engine = CallEngine {
            inner: Mutex::new(Inner {
                pending: HashMap::new(),
                writer: None,
                closed: None,
            }),
            next_id: AtomicU32::new(u32::MAX),
        };

        let mut pending = HashMap::new();
        let (tx, _rx) = oneshot::channel();
        pending.insert(
            1,
            PendingCall {
                method: "Busy".into(),
                tx,
                deadline: Some(Instant::now()),
            },
        );

        assert_eq!(engine.allocate_id(&pending), u32::MAX);
        // wraps past 0 and the still-pending 1
        assert_eq!(engine.allocate_id(&pending), 2);
    }
}
