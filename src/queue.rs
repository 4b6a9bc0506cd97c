//! Bounded buffer behind `wait_for_notification`.
//!
//! The dispatcher pushes every notification; waiters pop. Each event is
//! handed to exactly one waiter. Nothing is buffered until someone
//! subscribes, either explicitly or by waiting for the first time, so
//! sessions that only use callbacks keep an empty buffer. Once subscribed
//! and full, the oldest events are dropped.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{Disconnect, Result};
use crate::notification::NotificationEvent;

struct State {
    events: VecDeque<NotificationEvent>,
    closed: Option<Disconnect>,
    subscribed: bool,
    dropped: u64,
}

pub struct NotificationQueue {
    state: Mutex<State>,
    notify: Notify,
    capacity: usize,
}

impl NotificationQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                events: VecDeque::with_capacity(capacity),
                closed: None,
                subscribed: false,
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Start buffering pushed events. Idempotent.
    pub fn subscribe(&self) {
        self.state.lock().subscribed = true;
    }

    pub fn is_subscribed(&self) -> bool {
        self.state.lock().subscribed
    }

    /// Buffer an event, evicting the oldest one when full.
    ///
    /// Events pushed before anyone subscribed or after `close` are discarded.
    pub fn push(&self, event: NotificationEvent) {
        {
            let mut state = self.state.lock();
            if state.closed.is_some() || !state.subscribed {
                return;
            }
            if state.events.len() >= self.capacity {
                if let Some(old) = state.events.pop_front() {
                    state.dropped += 1;
                    if state.dropped == 1 {
                        warn!(
                            category = %old.category(),
                            capacity = self.capacity,
                            "notification buffer full, dropping oldest"
                        );
                    } else {
                        debug!(category = %old.category(), dropped = state.dropped, "dropped notification");
                    }
                }
            }
            state.events.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Stop accepting events and wake every waiter with `reason`.
    ///
    /// First reason wins. Events already buffered are still handed out.
    pub fn close(&self, reason: Disconnect) {
        {
            let mut state = self.state.lock();
            if state.closed.is_none() {
                state.closed = Some(reason);
            }
        }
        self.notify.notify_waiters();
    }

    /// Wait for the next event.
    ///
    /// - `Ok(Some(event))`: next buffered event
    /// - `Ok(None)`: `timeout` elapsed with nothing buffered
    /// - `Err(_)`: buffer is empty and the session is gone
    ///
    /// `None` waits without limit. Subscribes the buffer on first use.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<Option<NotificationEvent>> {
        self.subscribe();
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, self.next()).await {
                Ok(result) => result.map(Some),
                Err(_) => Ok(None),
            },
            None => self.next().await.map(Some),
        }
    }

    async fn next(&self) -> Result<NotificationEvent> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the
            // await is not lost.
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(event) = state.events.pop_front() {
                    return Ok(event);
                }
                if let Some(reason) = state.closed {
                    return Err(reason.into());
                }
            }

            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total events evicted because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FlowError;
    use serde_json::json;
    use std::sync::Arc;

    fn event(n: u64) -> NotificationEvent {
        NotificationEvent::new("message", json!({ "n": n }))
    }

    #[tokio::test]
    async fn test_fifo_delivery() {
        let queue = NotificationQueue::new(8);
        queue.subscribe();
        queue.push(event(1));
        queue.push(event(2));

        let first = queue.wait(None).await.unwrap().unwrap();
        let second = queue.wait(None).await.unwrap().unwrap();
        assert_eq!(first.data()["n"], 1);
        assert_eq!(second.data()["n"], 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_nothing_buffered_until_subscribed() {
        let queue = NotificationQueue::new(4);
        for n in 0..200 {
            queue.push(event(n));
        }
        assert!(queue.is_empty());
        assert_eq!(queue.dropped(), 0);
        assert!(!queue.is_subscribed());

        // the first wait subscribes; only later events are seen
        assert!(queue.wait(Some(Duration::from_millis(10))).await.unwrap().is_none());
        assert!(queue.is_subscribed());
        queue.push(event(500));
        assert_eq!(queue.wait(None).await.unwrap().unwrap().data()["n"], 500);
    }

    #[tokio::test]
    async fn test_timeout_returns_none() {
        let queue = NotificationQueue::new(8);
        let result = queue.wait(Some(Duration::from_millis(20))).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let queue = NotificationQueue::new(3);
        queue.subscribe();
        for n in 0..5 {
            queue.push(event(n));
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);
        let next = queue.wait(None).await.unwrap().unwrap();
        assert_eq!(next.data()["n"], 2);
    }

    #[tokio::test]
    async fn test_waiter_woken_by_push() {
        let queue = Arc::new(NotificationQueue::new(8));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait(None).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(event(7));

        let got = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(got.data()["n"], 7);
    }

    #[tokio::test]
    async fn test_each_event_reaches_one_waiter() {
        let queue = Arc::new(NotificationQueue::new(64));
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            waiters.push(tokio::spawn(async move {
                queue.wait(Some(Duration::from_millis(500))).await
            }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        for n in 0..4 {
            queue.push(event(n));
        }

        let mut seen = Vec::new();
        for waiter in waiters {
            let got = waiter.await.unwrap().unwrap().unwrap();
            seen.push(got.data()["n"].as_u64().unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_close_wakes_all_waiters() {
        let queue = Arc::new(NotificationQueue::new(8));
        let mut waiters = Vec::new();
        for _ in 0..3 {
            let queue = queue.clone();
            waiters.push(tokio::spawn(async move { queue.wait(None).await }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close(Disconnect::ConnectionLost);

        for waiter in waiters {
            let result = waiter.await.unwrap();
            assert!(matches!(result, Err(FlowError::ConnectionLost)));
        }
    }

    #[tokio::test]
    async fn test_buffered_events_survive_close() {
        let queue = NotificationQueue::new(8);
        queue.subscribe();
        queue.push(event(1));
        queue.close(Disconnect::Terminated);
        queue.close(Disconnect::ConnectionLost);
        queue.push(event(2));

        assert_eq!(queue.wait(None).await.unwrap().unwrap().data()["n"], 1);
        assert!(matches!(queue.wait(None).await, Err(FlowError::Terminated)));
    }
}
