//! Callback registry for notification dispatch.
//!
//! Maps a notification category to an ordered list of handlers. The
//! dispatcher takes a snapshot of the list before invoking it, so handlers
//! registered or removed while an event is being delivered only affect the
//! next event.
//!
//! # Example
//!
//! ```
//! use flow_client::callbacks::CallbackRegistry;
//! use flow_client::notification::{MessageNotification, NotificationCategory};
//!
//! let registry = CallbackRegistry::new();
//! registry.register_typed(NotificationCategory::Message, |msg: MessageNotification| {
//!     for m in msg.all() {
//!         println!("{}: {}", m.channel_id, m.text);
//!     }
//! });
//! ```

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::notification::{NotificationCategory, NotificationEvent};

/// Something that can receive notifications.
///
/// Runs on the dispatcher task: a slow handler delays every later
/// notification of the session, so hand long work off to another task.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, event: &NotificationEvent);
}

impl<F> Handler for F
where
    F: Fn(&NotificationEvent) + Send + Sync + 'static,
{
    fn handle(&self, event: &NotificationEvent) {
        self(event)
    }
}

/// Wrapper that decodes the payload before calling the handler.
///
/// Payloads that do not decode into `T` are logged and skipped.
pub struct TypedHandler<F, T>
where
    F: Fn(T) + Send + Sync + 'static,
    T: DeserializeOwned + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T)>,
}

impl<F, T> TypedHandler<F, T>
where
    F: Fn(T) + Send + Sync + 'static,
    T: DeserializeOwned + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T> Handler for TypedHandler<F, T>
where
    F: Fn(T) + Send + Sync + 'static,
    T: DeserializeOwned + 'static,
{
    fn handle(&self, event: &NotificationEvent) {
        match event.decode::<T>() {
            Ok(parsed) => (self.handler)(parsed),
            Err(e) => warn!(
                category = %event.category(),
                error = %e,
                "notification payload did not match handler type"
            ),
        }
    }
}

/// Identifies one registration, for `unregister`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Shared handle to a registered handler.
pub type Callback = Arc<dyn Handler>;

/// Category → ordered handlers.
pub struct CallbackRegistry {
    entries: RwLock<HashMap<NotificationCategory, Vec<(CallbackId, Callback)>>>,
    next_id: AtomicU64,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append a handler for `category`. Handlers run in registration order.
    pub fn register<H: Handler>(
        &self,
        category: impl Into<NotificationCategory>,
        handler: H,
    ) -> CallbackId {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .entry(category.into())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Register a handler that receives the payload decoded into `T`.
    pub fn register_typed<F, T>(
        &self,
        category: impl Into<NotificationCategory>,
        handler: F,
    ) -> CallbackId
    where
        F: Fn(T) + Send + Sync + 'static,
        T: DeserializeOwned + 'static,
    {
        self.register(category, TypedHandler::new(handler))
    }

    /// Remove one registration. Returns false when it was already gone.
    pub fn unregister(&self, id: CallbackId) -> bool {
        let mut entries = self.entries.write();
        let mut removed = false;
        entries.retain(|_, handlers| {
            let before = handlers.len();
            handlers.retain(|(entry_id, _)| *entry_id != id);
            removed |= handlers.len() != before;
            !handlers.is_empty()
        });
        removed
    }

    /// Remove every handler of a category. Returns how many were removed.
    pub fn unregister_category(&self, category: &NotificationCategory) -> usize {
        self.entries
            .write()
            .remove(category)
            .map(|handlers| handlers.len())
            .unwrap_or(0)
    }

    /// Handlers for `category`, in registration order, detached from the
    /// registry.
    pub fn snapshot(&self, category: &NotificationCategory) -> Vec<Callback> {
        self.entries
            .read()
            .get(category)
            .map(|handlers| handlers.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }

    pub fn has_handlers(&self, category: &NotificationCategory) -> bool {
        self.entries.read().contains_key(category)
    }

    /// Total registrations across all categories.
    pub fn len(&self) -> usize {
        self.entries.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::MessageNotification;
    use parking_lot::Mutex;
    use serde_json::json;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(&NotificationEvent) + Send + Sync>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = log.clone();
            move |name: &str| {
                let log = log.clone();
                let name = name.to_string();
                Box::new(move |_: &NotificationEvent| log.lock().push(name.clone()))
                    as Box<dyn Fn(&NotificationEvent) + Send + Sync>
            }
        };
        (log, make)
    }

    fn run(registry: &CallbackRegistry, event: &NotificationEvent) {
        for handler in registry.snapshot(event.category()) {
            handler.handle(event);
        }
    }

    #[test]
    fn test_registration_order() {
        let registry = CallbackRegistry::new();
        let (log, make) = recorder();

        registry.register(NotificationCategory::Message, make("first"));
        registry.register(NotificationCategory::Message, make("second"));
        registry.register(NotificationCategory::Org, make("org"));
        registry.register(NotificationCategory::Message, make("third"));

        run(&registry, &NotificationEvent::new("message", json!({})));

        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_unregister() {
        let registry = CallbackRegistry::new();
        let (log, make) = recorder();

        let a = registry.register("hwm", make("a"));
        registry.register("hwm", make("b"));

        assert!(registry.unregister(a));
        assert!(!registry.unregister(a));

        run(&registry, &NotificationEvent::new("hwm", json!(null)));
        assert_eq!(*log.lock(), vec!["b"]);
    }

    #[test]
    fn test_unregister_category() {
        let registry = CallbackRegistry::new();
        let (_log, make) = recorder();
        registry.register("profile", make("a"));
        registry.register("profile", make("b"));

        assert_eq!(registry.unregister_category(&NotificationCategory::Profile), 2);
        assert!(!registry.has_handlers(&NotificationCategory::Profile));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_unaffected_by_later_unregister() {
        let registry = CallbackRegistry::new();
        let (log, make) = recorder();
        let a = registry.register("org", make("a"));
        registry.register("org", make("b"));

        let snapshot = registry.snapshot(&NotificationCategory::Org);
        registry.unregister(a);

        let event = NotificationEvent::new("org", json!({}));
        for handler in snapshot {
            handler.handle(&event);
        }
        assert_eq!(*log.lock(), vec!["a", "b"]);
    }

    #[test]
    fn test_typed_handler_decodes() {
        let registry = CallbackRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            registry.register_typed(NotificationCategory::Message, move |msg: MessageNotification| {
                seen.lock().extend(msg.all().map(|m| m.text.clone()));
            });
        }

        run(
            &registry,
            &NotificationEvent::new(
                "message",
                json!({"regularMessages": [{"text": "hi", "channelId": "c1"}]}),
            ),
        );
        // does not decode; skipped
        run(&registry, &NotificationEvent::new("message", json!("garbage")));

        assert_eq!(*seen.lock(), vec!["hi".to_string()]);
    }
}
