//! The public entry point.
//!
//! # Example
//!
//! ```ignore
//! use flow_client::{Flow, FlowConfig, MessageNotification, NotificationCategory};
//!
//! #[tokio::main]
//! async fn main() -> flow_client::Result<()> {
//!     let flow = Flow::new(FlowConfig::from_env())?;
//!
//!     flow.register_typed("alice", NotificationCategory::Message, |msg: MessageNotification| {
//!         for m in msg.all() {
//!             println!("[{}] {}", m.channel_id, m.text);
//!         }
//!     });
//!
//!     let session = flow.start_up("alice").await?;
//!     println!("orgs: {}", session.enumerate_orgs().await?);
//!
//!     session.process_notifications().await?;
//!     session.terminate().await;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::callbacks::{CallbackId, Handler};
use crate::config::FlowConfig;
use crate::error::{FlowError, Result};
use crate::notification::NotificationCategory;
use crate::onboarding::{CreateAccount, CreateDevice, Onboarding, StartUp};
use crate::registry::{SessionGuard, SessionRegistry};
use crate::session::Session;

/// Client runtime owning every session of this process.
///
/// Dropping it aborts the sessions still running.
pub struct Flow {
    config: FlowConfig,
    registry: SessionRegistry,
}

impl Flow {
    /// # Errors
    ///
    /// `Config` when `config` fails validation.
    pub fn new(config: FlowConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            registry: SessionRegistry::new(),
        })
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Start an account already set up on this machine.
    pub async fn start_up(&self, username: &str) -> Result<SessionGuard> {
        self.onboard(StartUp::new(username).into()).await
    }

    /// Create a new account; see [`CreateAccount`] for optional fields.
    pub async fn create_account(&self, request: CreateAccount) -> Result<SessionGuard> {
        self.onboard(request.into()).await
    }

    /// Add this machine as a device of an existing account.
    pub async fn create_device(&self, request: CreateDevice) -> Result<SessionGuard> {
        self.onboard(request.into()).await
    }

    /// Bring up a session with any onboarding request.
    pub async fn onboard(&self, onboarding: Onboarding) -> Result<SessionGuard> {
        self.onboard_with(onboarding, &self.config).await
    }

    /// Like [`Flow::onboard`] but with a per-session configuration, e.g. a
    /// different storage root.
    pub async fn onboard_with(
        &self,
        onboarding: Onboarding,
        config: &FlowConfig,
    ) -> Result<SessionGuard> {
        config.validate()?;
        self.registry.activate(onboarding, config).await
    }

    /// Register a notification handler for `session_id`.
    ///
    /// Works before the session starts; handlers stay registered across
    /// restarts of the same identifier.
    pub fn register_callback<H: Handler>(
        &self,
        session_id: &str,
        category: impl Into<NotificationCategory>,
        handler: H,
    ) -> CallbackId {
        self.registry
            .with_callbacks(session_id, |callbacks| callbacks.register(category, handler))
    }

    /// Register a handler receiving payloads decoded into `T`.
    pub fn register_typed<F, T>(
        &self,
        session_id: &str,
        category: impl Into<NotificationCategory>,
        handler: F,
    ) -> CallbackId
    where
        F: Fn(T) + Send + Sync + 'static,
        T: DeserializeOwned + 'static,
    {
        self.registry.with_callbacks(session_id, |callbacks| {
            callbacks.register_typed(category, handler)
        })
    }

    pub fn unregister_callback(&self, session_id: &str, id: CallbackId) -> bool {
        self.registry.unregister_callback(session_id, id)
    }

    /// Remove every handler of `category` for `session_id`.
    pub fn unregister_category(
        &self,
        session_id: &str,
        category: impl Into<NotificationCategory>,
    ) -> usize {
        self.registry
            .unregister_category(session_id, &category.into())
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.registry.get(session_id)
    }

    /// Like [`Flow::session`], failing with `UnknownSession`.
    pub fn require_session(&self, session_id: &str) -> Result<Arc<Session>> {
        self.session(session_id)
            .ok_or_else(|| FlowError::UnknownSession(session_id.to_string()))
    }

    /// Identifiers with a registered session.
    pub fn session_ids(&self) -> Vec<String> {
        self.registry.ids()
    }

    /// Terminate one session. Idempotent; a no-op for identifiers with no
    /// session.
    pub async fn terminate_session(&self, session_id: &str) -> Result<()> {
        self.registry.terminate(session_id).await
    }

    /// Terminate every session. Idempotent.
    pub async fn terminate(&self) {
        self.registry.terminate_all().await;
    }
}

impl Drop for Flow {
    fn drop(&mut self) {
        self.registry.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_validates_config() {
        let config = FlowConfig::default().with_call_timeout(Duration::ZERO);
        assert!(matches!(Flow::new(config), Err(FlowError::Config(_))));
    }

    #[tokio::test]
    async fn test_callbacks_before_session() {
        let flow = Flow::new(FlowConfig::default()).unwrap();
        let id = flow.register_callback("alice", "message", |_: &crate::NotificationEvent| {});

        assert!(flow.session("alice").is_none());
        assert!(matches!(
            flow.require_session("alice"),
            Err(FlowError::UnknownSession(_))
        ));
        assert!(flow.unregister_callback("alice", id));
        assert!(!flow.unregister_callback("alice", id));
        assert_eq!(flow.registry.slot_count(), 0);

        // lookups never create slots
        assert!(!flow.unregister_callback("bob", id));
        assert_eq!(flow.unregister_category("bob", "message"), 0);
        assert_eq!(flow.registry.slot_count(), 0);

        flow.terminate().await;
        assert!(flow.terminate_session("alice").await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_username_rejected() {
        let flow = Flow::new(FlowConfig::default()).unwrap();
        assert!(matches!(
            flow.start_up("").await,
            Err(FlowError::InvalidArgument(_))
        ));
    }
}
