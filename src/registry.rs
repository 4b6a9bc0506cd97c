//! Session registry: one live session per account identifier.
//!
//! The registry is the only place sessions are created or released. Each
//! identifier owns a slot holding its callback registry (kept across
//! restarts) and, while it runs, its session. A slot is *live* when a
//! session is starting or has not yet begun terminating; onboarding into a
//! live slot fails without touching the running session. A slot with no
//! session and no callbacks is removed.

use std::collections::HashMap;
use std::ops::Deref;
use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::callbacks::{CallbackId, CallbackRegistry};
use crate::config::FlowConfig;
use crate::error::{FlowError, Result};
use crate::notification::NotificationCategory;
use crate::onboarding::Onboarding;
use crate::session::{Session, SessionOptions};
use crate::supervisor::ProcessSupervisor;

#[derive(Default)]
struct Slot {
    callbacks: Arc<CallbackRegistry>,
    session: Option<Arc<Session>>,
    starting: bool,
}

impl Slot {
    fn is_empty(&self) -> bool {
        self.session.is_none() && !self.starting && self.callbacks.is_empty()
    }

    fn is_live(&self) -> bool {
        self.starting
            || self
                .session
                .as_ref()
                .is_some_and(|session| session.state().is_live())
    }
}

type Slots = Mutex<HashMap<String, Slot>>;

fn prune(slots: &mut HashMap<String, Slot>, id: &str) {
    if slots.get(id).is_some_and(Slot::is_empty) {
        slots.remove(id);
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    slots: Arc<Slots>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` on the callback registry of `id`, creating the slot if needed.
    ///
    /// The slot lock is held throughout so the slot cannot be pruned before
    /// `f` registers its handler.
    pub fn with_callbacks<T>(&self, id: &str, f: impl FnOnce(&CallbackRegistry) -> T) -> T {
        let mut slots = self.slots.lock();
        let slot = slots.entry(id.to_string()).or_default();
        let out = f(&slot.callbacks);
        prune(&mut slots, id);
        out
    }

    /// Remove one handler of `id` without creating a slot for it.
    pub fn unregister_callback(&self, id: &str, callback: CallbackId) -> bool {
        let mut slots = self.slots.lock();
        let removed = slots
            .get(id)
            .is_some_and(|slot| slot.callbacks.unregister(callback));
        prune(&mut slots, id);
        removed
    }

    /// Remove every handler of `category` for `id`.
    pub fn unregister_category(&self, id: &str, category: &NotificationCategory) -> usize {
        let mut slots = self.slots.lock();
        let removed = slots
            .get(id)
            .map_or(0, |slot| slot.callbacks.unregister_category(category));
        prune(&mut slots, id);
        removed
    }

    /// Number of identifiers the registry tracks.
    pub fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Session currently registered under `id`.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.slots.lock().get(id).and_then(|slot| slot.session.clone())
    }

    /// Identifiers with a registered session, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.session.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn is_live(&self, id: &str) -> bool {
        self.slots.lock().get(id).is_some_and(Slot::is_live)
    }

    /// Bring up a session for the onboarding request's identifier.
    ///
    /// Launches the backend, sends `Config` and then the onboarding call,
    /// and only then marks the session ACTIVE. Any failure tears the
    /// half-built session down and frees the identifier.
    ///
    /// # Errors
    ///
    /// `SessionAlreadyActive` when the identifier has a live session, plus
    /// anything launch, `Config` or onboarding fail with.
    pub async fn activate(&self, onboarding: Onboarding, config: &FlowConfig) -> Result<SessionGuard> {
        onboarding.validate()?;
        let id = onboarding.username().to_string();

        // 1. Reserve the identifier and retire a session that lost its channel
        let (reservation, stale) = self.reserve(&id)?;
        if let Some(stale) = stale {
            debug!(session = %id, state = ?stale.state(), "terminating previous session");
            stale.terminate().await;
        }
        let options = SessionOptions::from_config(config, &id);

        // 2. Launch backend, channel and dispatcher
        let supervisor = ProcessSupervisor::new(config.backend.clone());
        let session = Arc::new(
            Session::launch(&id, supervisor, reservation.callbacks.clone(), options).await?,
        );

        // 3. Configure and onboard
        if let Err(e) = onboard(&session, &onboarding, config).await {
            warn!(session = %id, method = onboarding.method(), error = %e, "onboarding failed");
            session.terminate().await;
            return Err(e);
        }
        if !session.mark_active() {
            let reason = session.state();
            session.terminate().await;
            warn!(session = %id, ?reason, "session closed during onboarding");
            return Err(FlowError::ConnectionLost);
        }

        // 4. Publish
        reservation.commit(session.clone());
        info!(session = %id, method = onboarding.method(), "session active");

        Ok(SessionGuard {
            session,
            slots: Arc::downgrade(&self.slots),
        })
    }

    /// Mark `id` as starting. Hands back a previous session that is no longer
    /// live; the caller must finish it before launching a new backend on the
    /// same storage directory.
    fn reserve(&self, id: &str) -> Result<(Reservation, Option<Arc<Session>>)> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(id.to_string()).or_default();
        if slot.is_live() {
            return Err(FlowError::SessionAlreadyActive(id.to_string()));
        }
        slot.starting = true;
        let stale = slot.session.take();
        let reservation = Reservation {
            slots: self.slots.clone(),
            id: id.to_string(),
            callbacks: slot.callbacks.clone(),
        };
        Ok((reservation, stale))
    }

    /// Terminate the session registered under `id`. Idempotent; a no-op
    /// when nothing runs under `id`.
    pub async fn terminate(&self, id: &str) -> Result<()> {
        let session = {
            let mut slots = self.slots.lock();
            let session = slots.get_mut(id).and_then(|slot| slot.session.take());
            prune(&mut slots, id);
            session
        };
        if let Some(session) = session {
            session.terminate().await;
        }
        Ok(())
    }

    /// Terminate every registered session concurrently.
    pub async fn terminate_all(&self) {
        let sessions = self.take_all();
        if sessions.is_empty() {
            return;
        }
        debug!(count = sessions.len(), "terminating all sessions");

        let mut tasks = JoinSet::new();
        for session in sessions {
            tasks.spawn(async move { session.terminate().await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "session teardown task failed");
            }
        }
    }

    /// Synchronous teardown of every session, for `Drop`.
    pub fn abort_all(&self) {
        for session in self.take_all() {
            session.abort();
        }
    }

    fn take_all(&self) -> Vec<Arc<Session>> {
        let mut slots = self.slots.lock();
        let sessions = slots
            .values_mut()
            .filter_map(|slot| slot.session.take())
            .collect();
        slots.retain(|_, slot| !slot.is_empty());
        sessions
    }
}

/// Marks an identifier as starting until dropped or committed.
///
/// Dropping it, including when the `activate` future is cancelled, frees the
/// identifier again.
struct Reservation {
    slots: Arc<Slots>,
    id: String,
    callbacks: Arc<CallbackRegistry>,
}

impl Reservation {
    fn commit(self, session: Arc<Session>) {
        if let Some(slot) = self.slots.lock().get_mut(&self.id) {
            slot.session = Some(session);
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&self.id) {
            slot.starting = false;
        }
        prune(&mut slots, &self.id);
    }
}

async fn onboard(session: &Session, onboarding: &Onboarding, config: &FlowConfig) -> Result<()> {
    let params = config_params(config, session.storage_dir()).await?;
    session.call("Config", params).await?;
    session
        .call(onboarding.method(), onboarding.params(&config.server.uri))
        .await?;
    Ok(())
}

/// Parameters of the `Config` call for a session stored in `storage_dir`.
async fn config_params(config: &FlowConfig, storage_dir: &Path) -> Result<Value> {
    let server = &config.server;

    let schema_dir = match &server.schema_dir {
        Some(dir) if !dir.exists() => {
            return Err(FlowError::Config(format!(
                "schema directory {} does not exist",
                dir.display()
            )))
        }
        Some(dir) => dir.display().to_string(),
        None => String::new(),
    };

    let attachment_dir = server
        .attachment_dir
        .clone()
        .unwrap_or_else(|| storage_dir.join("attachments"));
    tokio::fs::create_dir_all(&attachment_dir).await.map_err(|e| {
        FlowError::Config(format!(
            "cannot create attachment directory {}: {}",
            attachment_dir.display(),
            e
        ))
    })?;

    Ok(json!({
        "FlowServHost": server.host,
        "FlowServPort": server.port,
        "FlowLocalDatabaseDir": storage_dir.display().to_string(),
        "FlowLocalSchemaDir": schema_dir,
        "FlowLocalAttachmentDir": attachment_dir.display().to_string(),
        "FlowUseTLS": server.use_tls,
    }))
}

/// Scoped ownership of an active session.
///
/// Derefs to [`Session`]. Call [`SessionGuard::terminate`] for a graceful
/// shutdown; dropping the guard instead aborts the session (backend killed,
/// waiting callers fail with `Terminated`). Either way the identifier is
/// free again afterwards.
pub struct SessionGuard {
    session: Arc<Session>,
    slots: Weak<Slots>,
}

impl SessionGuard {
    /// Shared handle to the session, for moving into tasks. The session
    /// still ends when the guard does.
    pub fn session(&self) -> Arc<Session> {
        self.session.clone()
    }

    /// Gracefully terminate and release the session.
    pub async fn terminate(self) {
        self.session.terminate().await;
    }
}

impl Deref for SessionGuard {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.abort();
        if let Some(slots) = self.slots.upgrade() {
            let mut slots = slots.lock();
            if let Some(slot) = slots.get_mut(self.session.id()) {
                if slot
                    .session
                    .as_ref()
                    .is_some_and(|s| Arc::ptr_eq(s, &self.session))
                {
                    slot.session = None;
                }
            }
            prune(&mut slots, self.session.id());
        }
    }
}

impl std::fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SessionGuard").field(&self.session).finish()
    }
}
