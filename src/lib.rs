//! # flow-client
//!
//! Client runtime for a locally spawned Flow messaging backend.
//!
//! Each account session runs its own backend process. The client launches
//! it, connects to its IPC endpoint and multiplexes request/response calls
//! and pushed notifications over that one channel.
//!
//! ## Architecture
//!
//! - **Supervisor**: spawns, connects to and stops the backend process
//! - **Channel**: length-prefixed binary frames with MsgPack payloads, one
//!   writer task per session
//! - **Engine**: pending-call table matching responses to calls by id
//! - **Dispatcher**: one reader task per session routing responses and
//!   notifications
//! - **Registry**: at most one live session per account identifier
//!
//! ## Example
//!
//! ```ignore
//! use flow_client::{CreateAccount, Flow, FlowConfig};
//!
//! #[tokio::main]
//! async fn main() -> flow_client::Result<()> {
//!     let flow = Flow::new(FlowConfig::from_env())?;
//!     let session = flow.create_account(CreateAccount::new("alice", "secret")).await?;
//!
//!     let org = session.new_org("team", true).await?;
//!     println!("created {org}");
//!
//!     session.terminate().await;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod callbacks;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod flow;
pub mod notification;
pub mod onboarding;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod session;
pub mod supervisor;
pub mod transport;
pub mod writer;

pub use api::{Attachment, MemberState, OutgoingMessage};
pub use callbacks::{CallbackId, Handler};
pub use config::{BackendConfig, FlowConfig, ServerConfig};
pub use error::{FlowError, Result};
pub use flow::Flow;
pub use notification::{MessageNotification, MessageRecord, NotificationCategory, NotificationEvent};
pub use onboarding::{CreateAccount, CreateDevice, Onboarding, StartUp};
pub use registry::SessionGuard;
pub use session::{Session, SessionOptions, SessionState};
