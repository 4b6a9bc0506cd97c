//! Notification events pushed by the backend.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Events kept for `wait_for_notification` before the oldest is dropped.
pub const DEFAULT_NOTIFICATION_BUFFER: usize = 128;

/// Category tag of a notification.
///
/// Unknown tags are kept verbatim in [`NotificationCategory::Other`] so a
/// newer backend never breaks dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NotificationCategory {
    Org,
    Channel,
    Message,
    Hwm,
    ChannelMemberEvent,
    OrgMemberEvent,
    OrgJoinRequest,
    PeerVerification,
    Profile,
    UploadStart,
    UploadProgress,
    UploadComplete,
    UploadError,
    DownloadStart,
    DownloadProgress,
    DownloadComplete,
    DownloadError,
    ChannelSessionKey,
    ChannelSessionKeyShare,
    LdapBindRequest,
    NotifyEvent,
    Other(String),
}

impl NotificationCategory {
    /// Every category the backend is known to emit.
    pub const KNOWN: [NotificationCategory; 21] = [
        NotificationCategory::Org,
        NotificationCategory::Channel,
        NotificationCategory::Message,
        NotificationCategory::Hwm,
        NotificationCategory::ChannelMemberEvent,
        NotificationCategory::OrgMemberEvent,
        NotificationCategory::OrgJoinRequest,
        NotificationCategory::PeerVerification,
        NotificationCategory::Profile,
        NotificationCategory::UploadStart,
        NotificationCategory::UploadProgress,
        NotificationCategory::UploadComplete,
        NotificationCategory::UploadError,
        NotificationCategory::DownloadStart,
        NotificationCategory::DownloadProgress,
        NotificationCategory::DownloadComplete,
        NotificationCategory::DownloadError,
        NotificationCategory::ChannelSessionKey,
        NotificationCategory::ChannelSessionKeyShare,
        NotificationCategory::LdapBindRequest,
        NotificationCategory::NotifyEvent,
    ];

    /// Wire tag.
    pub fn as_str(&self) -> &str {
        match self {
            NotificationCategory::Org => "org",
            NotificationCategory::Channel => "channel",
            NotificationCategory::Message => "message",
            NotificationCategory::Hwm => "hwm",
            NotificationCategory::ChannelMemberEvent => "channel-member-event",
            NotificationCategory::OrgMemberEvent => "org-member-event",
            NotificationCategory::OrgJoinRequest => "org-join-request",
            NotificationCategory::PeerVerification => "peer-verification",
            NotificationCategory::Profile => "profile",
            NotificationCategory::UploadStart => "upload-start-event",
            NotificationCategory::UploadProgress => "upload-progress-event",
            NotificationCategory::UploadComplete => "upload-complete-event",
            NotificationCategory::UploadError => "upload-error-event",
            NotificationCategory::DownloadStart => "download-start-event",
            NotificationCategory::DownloadProgress => "download-progress-event",
            NotificationCategory::DownloadComplete => "download-complete-event",
            NotificationCategory::DownloadError => "download-error-event",
            NotificationCategory::ChannelSessionKey => "channel-session-key",
            NotificationCategory::ChannelSessionKeyShare => "channel-session-key-share",
            NotificationCategory::LdapBindRequest => "ldap-bind-request",
            NotificationCategory::NotifyEvent => "notify-event",
            NotificationCategory::Other(tag) => tag,
        }
    }
}

impl From<&str> for NotificationCategory {
    fn from(tag: &str) -> Self {
        NotificationCategory::KNOWN
            .iter()
            .find(|known| known.as_str() == tag)
            .cloned()
            .unwrap_or_else(|| NotificationCategory::Other(tag.to_string()))
    }
}

impl From<String> for NotificationCategory {
    fn from(tag: String) -> Self {
        NotificationCategory::from(tag.as_str())
    }
}

impl From<NotificationCategory> for String {
    fn from(category: NotificationCategory) -> Self {
        category.as_str().to_string()
    }
}

impl fmt::Display for NotificationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification as delivered to callbacks and waiters. Immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEvent {
    category: NotificationCategory,
    data: Value,
}

impl NotificationEvent {
    pub fn new(category: impl Into<NotificationCategory>, data: Value) -> Self {
        Self {
            category: category.into(),
            data,
        }
    }

    pub fn category(&self) -> &NotificationCategory {
        &self.category
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn into_data(self) -> Value {
        self.data
    }

    /// Decode the payload into a typed view.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&self.data)?)
    }
}

/// Payload of a [`NotificationCategory::Message`] event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageNotification {
    pub regular_messages: Vec<MessageRecord>,
    pub channel_messages: Vec<MessageRecord>,
}

impl MessageNotification {
    /// Regular and channel messages in that order.
    pub fn all(&self) -> impl Iterator<Item = &MessageRecord> {
        self.regular_messages.iter().chain(&self.channel_messages)
    }
}

/// One message inside a message notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_account_id: Option<String>,
    /// Fields this crate does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
