//! Backend data operations.
//!
//! Thin typed wrappers over [`Session::call`]. Result shapes belong to the
//! backend, so most operations hand back the raw [`Value`]; the few with a
//! scalar result decode it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{FlowError, Result};
use crate::session::Session;

/// Role of an account within an org or channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    #[serde(rename = "m")]
    Member,
    #[serde(rename = "a")]
    Admin,
    #[serde(rename = "o")]
    Owner,
    #[serde(rename = "b")]
    Blocked,
}

impl MemberState {
    pub fn as_str(self) -> &'static str {
        match self {
            MemberState::Member => "m",
            MemberState::Admin => "a",
            MemberState::Owner => "o",
            MemberState::Blocked => "b",
        }
    }
}

/// An uploaded file, ready to go into [`OutgoingMessage::with_attachment`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub filename: String,
}

/// A message for [`Session::send_message`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingMessage {
    #[serde(rename = "OrgID")]
    pub org_id: String,
    #[serde(rename = "ChannelID")]
    pub channel_id: String,
    #[serde(rename = "Text")]
    pub text: String,
    #[serde(rename = "OtherData")]
    pub other_data: Option<Value>,
    #[serde(rename = "Attachments")]
    pub attachments: Option<Vec<Value>>,
}

impl OutgoingMessage {
    pub fn new(
        org_id: impl Into<String>,
        channel_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            org_id: org_id.into(),
            channel_id: channel_id.into(),
            text: text.into(),
            other_data: None,
            attachments: None,
        }
    }

    pub fn with_other_data(mut self, data: Value) -> Self {
        self.other_data = Some(data);
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Value>) -> Self {
        self.attachments = Some(attachments);
        self
    }

    pub fn with_attachment(mut self, attachment: &Attachment) -> Self {
        self.attachments
            .get_or_insert_with(Vec::new)
            .push(json!({ "id": attachment.id, "filename": attachment.filename }));
        self
    }
}

impl Session {
    pub async fn account_id(&self) -> Result<String> {
        self.call_as("AccountId", json!({})).await
    }

    pub async fn device_id(&self) -> Result<String> {
        self.call_as("DeviceId", json!({})).await
    }

    /// Username and server URI of the account.
    pub async fn identifier(&self) -> Result<Value> {
        self.call("Identifier", json!({})).await
    }

    /// Build number of the backend binary.
    pub async fn build_number(&self) -> Result<Value> {
        self.call("BuildNumber", json!({})).await
    }

    /// Fingerprint of the account's latest keyring.
    pub async fn keyring_fingerprint(&self) -> Result<String> {
        self.call_as("KeyRingFingerprint", json!({})).await
    }

    pub async fn new_org(&self, name: &str, discoverable: bool) -> Result<Value> {
        self.call(
            "NewOrg",
            json!({ "Name": name, "Discoverable": discoverable }),
        )
        .await
    }

    /// Create a channel in `org_id`. Returns the new channel id.
    pub async fn new_channel(&self, org_id: &str, name: &str) -> Result<String> {
        self.call_as("NewChannel", json!({ "OrgID": org_id, "Name": name }))
            .await
    }

    /// Ask to join an existing org.
    pub async fn new_org_join_request(&self, org_id: &str) -> Result<()> {
        self.call("NewOrgJoinRequest", json!({ "OrgID": org_id }))
            .await?;
        Ok(())
    }

    pub async fn enumerate_org_join_requests(&self, org_id: &str) -> Result<Value> {
        self.call("EnumerateOrgJoinRequests", json!({ "OrgID": org_id }))
            .await
    }

    /// Add `account_id` to an org. Needs admin rights in the org.
    pub async fn org_add_member(
        &self,
        org_id: &str,
        account_id: &str,
        state: MemberState,
    ) -> Result<()> {
        self.call(
            "OrgAddMember",
            json!({ "OrgID": org_id, "MemberAccountID": account_id, "MemberState": state }),
        )
        .await?;
        Ok(())
    }

    pub async fn set_org_member_state(
        &self,
        org_id: &str,
        account_id: &str,
        state: MemberState,
    ) -> Result<()> {
        self.call(
            "SetOrgMemberState",
            json!({ "OrgID": org_id, "MemberAccountID": account_id, "MemberState": state }),
        )
        .await?;
        Ok(())
    }

    /// Extra data of an org.
    pub async fn get_org_data(&self, org_id: &str) -> Result<Value> {
        self.call("GetOrgData", json!({ "OrgID": org_id })).await
    }

    pub async fn channel_add_member(
        &self,
        org_id: &str,
        channel_id: &str,
        account_id: &str,
        state: MemberState,
    ) -> Result<()> {
        self.call(
            "ChannelAddMember",
            json!({
                "OrgID": org_id,
                "ChannelID": channel_id,
                "MemberAccountID": account_id,
                "MemberState": state
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn new_channel_member_state(
        &self,
        org_id: &str,
        channel_id: &str,
        account_id: &str,
        state: MemberState,
    ) -> Result<()> {
        self.call(
            "NewChannelMemberState",
            json!({
                "OrgID": org_id,
                "ChannelID": channel_id,
                "MemberAccountID": account_id,
                "MemberState": state
            }),
        )
        .await?;
        Ok(())
    }

    /// Open a direct conversation with `account_id`. Returns the channel id.
    pub async fn new_direct_conversation(&self, org_id: &str, account_id: &str) -> Result<String> {
        self.call_as(
            "NewDirectConversation",
            json!({ "OrgID": org_id, "MemberID": account_id }),
        )
        .await
    }

    /// Remove a channel by banning all of its members.
    pub async fn delete_channel(&self, org_id: &str, channel_id: &str) -> Result<()> {
        self.call(
            "DeleteChannel",
            json!({ "OrgID": org_id, "ChannelID": channel_id }),
        )
        .await?;
        Ok(())
    }

    /// Orgs the account is a member of.
    pub async fn enumerate_orgs(&self) -> Result<Value> {
        self.call("EnumerateOrgs", json!({})).await
    }

    pub async fn enumerate_org_members(&self, org_id: &str) -> Result<Value> {
        self.call("EnumerateOrgMembers", json!({ "OrgID": org_id }))
            .await
    }

    pub async fn enumerate_channels(&self, org_id: &str) -> Result<Value> {
        self.call("EnumerateChannels", json!({ "OrgID": org_id })).await
    }

    pub async fn enumerate_channel_members(&self, channel_id: &str) -> Result<Value> {
        self.call("EnumerateChannelMembers", json!({ "ChannelID": channel_id }))
            .await
    }

    /// Messages of a channel. `filters` is passed through untouched.
    pub async fn enumerate_messages(
        &self,
        org_id: &str,
        channel_id: &str,
        filters: Option<Value>,
    ) -> Result<Value> {
        self.call(
            "EnumerateMessages",
            json!({ "OrgID": org_id, "ChannelID": channel_id, "Filters": filters }),
        )
        .await
    }

    /// Accounts with local data on this device.
    pub async fn enumerate_local_accounts(&self) -> Result<Value> {
        self.call("EnumerateLocalAccounts", json!({})).await
    }

    pub async fn enumerate_peer_accounts(&self) -> Result<Value> {
        self.call("EnumeratePeerAccounts", json!({})).await
    }

    pub async fn enumerate_peer_verifications(&self) -> Result<Value> {
        self.call("EnumeratePeerVerifications", json!({})).await
    }

    pub async fn get_channel(&self, channel_id: &str) -> Result<Value> {
        self.call("GetChannel", json!({ "ChannelID": channel_id }))
            .await
    }

    pub async fn get_peer(&self, username: &str) -> Result<Value> {
        self.call("GetPeer", json!({ "PeerUsername": username })).await
    }

    pub async fn get_peer_from_id(&self, account_id: &str) -> Result<Value> {
        self.call("GetPeerFromID", json!({ "PeerID": account_id }))
            .await
    }

    /// Peer record of this account.
    pub async fn peer_data(&self) -> Result<Value> {
        self.call("PeerData", json!({})).await
    }

    /// Devices registered to the account.
    pub async fn get_devices(&self) -> Result<Value> {
        self.call("GetDevices", json!({})).await
    }

    /// Unread messages in a channel since its read HWM. The backend caps the
    /// count at 101.
    pub async fn get_unread_count(&self, org_id: &str, channel_id: &str) -> Result<u64> {
        self.call_as(
            "GetUnreadCount",
            json!({ "OrgID": org_id, "ChannelID": channel_id }),
        )
        .await
    }

    pub async fn search(&self, org_id: &str, channel_id: &str, query: &str) -> Result<Value> {
        self.call(
            "Search",
            json!({ "OrgID": org_id, "ChannelID": channel_id, "Search": query }),
        )
        .await
    }

    /// Send a message. Returns the new message id.
    pub async fn send_message(&self, message: &OutgoingMessage) -> Result<String> {
        self.call_as("SendMessage", serde_json::to_value(message)?)
            .await
    }

    /// Start uploading `file_path` into `org_id`.
    ///
    /// Progress is reported through `upload` notifications. `file_path` must
    /// be absolute since the backend resolves it from its own directory.
    pub async fn new_attachment(&self, org_id: &str, file_path: &Path) -> Result<Attachment> {
        if !file_path.is_absolute() {
            return Err(FlowError::InvalidArgument(format!(
                "attachment path {} is not absolute",
                file_path.display()
            )));
        }
        let filename = file_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                FlowError::InvalidArgument(format!("{} names no file", file_path.display()))
            })?;

        let id: String = self
            .call_as(
                "NewAttachment",
                json!({ "OrgID": org_id, "FilePath": file_path.display().to_string() }),
            )
            .await?;
        Ok(Attachment { id, filename })
    }

    /// Request download of an attachment. Status arrives as `download`
    /// notifications.
    pub async fn start_attachment_download(
        &self,
        attachment_id: &str,
        org_id: &str,
        channel_id: &str,
        message_id: &str,
    ) -> Result<()> {
        self.call(
            "StartAttachmentDownload",
            json!({
                "AttachmentID": attachment_id,
                "OrgID": org_id,
                "ChannelID": channel_id,
                "MessageID": message_id
            }),
        )
        .await?;
        Ok(())
    }

    /// Where a downloaded attachment was stored.
    pub async fn stored_attachment_path(&self, org_id: &str, attachment_id: &str) -> Result<PathBuf> {
        self.call_as(
            "StoredAttachmentPath",
            json!({ "OrgID": org_id, "AttachmentID": attachment_id }),
        )
        .await
    }

    /// Move a finished upload or download to `new_path`.
    pub async fn update_attachment_path(&self, attachment_id: &str, new_path: &Path) -> Result<()> {
        self.call(
            "UpdateAttachmentPath",
            json!({ "AttachmentID": attachment_id, "NewPath": new_path.display().to_string() }),
        )
        .await?;
        Ok(())
    }

    /// Move the account's read high-water mark in a channel to `message_id`.
    pub async fn set_channel_read_hwm(
        &self,
        org_id: &str,
        channel_id: &str,
        message_id: &str,
    ) -> Result<()> {
        self.call(
            "SetChannelReadHWM",
            json!({ "OrgID": org_id, "ChannelID": channel_id, "MessageID": message_id }),
        )
        .await?;
        Ok(())
    }

    /// Disconnect from the notification service. Requests already in
    /// progress may still complete.
    pub async fn pause(&self) -> Result<()> {
        self.call("Pause", json!({})).await?;
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        self.call("Resume", json!({})).await?;
        Ok(())
    }
}
