pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What kind of entry the chat client reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Written by a contact or group member.
    Friend,
    /// Injected by the chat client (join notices, pins, etc.)
    System,
    /// Sent from this account.
    #[serde(rename = "self")]
    Own,
    /// Time separators shown between bursts of messages.
    Time,
    #[serde(untagged)]
    Other(String),
}

/// A message pulled from the chat client, detached from backend types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    /// Session the message arrived in (contact or group display name).
    pub peer: String,
    pub sender: String,
    pub kind: MessageKind,
    pub text: String,
    pub time: DateTime<Local>,
}

impl IncomingMessage {
    pub fn friend(peer: &str, sender: &str, text: &str) -> Self {
        Self {
            peer: peer.to_string(),
            sender: sender.to_string(),
            kind: MessageKind::Friend,
            text: text.to_string(),
            time: Local::now(),
        }
    }
}

/// New messages since the previous fetch, keyed by peer, each list in arrival order.
pub type MessageBatch = HashMap<String, Vec<IncomingMessage>>;

/// The chat client the dispatcher drives.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Human-readable name for logs
    fn name(&self) -> &str;

    /// Sessions currently visible to the client.
    async fn list_peers(&self) -> Result<Vec<String>>;

    /// Start collecting messages for `peer`.
    async fn add_listen_target(&self, peer: &str) -> Result<()>;

    /// Drain messages received since the last call.
    async fn fetch_new_messages(&self) -> Result<MessageBatch>;

    async fn send_text(&self, peer: &str, text: &str) -> Result<()>;

    /// Display name of the account the client is logged into.
    async fn self_display_name(&self) -> Result<String>;
}
