//! Telegram Bot API adapter for [`ChatBackend`].
//!
//! Peers are addressed by display name: group title, `@username`-less user
//! name, or first + last name. Chat ids come from `telegram.peers` in the
//! config and are learned from incoming updates as chats write in.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Deserialize;
use tokio::sync::Mutex;

use super::{ChatBackend, IncomingMessage, MessageBatch, MessageKind};
use crate::config::TelegramConfig;
use crate::http_client::build_http_client;

// ─── Telegram API types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct Update {
    update_id: i64,
    message: Option<TelegramMessage>,
}

#[derive(Deserialize)]
struct TelegramMessage {
    chat: TelegramChat,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    date: i64,
    text: Option<String>,
}

#[derive(Deserialize)]
struct TelegramChat {
    id: i64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
}

#[derive(Deserialize)]
struct TelegramUser {
    id: i64,
    #[serde(default)]
    is_bot: bool,
    first_name: String,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

// ─── Backend ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct TelegramState {
    offset: i64,
    chats: HashMap<String, i64>,
    listening: HashSet<String>,
    me: Option<(i64, String)>,
}

pub struct TelegramBackend {
    client: reqwest::Client,
    api_base: String,
    state: Mutex<TelegramState>,
}

impl TelegramBackend {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        let token = config
            .bot_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .context("telegram.bot_token (or TELEGRAM_BOT_TOKEN) is required")?;

        let state = TelegramState {
            chats: config.peers.clone(),
            ..TelegramState::default()
        };

        Ok(Self {
            client: build_http_client(Some(std::time::Duration::from_secs(10)))?,
            api_base: format!("{}/bot{}", config.api_base.trim_end_matches('/'), token),
            state: Mutex::new(state),
        })
    }

    async fn call<T>(&self, method: &str, params: serde_json::Value) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let url = format!("{}/{}", self.api_base, method);
        let body: TelegramResponse<T> = self
            .client
            .post(&url)
            .json(&params)
            .timeout(std::time::Duration::from_secs(15))
            .send()
            .await
            .with_context(|| format!("Telegram {} request failed", method))?
            .json()
            .await
            .with_context(|| format!("Telegram {} returned an unreadable body", method))?;

        if !body.ok {
            anyhow::bail!(
                "Telegram {} returned ok=false: {}",
                method,
                body.description.unwrap_or_default()
            );
        }

        body.result
            .with_context(|| format!("Telegram {} returned no result", method))
    }

    async fn me(&self) -> Result<(i64, String)> {
        if let Some(me) = self.state.lock().await.me.clone() {
            return Ok(me);
        }

        let user: TelegramUser = self.call("getMe", serde_json::json!({})).await?;
        let me = (user.id, user_display_name(&user));
        self.state.lock().await.me = Some(me.clone());
        Ok(me)
    }
}

#[async_trait]
impl ChatBackend for TelegramBackend {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn list_peers(&self) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let mut peers: Vec<String> = state.chats.keys().cloned().collect();
        peers.sort();
        Ok(peers)
    }

    async fn add_listen_target(&self, peer: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.chats.contains_key(peer) {
            tracing::warn!(
                "Telegram: no chat id known for '{}' yet; it will resolve once they write",
                peer
            );
        }
        state.listening.insert(peer.to_string());
        Ok(())
    }

    async fn fetch_new_messages(&self) -> Result<MessageBatch> {
        let own_id = self.me().await.ok().map(|(id, _)| id);
        let offset = self.state.lock().await.offset;

        let updates: Vec<Update> = self
            .call(
                "getUpdates",
                serde_json::json!({
                    "offset": offset,
                    "timeout": 0,
                    "allowed_updates": ["message"]
                }),
            )
            .await?;

        let mut state = self.state.lock().await;
        let mut batch = MessageBatch::new();
        for update in updates {
            state.offset = state.offset.max(update.update_id + 1);

            let Some(msg) = update.message else {
                continue;
            };
            let peer = chat_display_name(&msg.chat);
            state.chats.insert(peer.clone(), msg.chat.id);

            if !state.listening.contains(&peer) {
                continue;
            }

            let Some(incoming) = convert_message(peer, msg, own_id) else {
                continue;
            };
            batch
                .entry(incoming.peer.clone())
                .or_default()
                .push(incoming);
        }

        Ok(batch)
    }

    async fn send_text(&self, peer: &str, text: &str) -> Result<()> {
        let chat_id = self
            .state
            .lock()
            .await
            .chats
            .get(peer)
            .copied()
            .with_context(|| format!("Telegram: unknown peer '{}'", peer))?;

        let _: serde_json::Value = self
            .call(
                "sendMessage",
                serde_json::json!({ "chat_id": chat_id, "text": text }),
            )
            .await?;
        tracing::debug!(
            "Telegram: sent {} chars to chat {}",
            text.chars().count(),
            chat_id
        );
        Ok(())
    }

    async fn self_display_name(&self) -> Result<String> {
        Ok(self.me().await?.1)
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn chat_display_name(chat: &TelegramChat) -> String {
    if let Some(title) = chat.title.as_deref().filter(|t| !t.is_empty()) {
        return title.to_string();
    }
    let full_name = join_name(chat.first_name.as_deref(), chat.last_name.as_deref());
    if !full_name.is_empty() {
        return full_name;
    }
    chat.username
        .clone()
        .unwrap_or_else(|| chat.id.to_string())
}

fn user_display_name(user: &TelegramUser) -> String {
    let full_name = join_name(Some(&user.first_name), user.last_name.as_deref());
    if !full_name.is_empty() {
        return full_name;
    }
    user.username
        .clone()
        .unwrap_or_else(|| user.id.to_string())
}

fn join_name(first: Option<&str>, last: Option<&str>) -> String {
    [first, last]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn convert_message(
    peer: String,
    msg: TelegramMessage,
    own_id: Option<i64>,
) -> Option<IncomingMessage> {
    let (sender, kind) = match msg.from {
        Some(ref user) if Some(user.id) == own_id => (user_display_name(user), MessageKind::Own),
        Some(ref user) if user.is_bot => (
            user_display_name(user),
            MessageKind::Other("bot".to_string()),
        ),
        Some(ref user) => (user_display_name(user), MessageKind::Friend),
        None => (peer.clone(), MessageKind::System),
    };

    // Stickers, photos and service notices carry no text to forward.
    let text = msg.text?;

    let time = DateTime::from_timestamp(msg.date, 0)
        .map(|t| t.with_timezone(&Local))
        .unwrap_or_else(Local::now);

    Some(IncomingMessage {
        peer,
        sender,
        kind,
        text,
        time,
    })
}
