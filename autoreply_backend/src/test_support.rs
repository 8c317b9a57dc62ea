//! In-memory collaborators for dispatcher and controller tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::backend::{ChatBackend, IncomingMessage, MessageBatch};
use crate::llm_client::Responder;

/// Chat client that replays queued batches and records every send.
#[derive(Default)]
pub struct ScriptedBackend {
    self_name: Option<String>,
    peers: Vec<String>,
    batches: Mutex<VecDeque<Result<MessageBatch, String>>>,
    sent: Mutex<Vec<(String, String)>>,
    failing_texts: Mutex<HashSet<String>>,
    listen_targets: Mutex<Vec<String>>,
    fetches: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(self_name: &str) -> Self {
        Self {
            self_name: Some(self_name.to_string()),
            peers: vec!["Alice".to_string(), "Team".to_string()],
            ..Self::default()
        }
    }

    /// A client whose identity lookup fails.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn push_batch(&self, messages: Vec<IncomingMessage>) {
        let mut batch = MessageBatch::new();
        for message in messages {
            batch.entry(message.peer.clone()).or_default().push(message);
        }
        self.batches.lock().unwrap().push_back(Ok(batch));
    }

    pub fn push_fetch_error(&self, error: &str) {
        self.batches
            .lock()
            .unwrap()
            .push_back(Err(error.to_string()));
    }

    /// Sending exactly `text` will fail.
    pub fn fail_on(&self, text: &str) {
        self.failing_texts.lock().unwrap().insert(text.to_string());
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn listen_targets(&self) -> Vec<String> {
        self.listen_targets.lock().unwrap().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn list_peers(&self) -> Result<Vec<String>> {
        Ok(self.peers.clone())
    }

    async fn add_listen_target(&self, peer: &str) -> Result<()> {
        self.listen_targets.lock().unwrap().push(peer.to_string());
        Ok(())
    }

    async fn fetch_new_messages(&self) -> Result<MessageBatch> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        match self.batches.lock().unwrap().pop_front() {
            Some(Ok(batch)) => Ok(batch),
            Some(Err(e)) => Err(anyhow::anyhow!(e)),
            None => Ok(MessageBatch::new()),
        }
    }

    async fn send_text(&self, peer: &str, text: &str) -> Result<()> {
        if self.failing_texts.lock().unwrap().contains(text) {
            anyhow::bail!("send of {:?} to {} rejected", text, peer);
        }
        self.sent
            .lock()
            .unwrap()
            .push((peer.to_string(), text.to_string()));
        Ok(())
    }

    async fn self_display_name(&self) -> Result<String> {
        self.self_name
            .clone()
            .ok_or_else(|| anyhow::anyhow!("client window not found"))
    }
}

/// Replies from a fixed table, `re: <message>` otherwise.
#[derive(Default)]
pub struct CannedResponder {
    replies: HashMap<String, String>,
    delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
}

impl CannedResponder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(mut self, message: &str, reply: &str) -> Self {
        self.replies.insert(message.to_string(), reply.to_string());
        self
    }

    /// Take `delay` to answer, like a slow completion endpoint.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Responder for CannedResponder {
    async fn reply(&self, message: &str) -> String {
        self.calls.lock().unwrap().push(message.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.replies
            .get(message)
            .cloned()
            .unwrap_or_else(|| format!("re: {}", message))
    }
}
