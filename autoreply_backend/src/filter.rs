use std::collections::HashSet;

use crate::backend::{IncomingMessage, MessageKind};
use crate::config::default_skip_phrases;

/// Why a message was or was not forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Forward,
    /// Written by us; answering it would loop forever.
    OwnMessage,
    /// Contains a phrase injected by the chat client or by our own fallbacks.
    SystemPhrase(String),
    NotFromFriend,
    NotWatched,
}

impl Verdict {
    pub fn is_forward(&self) -> bool {
        matches!(self, Verdict::Forward)
    }
}

/// Gatekeeper between the chat client and the completion endpoint.
#[derive(Debug, Clone)]
pub struct MessageFilter {
    skip_phrases: Vec<String>,
}

impl Default for MessageFilter {
    fn default() -> Self {
        Self::new(default_skip_phrases())
    }
}

impl MessageFilter {
    /// Phrases are matched as literal, case-sensitive substrings. Empty ones are ignored.
    pub fn new(skip_phrases: Vec<String>) -> Self {
        Self {
            skip_phrases: skip_phrases
                .into_iter()
                .filter(|phrase| !phrase.is_empty())
                .collect(),
        }
    }

    pub fn evaluate(
        &self,
        message: &IncomingMessage,
        self_name: &str,
        watch_list: &HashSet<String>,
    ) -> Verdict {
        if message.sender == self_name {
            return Verdict::OwnMessage;
        }

        if let Some(phrase) = self
            .skip_phrases
            .iter()
            .find(|phrase| message.text.contains(phrase.as_str()))
        {
            return Verdict::SystemPhrase(phrase.clone());
        }

        if message.kind != MessageKind::Friend {
            return Verdict::NotFromFriend;
        }

        if !watch_list.contains(&message.peer) {
            return Verdict::NotWatched;
        }

        Verdict::Forward
    }

    pub fn should_forward(
        &self,
        message: &IncomingMessage,
        self_name: &str,
        watch_list: &HashSet<String>,
    ) -> bool {
        self.evaluate(message, self_name, watch_list).is_forward()
    }
}
