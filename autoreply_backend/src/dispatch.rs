//! The polling loop: fetch → filter → reply → send.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tokio::sync::Notify;
use tokio::time::sleep;

use crate::backend::{ChatBackend, IncomingMessage};
use crate::chunker::ReplyChunker;
use crate::config::ListenerConfig;
use crate::events::EventLog;
use crate::filter::{MessageFilter, Verdict};
use crate::llm_client::Responder;
use crate::report::HourlyReport;

pub const APOLOGY_REPLY: &str = "Sorry, something went wrong while handling your message, please try again";

/// Identity used when the chat client cannot tell us who we are.
pub const UNKNOWN_SELF_NAME: &str = "unknown user";

/// Running flag shared by the controller and the dispatch worker.
#[derive(Default)]
pub struct StopSignal {
    running: AtomicBool,
    wake: Notify,
}

impl StopSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self) {
        self.running.store(true, Ordering::Release);
    }

    pub fn request_stop(&self) {
        self.running.store(false, Ordering::Release);
        self.wake.notify_waiters();
    }

    /// Sleep for `duration`, returning early on stop. Returns whether we are still running.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.wake.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent stop cannot slip between.
        notified.as_mut().enable();
        if !self.is_running() {
            return false;
        }
        tokio::select! {
            _ = sleep(duration) => {}
            _ = &mut notified => {}
        }
        self.is_running()
    }
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub watch_list: HashSet<String>,
    pub poll_interval: Duration,
    pub fetch_backoff: Duration,
    pub chunk_pacing: Duration,
}

impl DispatchSettings {
    pub fn from_config(config: &ListenerConfig) -> Self {
        Self {
            watch_list: config.watch_list.iter().cloned().collect(),
            poll_interval: config.poll_interval(),
            fetch_backoff: config.fetch_backoff(),
            chunk_pacing: config.chunk_pacing(),
        }
    }
}

type Clock = Arc<dyn Fn() -> DateTime<Local> + Send + Sync>;

pub struct Dispatcher {
    backend: Arc<dyn ChatBackend>,
    responder: Arc<dyn Responder>,
    filter: MessageFilter,
    chunker: ReplyChunker,
    report: HourlyReport,
    settings: DispatchSettings,
    log: EventLog,
    signal: Arc<StopSignal>,
    clock: Clock,
    self_name: String,
    last_seen: HashMap<String, DateTime<Local>>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        responder: Arc<dyn Responder>,
        filter: MessageFilter,
        chunker: ReplyChunker,
        report: HourlyReport,
        settings: DispatchSettings,
        log: EventLog,
        signal: Arc<StopSignal>,
    ) -> Self {
        Self {
            backend,
            responder,
            filter,
            chunker,
            report,
            settings,
            log,
            signal,
            clock: Arc::new(Local::now),
            self_name: UNKNOWN_SELF_NAME.to_string(),
            last_seen: HashMap::new(),
        }
    }

    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> DateTime<Local> + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    pub fn self_name(&self) -> &str {
        &self.self_name
    }

    /// When each peer last produced a message, forwarded or not.
    pub fn last_seen(&self) -> &HashMap<String, DateTime<Local>> {
        &self.last_seen
    }

    /// Resolve our identity, register watched peers and drop the pre-start backlog.
    pub async fn prepare(&mut self) {
        match self.backend.self_display_name().await {
            Ok(name) => {
                self.log.info(format!("Own display name: {}", name));
                self.self_name = name;
            }
            Err(e) => {
                self.log.error(format!(
                    "Failed to resolve own display name, using '{}': {:#}",
                    UNKNOWN_SELF_NAME, e
                ));
                self.self_name = UNKNOWN_SELF_NAME.to_string();
            }
        }

        match self.backend.list_peers().await {
            Ok(peers) => self.log.info(format!(
                "Connected to {}, visible sessions: {:?}",
                self.backend.name(),
                peers
            )),
            Err(e) => self
                .log
                .warn(format!("Failed to list sessions: {:#}", e)),
        }

        let mut peers: Vec<&String> = self.settings.watch_list.iter().collect();
        peers.sort();
        for peer in peers {
            match self.backend.add_listen_target(peer).await {
                Ok(()) => self.log.info(format!("Listening to [{}]", peer)),
                Err(e) => self
                    .log
                    .error(format!("Failed to listen to [{}]: {:#}", peer, e)),
            }
        }

        match self.backend.fetch_new_messages().await {
            Ok(batch) => {
                let dropped: usize = batch.values().map(Vec::len).sum();
                self.log.info(format!(
                    "Cleared {} message(s) received before start",
                    dropped
                ));
            }
            Err(e) => self
                .log
                .error(format!("Failed to clear message backlog: {:#}", e)),
        }
    }

    /// Poll until the stop signal clears. Backend errors never end the loop.
    pub async fn run(mut self) {
        self.log.info("Listening for messages...");
        self.prepare().await;

        while self.signal.is_running() {
            let pause = match self.run_cycle().await {
                Ok(()) => self.settings.poll_interval,
                Err(e) => {
                    self.log.error(format!("Error while listening: {:#}", e));
                    self.settings.fetch_backoff
                }
            };
            if !self.signal.sleep(pause).await {
                break;
            }
        }

        self.log.info("Dispatch loop exited");
    }

    /// One poll cycle without the trailing sleep. Only a failed fetch is an error.
    ///
    /// The stop signal is checked before each message, so a stop lands after the
    /// message in flight.
    pub async fn run_cycle(&mut self) -> Result<()> {
        self.maybe_send_report().await;

        let batch = self
            .backend
            .fetch_new_messages()
            .await
            .context("Failed to fetch new messages")?;

        for (peer, messages) in batch {
            if !self.settings.watch_list.contains(&peer) {
                self.log.debug(format!(
                    "Ignoring {} message(s) from unwatched [{}]",
                    messages.len(),
                    peer
                ));
                continue;
            }
            for message in messages {
                if !self.signal.is_running() {
                    self.log
                        .info("Stop requested, leaving the rest of this batch unanswered");
                    return Ok(());
                }
                self.process_message(message).await;
            }
        }

        Ok(())
    }

    async fn maybe_send_report(&mut self) {
        let now = (self.clock)();
        let Some(text) = self.report.due(&now) else {
            return;
        };

        match self.backend.send_text(&self.report.target, &text).await {
            Ok(()) => {
                self.report.mark_reported(&now);
                self.log
                    .info(format!("Sent hourly report to [{}]", self.report.target));
            }
            Err(e) => self.log.error(format!(
                "Failed to send hourly report to [{}]: {:#}",
                self.report.target, e
            )),
        }
    }

    async fn process_message(&mut self, message: IncomingMessage) {
        self.last_seen.insert(message.peer.clone(), message.time);

        match self
            .filter
            .evaluate(&message, &self.self_name, &self.settings.watch_list)
        {
            Verdict::Forward => {}
            Verdict::OwnMessage => {
                self.log.info(format!(
                    "Skipping own message in [{}]: {}...",
                    message.peer,
                    preview(&message.text, 20)
                ));
                return;
            }
            Verdict::SystemPhrase(phrase) => {
                self.log.info(format!(
                    "Skipping system or error message in [{}] ({:?}): {}...",
                    message.peer,
                    phrase,
                    preview(&message.text, 20)
                ));
                return;
            }
            other => {
                self.log.debug(format!(
                    "Not forwarding message in [{}]: {:?}",
                    message.peer, other
                ));
                return;
            }
        }

        self.log
            .info(format!("[{}] {}: {}", message.peer, message.sender, message.text));

        if let Err(e) = self.reply_to(&message).await {
            self.log
                .error(format!("Failed to reply to [{}]: {:#}", message.peer, e));
            if let Err(e) = self.backend.send_text(&message.peer, APOLOGY_REPLY).await {
                self.log
                    .debug(format!("Apology to [{}] failed too: {:#}", message.peer, e));
            }
        }
    }

    async fn reply_to(&self, message: &IncomingMessage) -> Result<()> {
        let reply = self.responder.reply(&message.text).await;
        self.log.info(format!(
            "Reply for [{}] ({} chars): {}",
            message.peer,
            reply.chars().count(),
            preview(&reply, 80)
        ));

        if self.chunker.needs_split(&reply) {
            return self.send_long(&message.peer, &reply).await;
        }

        self.backend
            .send_text(&message.peer, &reply)
            .await
            .with_context(|| format!("send to [{}] failed", message.peer))?;
        self.log.info(format!("Replied to [{}]", message.peer));
        Ok(())
    }

    /// Send a reply in parts. Fails only if no part got through.
    async fn send_long(&self, peer: &str, reply: &str) -> Result<()> {
        let parts = self.chunker.split(reply);
        let total = parts.len();
        let mut delivered = 0;

        for (index, part) in parts.iter().enumerate() {
            match self.backend.send_text(peer, part).await {
                Ok(()) => {
                    delivered += 1;
                    self.log.info(format!(
                        "Sent part {}/{} of the reply to [{}]",
                        index + 1,
                        total,
                        peer
                    ));
                }
                Err(e) => self.log.error(format!(
                    "Failed to send part {}/{} to [{}]: {:#}",
                    index + 1,
                    total,
                    peer,
                    e
                )),
            }
            if index + 1 < total {
                sleep(self.settings.chunk_pacing).await;
            }
        }

        if delivered == 0 {
            anyhow::bail!("none of the {} reply parts reached [{}]", total, peer);
        }
        Ok(())
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MessageKind;
    use crate::events::LogEvent;
    use crate::llm_client::REPLY_BANNER;
    use crate::test_support::{CannedResponder, ScriptedBackend};
    use chrono::TimeZone;

    fn settings(peers: &[&str]) -> DispatchSettings {
        DispatchSettings {
            watch_list: peers.iter().map(|p| p.to_string()).collect(),
            poll_interval: Duration::from_millis(10),
            fetch_backoff: Duration::from_millis(10),
            chunk_pacing: Duration::from_millis(1),
        }
    }

    fn dispatcher(
        backend: &Arc<ScriptedBackend>,
        responder: &Arc<CannedResponder>,
        max_len: usize,
        report: HourlyReport,
    ) -> (Dispatcher, flume::Receiver<LogEvent>) {
        let (log, rx) = EventLog::channel();
        let signal = StopSignal::new();
        signal.set_running();
        let dispatcher = Dispatcher::new(
            backend.clone(),
            responder.clone(),
            MessageFilter::default(),
            ReplyChunker::new(max_len, REPLY_BANNER),
            report,
            settings(&["Alice"]),
            log,
            signal,
        );
        (dispatcher, rx)
    }

    /// Answers, then asks the loop to stop, like a user pressing stop mid-reply.
    struct StopAfterReply {
        signal: Arc<StopSignal>,
        calls: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Responder for StopAfterReply {
        async fn reply(&self, message: &str) -> String {
            self.calls.lock().unwrap().push(message.to_string());
            self.signal.request_stop();
            format!("re: {}", message)
        }
    }

    #[tokio::test]
    async fn stop_mid_batch_leaves_remaining_messages_unanswered() {
        let backend = Arc::new(ScriptedBackend::new("Bot"));
        let (log, _rx) = EventLog::channel();
        let signal = StopSignal::new();
        signal.set_running();
        let responder = Arc::new(StopAfterReply {
            signal: signal.clone(),
            calls: std::sync::Mutex::new(Vec::new()),
        });
        let mut dispatcher = Dispatcher::new(
            backend.clone(),
            responder.clone(),
            MessageFilter::default(),
            ReplyChunker::new(2000, REPLY_BANNER),
            HourlyReport::disabled(),
            settings(&["Alice"]),
            log,
            signal.clone(),
        );

        backend.push_batch(vec![
            IncomingMessage::friend("Alice", "Alice", "first"),
            IncomingMessage::friend("Alice", "Alice", "second"),
        ]);
        dispatcher.run_cycle().await.unwrap();

        assert!(!signal.is_running());
        assert_eq!(*responder.calls.lock().unwrap(), vec!["first".to_string()]);
        assert_eq!(
            backend.sent(),
            vec![("Alice".to_string(), "re: first".to_string())]
        );
    }

    #[tokio::test]
    async fn short_reply_is_sent_once() {
        let backend = Arc::new(ScriptedBackend::new("Bot"));
        let responder = Arc::new(CannedResponder::new().with_reply("hello", "hi back"));
        let (mut dispatcher, _rx) = dispatcher(&backend, &responder, 2000, HourlyReport::disabled());
        dispatcher.prepare().await;

        backend.push_batch(vec![IncomingMessage::friend("Alice", "Alice", "hello")]);
        dispatcher.run_cycle().await.unwrap();

        assert_eq!(
            backend.sent(),
            vec![("Alice".to_string(), "hi back".to_string())]
        );
        assert_eq!(responder.calls(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn long_reply_is_split_into_paced_parts() {
        let long_reply = "x".repeat(5000);
        let backend = Arc::new(ScriptedBackend::new("Bot"));
        let responder = Arc::new(CannedResponder::new().with_reply("essay please", &long_reply));
        let (mut dispatcher, _rx) = dispatcher(&backend, &responder, 2000, HourlyReport::disabled());
        dispatcher.prepare().await;

        backend.push_batch(vec![IncomingMessage::friend("Alice", "Alice", "essay please")]);
        dispatcher.run_cycle().await.unwrap();

        let sent = backend.sent();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|(peer, _)| peer == "Alice"));
        assert!(sent[1..].iter().all(|(_, text)| !text.starts_with(REPLY_BANNER)));
        let joined: String = sent.iter().map(|(_, text)| text.as_str()).collect();
        assert_eq!(joined, long_reply);
    }

    #[tokio::test]
    async fn bannered_long_reply_keeps_banner_only_on_first_part() {
        let body = "a line of generated text\n".repeat(200);
        let reply = format!("{}{}", REPLY_BANNER, body);
        let backend = Arc::new(ScriptedBackend::new("Bot"));
        let responder = Arc::new(CannedResponder::new().with_reply("explain", &reply));
        let (mut dispatcher, _rx) = dispatcher(&backend, &responder, 2000, HourlyReport::disabled());

        backend.push_batch(vec![IncomingMessage::friend("Alice", "Alice", "explain")]);
        dispatcher.run_cycle().await.unwrap();

        let sent = backend.sent();
        assert!(sent.len() > 1);
        assert!(sent[0].1.starts_with(REPLY_BANNER));
        assert_eq!(
            sent.iter().filter(|(_, text)| text.contains(REPLY_BANNER)).count(),
            1
        );
    }

    #[tokio::test]
    async fn failing_message_does_not_stop_the_rest_of_the_batch() {
        let backend = Arc::new(ScriptedBackend::new("Bot"));
        backend.fail_on("boom");
        let responder = Arc::new(CannedResponder::new().with_reply("two", "boom"));
        let (mut dispatcher, _rx) = dispatcher(&backend, &responder, 2000, HourlyReport::disabled());

        backend.push_batch(vec![
            IncomingMessage::friend("Alice", "Alice", "one"),
            IncomingMessage::friend("Alice", "Alice", "two"),
            IncomingMessage::friend("Alice", "Alice", "three"),
        ]);
        dispatcher.run_cycle().await.unwrap();

        let texts: Vec<String> = backend.sent().into_iter().map(|(_, t)| t).collect();
        assert_eq!(
            texts,
            vec![
                "re: one".to_string(),
                APOLOGY_REPLY.to_string(),
                "re: three".to_string()
            ]
        );
        assert_eq!(responder.calls().len(), 3);
    }

    #[tokio::test]
    async fn own_system_and_unwatched_messages_are_not_answered() {
        let backend = Arc::new(ScriptedBackend::new("Bot"));
        let responder = Arc::new(CannedResponder::new());
        let (mut dispatcher, _rx) = dispatcher(&backend, &responder, 2000, HourlyReport::disabled());
        dispatcher.prepare().await;

        let mut joined = IncomingMessage::friend("Alice", "Alice", "Alice changed the topic");
        joined.kind = MessageKind::System;
        backend.push_batch(vec![
            IncomingMessage::friend("Alice", "Bot", "my own words"),
            IncomingMessage::friend("Alice", "Alice", "network connection issue"),
            joined,
            IncomingMessage::friend("Mallory", "Mallory", "answer me"),
        ]);
        dispatcher.run_cycle().await.unwrap();

        assert!(backend.sent().is_empty());
        assert!(responder.calls().is_empty());
        assert!(dispatcher.last_seen().contains_key("Alice"));
        assert!(!dispatcher.last_seen().contains_key("Mallory"));
    }

    #[tokio::test]
    async fn fetch_error_is_reported_and_next_cycle_recovers() {
        let backend = Arc::new(ScriptedBackend::new("Bot"));
        let responder = Arc::new(CannedResponder::new());
        let (mut dispatcher, _rx) = dispatcher(&backend, &responder, 2000, HourlyReport::disabled());

        backend.push_fetch_error("client window closed");
        backend.push_batch(vec![IncomingMessage::friend("Alice", "Alice", "still there?")]);

        assert!(dispatcher.run_cycle().await.is_err());
        dispatcher.run_cycle().await.unwrap();
        assert_eq!(backend.sent().len(), 1);
    }

    #[tokio::test]
    async fn prepare_falls_back_to_placeholder_identity_and_drops_backlog() {
        let backend = Arc::new(ScriptedBackend::anonymous());
        let responder = Arc::new(CannedResponder::new());
        let (mut dispatcher, rx) = dispatcher(&backend, &responder, 2000, HourlyReport::disabled());

        backend.push_batch(vec![IncomingMessage::friend("Alice", "Alice", "old message")]);
        dispatcher.prepare().await;

        assert_eq!(dispatcher.self_name(), UNKNOWN_SELF_NAME);
        assert_eq!(backend.listen_targets(), vec!["Alice".to_string()]);

        dispatcher.run_cycle().await.unwrap();
        assert!(backend.sent().is_empty());
        assert!(rx
            .try_iter()
            .any(|e| e.message.contains("Cleared 1 message(s)")));
    }

    #[tokio::test]
    async fn hourly_report_goes_out_once_within_the_grace_window() {
        let backend = Arc::new(ScriptedBackend::new("Bot"));
        let responder = Arc::new(CannedResponder::new());
        let report = HourlyReport::new(true, "Alice".to_string(), "It is {time}".to_string(), 10);
        let (dispatcher, _rx) = dispatcher(&backend, &responder, 2000, report);
        let mut dispatcher =
            dispatcher.with_clock(|| Local.with_ymd_and_hms(2026, 5, 4, 9, 0, 2).unwrap());

        dispatcher.run_cycle().await.unwrap();
        dispatcher.run_cycle().await.unwrap();

        assert_eq!(
            backend.sent(),
            vec![("Alice".to_string(), "It is 2026-05-04 09:00:02".to_string())]
        );
    }

    #[tokio::test]
    async fn stop_during_sleep_ends_the_loop_without_another_fetch() {
        let backend = Arc::new(ScriptedBackend::new("Bot"));
        let responder = Arc::new(CannedResponder::new());
        let (log, _rx) = EventLog::channel();
        let signal = StopSignal::new();
        signal.set_running();

        let mut slow = settings(&["Alice"]);
        slow.poll_interval = Duration::from_secs(60);
        let dispatcher = Dispatcher::new(
            backend.clone(),
            responder,
            MessageFilter::default(),
            ReplyChunker::new(2000, REPLY_BANNER),
            HourlyReport::disabled(),
            slow,
            log,
            signal.clone(),
        );
        let worker = tokio::spawn(dispatcher.run());

        // Backlog drain plus the first cycle, then the loop parks in its sleep.
        while backend.fetch_count() < 2 {
            sleep(Duration::from_millis(5)).await;
        }
        sleep(Duration::from_millis(20)).await;
        let fetches = backend.fetch_count();

        signal.request_stop();
        tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .expect("worker should exit promptly")
            .unwrap();
        assert_eq!(backend.fetch_count(), fetches);
    }
}
