use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use flume::Receiver;

use crate::backend::ChatBackend;
use crate::chunker::ReplyChunker;
use crate::config::{normalize_watch_list, ListenerConfig, ReportConfig};
use crate::dispatch::{DispatchSettings, Dispatcher, StopSignal};
use crate::events::{EventLog, LogEvent};
use crate::filter::MessageFilter;
use crate::llm_client::{CompletionClient, CompletionSettings, Responder, RetryPolicy, REPLY_BANNER};
use crate::report::HourlyReport;

struct RunState {
    signal: Arc<StopSignal>,
    started_at: DateTime<Local>,
    worker: JoinHandle<()>,
}

/// Owns the dispatch worker: at most one runs at a time.
///
/// A worker that outlives its stop timeout stays tracked here until it exits,
/// and no new one is started before then.
pub struct ListenerController {
    config: ListenerConfig,
    backend: Arc<dyn ChatBackend>,
    responder: Option<Arc<dyn Responder>>,
    log: EventLog,
    events: Receiver<LogEvent>,
    run: Option<RunState>,
}

impl ListenerController {
    pub fn new(config: ListenerConfig, backend: Arc<dyn ChatBackend>) -> Self {
        let (log, events) = EventLog::channel();
        Self {
            config,
            backend,
            responder: None,
            log,
            events,
            run: None,
        }
    }

    /// Use `responder` instead of building a completion client from the config.
    pub fn with_responder(mut self, responder: Arc<dyn Responder>) -> Self {
        self.responder = Some(responder);
        self
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Activity stream for the control surface. Receivers compete for events.
    pub fn subscribe(&self) -> Receiver<LogEvent> {
        self.events.clone()
    }

    pub fn configure(&mut self, api_key: &str) {
        let api_key = api_key.trim();
        self.config.llm_api_key = (!api_key.is_empty()).then(|| api_key.to_string());
        if self.config.llm_api_key.is_some() {
            self.log.info("Completion API key set");
        } else {
            self.log.warn("Completion API key cleared");
        }
    }

    /// Whether a worker thread is alive, including one still finishing after stop.
    pub fn is_running(&self) -> bool {
        self.run
            .as_ref()
            .map(|run| !run.worker.is_finished())
            .unwrap_or(false)
    }

    /// A stop was requested but the worker has not exited yet.
    pub fn is_stopping(&self) -> bool {
        self.run
            .as_ref()
            .map(|run| !run.signal.is_running() && !run.worker.is_finished())
            .unwrap_or(false)
    }

    pub fn started_at(&self) -> Option<DateTime<Local>> {
        self.run.as_ref().map(|run| run.started_at)
    }

    pub fn uptime(&self) -> Option<chrono::Duration> {
        self.started_at().map(|started| Local::now() - started)
    }

    /// Spawn the dispatch worker. Does nothing if one is already running, and
    /// fails while a stopped worker is still finishing its current step.
    pub fn start(&mut self, watch_list: Vec<String>, report: ReportConfig) -> Result<()> {
        if self.is_stopping() {
            anyhow::bail!("Previous dispatch worker is still finishing; try again shortly");
        }
        if self.is_running() {
            self.log.info("Listener already running");
            return Ok(());
        }
        self.reap_worker();

        self.config.watch_list = normalize_watch_list(watch_list);
        self.config.report = report;
        self.config.validate()?;

        let responder = match &self.responder {
            Some(responder) => responder.clone(),
            None => self.completion_client()?,
        };

        let report = match self.config.report_target() {
            Some(target) if self.config.report.enabled => HourlyReport::new(
                true,
                target,
                self.config.report.template.clone(),
                self.config.report.grace_secs,
            ),
            _ => HourlyReport::disabled(),
        };
        let report_target = report.enabled.then(|| report.target.clone());

        let signal = StopSignal::new();
        let dispatcher = Dispatcher::new(
            self.backend.clone(),
            responder,
            MessageFilter::new(self.config.skip_phrases.clone()),
            ReplyChunker::new(self.config.max_message_length, REPLY_BANNER),
            report,
            DispatchSettings::from_config(&self.config),
            self.log.clone(),
            signal.clone(),
        );

        signal.set_running();
        let worker_log = self.log.clone();
        let worker = std::thread::Builder::new()
            .name("autoreply-dispatch".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        worker_log.error(format!("Failed to start dispatch runtime: {}", e));
                        return;
                    }
                };
                rt.block_on(dispatcher.run());
            });
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                signal.request_stop();
                return Err(e).context("Failed to spawn dispatch worker");
            }
        };

        let started_at = Local::now();
        self.run = Some(RunState {
            signal,
            started_at,
            worker,
        });

        self.log.info(format!(
            "Listener started at {}, watching: {}",
            started_at.format("%Y-%m-%d %H:%M:%S"),
            self.config.watch_list.join(", ")
        ));
        if let Some(target) = report_target {
            self.log
                .info(format!("Hourly report enabled, recipient: [{}]", target));
        }
        Ok(())
    }

    /// Ask the worker to stop and wait up to `stop_timeout` for it.
    ///
    /// Returns `false` if the worker was still busy (e.g. inside an HTTP call)
    /// when the wait ran out. It keeps running until its current step is done
    /// and [`is_running`](Self::is_running) stays true until then.
    pub fn stop(&mut self) -> bool {
        let Some(run) = self.run.as_ref() else {
            return true;
        };

        run.signal.request_stop();
        let deadline = Instant::now() + self.config.stop_timeout();
        while !run.worker.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        if !run.worker.is_finished() {
            self.log.warn(format!(
                "Dispatch worker did not exit within {:?}; it will stop after its current step",
                self.config.stop_timeout()
            ));
            return false;
        }

        self.reap_worker();
        self.log.info("Listener stopped");
        true
    }

    /// Join a worker that has already exited.
    fn reap_worker(&mut self) {
        let Some(run) = self.run.take() else {
            return;
        };
        if run.worker.join().is_err() {
            self.log.error("Dispatch worker panicked");
        }
    }

    fn completion_client(&self) -> Result<Arc<dyn Responder>> {
        let settings = CompletionSettings::from_config(&self.config);
        let client = CompletionClient::new(settings, RetryPolicy::from_config(&self.config))?;
        if !client.is_configured() {
            anyhow::bail!("Completion API key is not configured");
        }
        Ok(Arc::new(client))
    }
}

impl Drop for ListenerController {
    fn drop(&mut self) {
        self.stop();
    }
}
