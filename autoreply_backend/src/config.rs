use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Peer that receives the hourly announcement. Empty means "first watched peer".
    #[serde(default)]
    pub target: String,
    /// `{time}` is replaced with the local timestamp.
    #[serde(default = "default_report_template")]
    pub template: String,
    #[serde(default = "default_report_grace_secs")]
    pub grace_secs: u32,
}

fn default_report_template() -> String {
    "⏰ It is now {time}, hourly time report!".to_string()
}

fn default_report_grace_secs() -> u32 {
    10
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target: String::new(),
            template: default_report_template(),
            grace_secs: default_report_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
    /// Known peers by display name. Chats seen in updates are learned on the fly.
    #[serde(default)]
    pub peers: HashMap<String, i64>,
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_string()
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_base: default_telegram_api_base(),
            peers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    // LLM configuration (OpenAI-compatible chat completions)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    // Retry budget
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_base_timeout_secs")]
    pub base_timeout_secs: u64,
    #[serde(default = "default_timeout_step_secs")]
    pub timeout_step_secs: u64,

    // Listening
    #[serde(default)]
    pub watch_list: Vec<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_fetch_backoff_secs")]
    pub fetch_backoff_secs: u64,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_skip_phrases")]
    pub skip_phrases: Vec<String>,

    // Long replies
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
    #[serde(default = "default_chunk_pacing_ms")]
    pub chunk_pacing_ms: u64,

    #[serde(default)]
    pub report: ReportConfig,

    #[serde(default)]
    pub telegram: TelegramConfig,
}

fn default_llm_url() -> String {
    "https://api.deepseek.com".to_string()
}

fn default_llm_model() -> String {
    "deepseek-chat".to_string()
}

fn default_system_prompt() -> String {
    "You are a helpful assistant.".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_retries() -> u32 {
    2
}

fn default_base_timeout_secs() -> u64 {
    15
}

fn default_timeout_step_secs() -> u64 {
    5
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_fetch_backoff_secs() -> u64 {
    5
}

fn default_stop_timeout_secs() -> u64 {
    2
}

pub fn default_skip_phrases() -> Vec<String> {
    vec![
        "new messages follow".to_string(),
        "please reply on receipt".to_string(),
        "additional notice".to_string(),
        "network connection issue".to_string(),
    ]
}

fn default_max_message_length() -> usize {
    2000
}

fn default_chunk_pacing_ms() -> u64 {
    500
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            system_prompt: default_system_prompt(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            retries: default_retries(),
            base_timeout_secs: default_base_timeout_secs(),
            timeout_step_secs: default_timeout_step_secs(),
            watch_list: Vec::new(),
            poll_interval_ms: default_poll_interval_ms(),
            fetch_backoff_secs: default_fetch_backoff_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            skip_phrases: default_skip_phrases(),
            max_message_length: default_max_message_length(),
            chunk_pacing_ms: default_chunk_pacing_ms(),
            report: ReportConfig::default(),
            telegram: TelegramConfig::default(),
        }
    }
}

impl ListenerConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("autoreply_config.toml")
    }

    /// Load config from autoreply_config.toml (next to executable), falling back to env vars
    pub fn load() -> Self {
        let path = Self::config_path();
        match Self::load_from(&path) {
            Ok(config) => {
                tracing::info!("Loaded config from {:?}", path);
                config
            }
            Err(e) => {
                if path.exists() {
                    tracing::error!("Failed to parse {:?}: {:#}", path, e);
                }
                tracing::warn!("No usable config file, using defaults + env vars");
                Self::from_env()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        toml::from_str(&contents).with_context(|| format!("Invalid config in {:?}", path))
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Load from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    pub fn apply_env(&mut self) {
        if let Ok(url) = env::var("LLM_API_URL") {
            self.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            self.llm_model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            if !key.trim().is_empty() {
                self.llm_api_key = Some(key.trim().to_string());
            }
        }

        if let Ok(list) = env::var("AUTOREPLY_WATCH") {
            self.watch_list = parse_watch_list(&list);
        }

        if let Ok(interval) = env::var("AUTOREPLY_POLL_INTERVAL_MS") {
            if let Ok(ms) = interval.parse() {
                self.poll_interval_ms = ms;
            }
        }

        if let Ok(len) = env::var("AUTOREPLY_MAX_MESSAGE_LENGTH") {
            if let Ok(len) = len.parse() {
                self.max_message_length = len;
            }
        }

        if let Ok(enabled) = env::var("AUTOREPLY_ENABLE_REPORT") {
            self.report.enabled = parse_flag(&enabled);
        }

        if let Ok(target) = env::var("AUTOREPLY_REPORT_TARGET") {
            if !target.trim().is_empty() {
                self.report.target = target.trim().to_string();
            }
        }

        if let Ok(token) = env::var("TELEGRAM_BOT_TOKEN") {
            if !token.trim().is_empty() {
                self.telegram.bot_token = Some(token.trim().to_string());
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_message_length == 0 {
            anyhow::bail!("max_message_length must be greater than zero");
        }
        if self.watch_list.iter().all(|peer| peer.trim().is_empty()) {
            anyhow::bail!("watch_list must name at least one peer");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn fetch_backoff(&self) -> Duration {
        Duration::from_secs(self.fetch_backoff_secs)
    }

    pub fn chunk_pacing(&self) -> Duration {
        Duration::from_millis(self.chunk_pacing_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Report target, defaulting to the first watched peer.
    pub fn report_target(&self) -> Option<String> {
        let target = self.report.target.trim();
        if !target.is_empty() {
            return Some(target.to_string());
        }
        self.watch_list.first().cloned()
    }
}

fn parse_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("1")
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
}

pub fn parse_watch_list(raw: &str) -> Vec<String> {
    normalize_watch_list(raw.split(','))
}

/// Trim names, drop blanks and duplicates, keep first-seen order.
/// Names are taken whole, commas included.
pub fn normalize_watch_list<I, S>(peers: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut normalized: Vec<String> = Vec::new();
    for peer in peers {
        let peer = peer.as_ref().trim();
        if !peer.is_empty() && !normalized.iter().any(|p| p == peer) {
            normalized.push(peer.to_string());
        }
    }
    normalized
}
