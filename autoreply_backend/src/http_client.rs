use anyhow::{Context, Result};
use std::time::Duration;

/// Build the shared reqwest client. Per-request timeouts are set by callers,
/// `connect_timeout` only bounds the TCP/TLS handshake.
pub fn build_http_client(connect_timeout: Option<Duration>) -> Result<reqwest::Client> {
    let allow_system_proxy = std::env::var("AUTOREPLY_ENABLE_SYSTEM_PROXY")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if allow_system_proxy {
        match attempt_build(connect_timeout, false) {
            Ok(client) => return Ok(client),
            Err(e) => tracing::warn!(
                "HTTP client initialization with system proxy discovery failed ({}); retrying with no_proxy",
                e
            ),
        }
    }

    attempt_build(connect_timeout, true).context("Failed to initialize HTTP client")
}

fn attempt_build(
    connect_timeout: Option<Duration>,
    no_proxy: bool,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = connect_timeout {
        builder = builder.connect_timeout(timeout);
    }
    if no_proxy {
        builder = builder.no_proxy();
    }
    builder.build()
}
