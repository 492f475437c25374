use reqwest::Client;
use std::time::Duration;

/// Shared HTTP client for every outbound adapter.
///
/// Timeouts stay at the transport default unless explicitly configured.
pub fn build_client() -> Client {
    let mut builder = Client::builder();
    if let Some(timeout) = env_secs("HTTP_TIMEOUT_SECS") {
        builder = builder.timeout(Duration::from_secs(timeout));
    }
    if let Some(connect) = env_secs("HTTP_CONNECT_TIMEOUT_SECS") {
        builder = builder.connect_timeout(Duration::from_secs(connect));
    }
    builder.build().unwrap_or_else(|_| Client::new())
}

fn env_secs(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
}
