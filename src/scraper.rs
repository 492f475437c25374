use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ScraperError {
    #[error("scraper unreachable: {0}")]
    Http(String),
    #[error("scraper returned HTTP {0}")]
    Status(u16),
    #[error("invalid scraper response: {0}")]
    InvalidResponse(String),
}

/// Live source of scraped listing payloads.
#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Value, ScraperError>;
}

pub struct ScraperClient {
    http: Client,
    endpoint: String,
}

impl ScraperClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: build_client(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ListingSource for ScraperClient {
    async fn fetch(&self, url: &str) -> Result<Value, ScraperError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&json!({ "url": url }))
            .send()
            .await
            .map_err(|err| ScraperError::Http(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ScraperError::Status(status.as_u16()));
        }
        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| ScraperError::InvalidResponse(err.to_string()))?;
        debug!(target = "reconciler.scraper", url, "payload_received");
        Ok(payload)
    }
}

/// The listing inside a scraper payload: `items[0]`, then `item`, then the payload itself.
///
/// Only a non-empty object counts as a listing.
pub fn extract_item(payload: &Value) -> Option<&Value> {
    if is_empty(payload) {
        return None;
    }
    if let Some(first) = payload
        .get("items")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
    {
        return is_listing(first).then_some(first);
    }
    if let Some(item) = payload.get("item").filter(|item| !is_empty(item)) {
        return is_listing(item).then_some(item);
    }
    is_listing(payload).then_some(payload)
}

/// Publication status reported by the source, payload level before item level.
pub fn remote_status(payload: &Value, item: &Value) -> String {
    [payload, item]
        .into_iter()
        .filter_map(|node| node.get("status"))
        .find(|status| !status.is_null())
        .map(|status| match status {
            Value::String(text) => text.trim().to_lowercase(),
            other => other.to_string().to_lowercase(),
        })
        .unwrap_or_default()
}

fn is_listing(value: &Value) -> bool {
    matches!(value, Value::Object(map) if !map.is_empty())
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(flag) => !flag,
        Value::String(text) => text.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}
