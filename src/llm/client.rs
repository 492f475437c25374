use crate::http::build_client;
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

const CHAT_SUFFIX: &str = "/chat/completions";
const LEGACY_SUFFIXES: [&str; 2] = ["/completions", "/generate"];
const FALLBACK_PATH: &str = "/v1/chat/completions";

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("invalid endpoint {0}")]
    InvalidEndpoint(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("generation endpoint returned HTTP {0}")]
    Status(u16),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("response carried no text")]
    EmptyReply,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
}

/// Chat-completion client for OpenAI-compatible gateways.
pub struct ChatClient {
    http: Client,
    config: LlmConfig,
}

impl ChatClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }

    /// Sends `messages` and returns the trimmed reply text.
    ///
    /// Candidates are tried in order; only a 404 moves on to the next one.
    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let candidates = endpoint_candidates(&self.config.api_url)?;
        let body = ChatRequest {
            model: &self.config.model,
            messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let last = candidates.len() - 1;
        for (attempt, endpoint) in candidates.iter().enumerate() {
            let response = self
                .http
                .post(endpoint.clone())
                .bearer_auth(&self.config.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|err| LlmError::Http(err.to_string()))?;

            let status = response.status();
            if status == StatusCode::NOT_FOUND && attempt < last {
                warn!(target = "reconciler.llm", endpoint = %endpoint, "endpoint_not_found_retrying");
                continue;
            }
            if !status.is_success() {
                return Err(LlmError::Status(status.as_u16()));
            }

            let payload: Value = response
                .json()
                .await
                .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;
            debug!(target = "reconciler.llm", endpoint = %endpoint, "completion_received");
            return resolve_text(&payload).ok_or(LlmError::EmptyReply);
        }
        Err(LlmError::EmptyReply)
    }
}

/// Ordered endpoints to try for a configured API URL.
///
/// The configured path is normalized to `/chat/completions`; the second
/// candidate is the conventional `/v1/chat/completions` on the same origin.
pub fn endpoint_candidates(api_url: &str) -> Result<Vec<Url>, LlmError> {
    let mut primary =
        Url::parse(api_url.trim()).map_err(|_| LlmError::InvalidEndpoint(api_url.to_string()))?;
    let path = primary.path().trim_end_matches('/').to_string();
    let resolved = if path.ends_with(CHAT_SUFFIX) {
        path
    } else if let Some(stem) = LEGACY_SUFFIXES
        .iter()
        .find_map(|suffix| path.strip_suffix(suffix))
    {
        format!("{stem}{CHAT_SUFFIX}")
    } else {
        format!("{path}{CHAT_SUFFIX}")
    };
    primary.set_path(&resolved);

    let mut fallback = primary.clone();
    fallback.set_path(FALLBACK_PATH);
    fallback.set_query(None);

    let mut candidates = vec![primary];
    if candidates[0] != fallback {
        candidates.push(fallback);
    }
    Ok(candidates)
}

/// Pulls reply text out of the response shapes gateways commonly return.
pub fn resolve_text(payload: &Value) -> Option<String> {
    let text = match payload {
        Value::String(text) => Some(text.as_str()),
        Value::Object(_) => text_in_object(payload),
        _ => None,
    }?;
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn text_in_object(payload: &Value) -> Option<&str> {
    let direct = ["text", "result", "message", "content", "choice"]
        .iter()
        .filter_map(|key| payload.get(key))
        .find(|value| !value.is_null());
    if let Some(Value::String(text)) = direct {
        return Some(text);
    }
    if let Some(choice) = first_element(payload, "choices") {
        return first_string(choice, &["/text", "/message/content", "/content"]);
    }
    if let Some(output) = first_element(payload, "output") {
        return first_string(output, &["/content", "/text"]);
    }
    first_element(payload, "items").and_then(|item| match item {
        Value::String(text) => Some(text.as_str()),
        Value::Object(_) => text_in_object(item),
        _ => None,
    })
}

fn first_element<'a>(payload: &'a Value, key: &str) -> Option<&'a Value> {
    payload.get(key)?.as_array()?.first()
}

fn first_string<'a>(node: &'a Value, pointers: &[&str]) -> Option<&'a str> {
    pointers
        .iter()
        .filter_map(|pointer| node.pointer(pointer))
        .find(|value| !value.is_null())
        .and_then(Value::as_str)
}
