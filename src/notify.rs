use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::{Value, json};
use serde_with::skip_serializing_none;
use tracing::{debug, info, warn};

const TELEGRAM_API: &str = "https://api.telegram.org";

/// Operational log channel vs. user-facing status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Log,
    Status,
}

impl Channel {
    fn label(self) -> &'static str {
        match self {
            Channel::Log => "log",
            Channel::Status => "status",
        }
    }
}

/// A button attached to a message that opens `url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractiveAction {
    pub label: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub text: String,
    pub action: Option<InteractiveAction>,
}

impl Notification {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            action: None,
        }
    }

    pub fn with_action(mut self, action: Option<InteractiveAction>) -> Self {
        self.action = action;
        self
    }
}

/// Outbound message channel. Delivery problems are logged, never returned.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, channel: Channel, notification: Notification);

    async fn log(&self, text: &str) {
        self.send(Channel::Log, Notification::text(text)).await;
    }

    async fn status(&self, text: &str) {
        self.send(Channel::Status, Notification::text(text)).await;
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub bot_token: String,
    pub chat_id: String,
    pub thread_id: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct TelegramConfig {
    pub log: Option<ChannelConfig>,
    pub status: Option<ChannelConfig>,
}

pub struct TelegramNotifier {
    http: Client,
    api_root: String,
    config: TelegramConfig,
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
    text: &'a str,
    message_thread_id: Option<i64>,
    reply_markup: Option<Value>,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            http: build_client(),
            api_root: TELEGRAM_API.to_string(),
            config,
        }
    }

    #[cfg(test)]
    fn with_api_root(mut self, root: &str) -> Self {
        self.api_root = root.trim_end_matches('/').to_string();
        self
    }

    fn channel(&self, channel: Channel) -> Option<&ChannelConfig> {
        match channel {
            Channel::Log => self.config.log.as_ref(),
            Channel::Status => self.config.status.as_ref(),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, channel: Channel, notification: Notification) {
        let Some(target) = self.channel(channel) else {
            debug!(target = "reconciler.notify", channel = channel.label(), "channel_not_configured");
            return;
        };
        if notification.text.is_empty() {
            return;
        }
        let body = SendMessage {
            chat_id: &target.chat_id,
            parse_mode: "HTML",
            disable_web_page_preview: true,
            text: &notification.text,
            message_thread_id: target.thread_id,
            reply_markup: notification.action.as_ref().map(|action| {
                json!({ "inline_keyboard": [[{ "text": action.label, "url": action.url }]] })
            }),
        };
        let url = format!("{}/bot{}/sendMessage", self.api_root, target.bot_token);
        match self.http.post(url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                let message_id = response
                    .json::<Value>()
                    .await
                    .ok()
                    .and_then(|payload| payload.pointer("/result/message_id").cloned());
                info!(
                    target = "reconciler.notify",
                    channel = channel.label(),
                    chat = %target.chat_id,
                    message_id = ?message_id,
                    "notification_sent"
                );
            }
            Ok(response) => {
                let status = response.status();
                let detail = response.text().await.unwrap_or_default();
                warn!(
                    target = "reconciler.notify",
                    channel = channel.label(),
                    %status,
                    detail = %detail,
                    "notification_rejected"
                );
            }
            Err(err) => {
                warn!(
                    target = "reconciler.notify",
                    channel = channel.label(),
                    error = %err,
                    "notification_failed"
                );
            }
        }
    }
}

/// Escapes text interpolated into HTML-formatted messages.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}
