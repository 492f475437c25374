use crate::llm::LlmConfig;
use crate::notify::{ChannelConfig, TelegramConfig};
use crate::photo_service::PhotoServiceConfig;
use crate::pipeline::DEFAULT_AGENT_ID;
use crate::store::SupabaseConfig;
use eyre::{Result, eyre};
use std::{path::PathBuf, str::FromStr, time::Duration};

const DEFAULT_PHOTO_ACTION: &str = "getPhotos";
const DEFAULT_MODEL: &str = "polza-1";
const DEFAULT_PROMPT_FILE: &str = "prompts/description.txt";
const DEFAULT_MAX_TOKENS: u32 = 400;
const DEFAULT_TEMPERATURE: f32 = 0.65;
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase: SupabaseConfig,
    pub scraper_endpoint: String,
    pub photo_service: Option<PhotoServiceConfig>,
    pub llm: Option<LlmConfig>,
    pub prompt_path: PathBuf,
    pub agent_id: i64,
    pub public_base_url: Option<String>,
    pub resume_token: Option<String>,
    pub webhook_secret: Option<String>,
    pub port: u16,
    pub check_interval: Duration,
    pub telegram: TelegramConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let (Some(url), Some(service_key)) = (get("SUPABASE_URL"), get("SUPABASE_SERVICE_ROLE_KEY"))
        else {
            return Err(eyre!(
                "SUPABASE_URL and SUPABASE_SERVICE_ROLE_KEY are required"
            ));
        };
        let scraper_endpoint =
            get("SCRAPER_ENDPOINT").ok_or_else(|| eyre!("SCRAPER_ENDPOINT is required"))?;

        let photo_service = match (get("PHOTO_API_URL"), get("PHOTO_API_KEY")) {
            (Some(api_url), Some(api_key)) => Some(PhotoServiceConfig {
                api_url,
                api_key,
                action: get("PHOTO_API_ACTION").unwrap_or_else(|| DEFAULT_PHOTO_ACTION.into()),
            }),
            _ => None,
        };

        let llm = match (get("LLM_API_URL"), get("LLM_API_KEY")) {
            (Some(api_url), Some(api_key)) => Some(LlmConfig {
                api_url,
                api_key,
                model: get("LLM_MODEL").unwrap_or_else(|| DEFAULT_MODEL.into()),
                max_tokens: parsed(get("LLM_MAX_TOKENS"), DEFAULT_MAX_TOKENS),
                temperature: parsed(get("LLM_TEMPERATURE"), DEFAULT_TEMPERATURE),
            }),
            _ => None,
        };

        let channel = |prefix: &str| {
            let bot_token = get(format!("TELEGRAM_{prefix}_BOT_TOKEN").as_str())?;
            let chat_id = get(format!("TELEGRAM_{prefix}_CHAT_ID").as_str())?;
            Some(ChannelConfig {
                bot_token,
                chat_id,
                thread_id: get(format!("TELEGRAM_{prefix}_TOPIC_ID").as_str())
                    .and_then(|raw| raw.parse().ok()),
            })
        };

        Ok(Self {
            supabase: SupabaseConfig { url, service_key },
            scraper_endpoint,
            photo_service,
            llm,
            prompt_path: get("LLM_PROMPT_FILE")
                .unwrap_or_else(|| DEFAULT_PROMPT_FILE.into())
                .into(),
            agent_id: parsed(get("AGENT_ID"), DEFAULT_AGENT_ID),
            public_base_url: get("PUBLIC_BASE_URL"),
            resume_token: get("RESUME_TOKEN"),
            webhook_secret: get("WEBHOOK_SECRET"),
            port: parsed(get("PORT"), DEFAULT_PORT),
            check_interval: Duration::from_secs(
                parsed(get("CHECK_INTERVAL_SECS"), DEFAULT_INTERVAL_SECS).max(1),
            ),
            telegram: TelegramConfig {
                log: channel("LOG"),
                status: channel("STATUS"),
            },
        })
    }
}

fn parsed<T: FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|value| value.parse().ok()).unwrap_or(default)
}
