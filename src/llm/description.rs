use super::client::{ChatClient, ChatMessage};
use crate::normalize::parse_number;
use crate::notify::{Notifier, escape_html};
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tracing::{debug, warn};

const DATA_PLACEHOLDER: &str = "{{DATA_JSON}}";
const NO_ADDRESS: &str = "Адрес не указан";
const SYSTEM_PROMPT: &str = "Ты копирайтер агентства недвижимости. Пиши короткое продающее \
описание квартиры для объявления об аренде на русском языке. Используй только факты из данных, \
ничего не выдумывай.";

static PROMPT_CACHE: Lazy<Mutex<HashMap<PathBuf, String>>> = Lazy::new(Default::default);

/// Facts about the listing handed to the model as JSON.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DescriptionContext {
    pub address: String,
    pub price: Option<Value>,
    pub rooms: Option<Value>,
    pub total_area: Option<Value>,
    pub living_area: Option<Value>,
    pub kitchen_area: Option<Value>,
    pub floor: Option<Value>,
    pub floors_total: Option<Value>,
    pub summary: Option<Value>,
    pub bonuses: Option<Value>,
    pub source: Option<String>,
}

pub fn build_context(item: &Value, owner_url: Option<&str>) -> DescriptionContext {
    DescriptionContext {
        address: address_of(item, owner_url),
        price: present(item, "price").or_else(|| present(item, "payment")).cloned(),
        rooms: present(item, "rooms").or_else(|| present(item, "rooms_count")).cloned(),
        total_area: present(item, "total_area").cloned(),
        living_area: present(item, "living_area").cloned(),
        kitchen_area: present(item, "kitchen_area").cloned(),
        floor: present(item, "floor").cloned(),
        floors_total: present(item, "floors_total").cloned(),
        summary: summary_of(item).cloned(),
        bonuses: present(item, "amenities").cloned(),
        source: owner_url.map(str::to_string),
    }
}

/// Template description used whenever generation is unavailable or fails.
pub fn fallback_description(item: &Value, owner_url: Option<&str>) -> String {
    let mut fragments = vec![format!("Адрес: {}", address_of(item, owner_url))];
    let price = parse_number(item.get("price"))
        .filter(|price| *price != 0.0)
        .map(|price| format!("{} ₽", price.round() as i64))
        .unwrap_or_else(|| "Цена не указана".to_string());
    fragments.push(format!("Цена: {price}"));
    if let Some(rooms) = present(item, "rooms")
        .or_else(|| present(item, "rooms_count"))
        .and_then(truthy_text)
    {
        fragments.push(format!("Комнат: {rooms}"));
    }
    if let Some(area) = present(item, "total_area").and_then(truthy_text) {
        fragments.push(format!("Площадь: {area} м²"));
    }
    if let Some(summary) = summary_of(item).and_then(truthy_text) {
        fragments.push(summary);
    }
    format!("{}.", fragments.join(". "))
}

/// Produces listing descriptions; never fails, falls back to the template.
pub struct DescriptionGenerator {
    client: Option<ChatClient>,
    prompt_path: PathBuf,
}

impl DescriptionGenerator {
    pub fn new(client: Option<ChatClient>, prompt_path: impl Into<PathBuf>) -> Self {
        Self {
            client,
            prompt_path: prompt_path.into(),
        }
    }

    /// Template-only generator.
    pub fn disabled() -> Self {
        Self::new(None, PathBuf::new())
    }

    pub async fn generate(
        &self,
        item: &Value,
        owner_url: Option<&str>,
        notifier: &dyn Notifier,
    ) -> String {
        let fallback = fallback_description(item, owner_url);
        let Some(client) = &self.client else {
            return fallback;
        };
        let Some(template) = load_prompt(&self.prompt_path).await else {
            return fallback;
        };
        let data = match serde_json::to_string_pretty(&build_context(item, owner_url)) {
            Ok(data) => data,
            Err(err) => {
                warn!(target = "reconciler.llm", error = %err, "context_serialize_failed");
                return fallback;
            }
        };
        let prompt = template.replacen(DATA_PLACEHOLDER, &data, 1);
        let messages = [ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)];

        match client.complete(&messages).await {
            Ok(text) => text,
            Err(err) => {
                warn!(target = "reconciler.llm", error = %err, "description_fallback");
                notifier
                    .log(&format!(
                        "Не удалось сгенерировать описание ({}), использован шаблон",
                        escape_html(&err.to_string())
                    ))
                    .await;
                fallback
            }
        }
    }
}

/// Reads the prompt template once per path; failed reads are retried next time.
async fn load_prompt(path: &Path) -> Option<String> {
    if let Some(cached) = cache_lookup(path) {
        return Some(cached);
    }
    match tokio::fs::read_to_string(path).await {
        Ok(content) => {
            if let Ok(mut cache) = PROMPT_CACHE.lock() {
                cache.insert(path.to_path_buf(), content.clone());
            }
            Some(content)
        }
        Err(err) => {
            debug!(target = "reconciler.llm", path = %path.display(), error = %err, "prompt_unavailable");
            None
        }
    }
}

fn cache_lookup(path: &Path) -> Option<String> {
    PROMPT_CACHE.lock().ok()?.get(path).cloned()
}

fn present<'a>(item: &'a Value, key: &str) -> Option<&'a Value> {
    item.get(key).filter(|value| !value.is_null())
}

fn summary_of(item: &Value) -> Option<&Value> {
    present(item, "summary")
        .filter(|value| truthy_text(value).is_some())
        .or_else(|| present(item, "description"))
}

fn address_of(item: &Value, owner_url: Option<&str>) -> String {
    present(item, "address")
        .and_then(truthy_text)
        .or_else(|| owner_url.filter(|url| !url.is_empty()).map(str::to_string))
        .unwrap_or_else(|| NO_ADDRESS.to_string())
}

/// Display text for values that read as "set": non-empty strings and non-zero numbers.
fn truthy_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) if number.as_f64() != Some(0.0) => Some(number.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmConfig;
    use crate::notify::{Channel, testing::RecordingNotifier};
    use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
    use serde_json::json;
    use std::{io::Write, sync::Arc};

    #[test]
    fn fallback_lists_known_facts() {
        let item = json!({
            "address": "Москва, Тверская 1",
            "price": 45000,
            "rooms": 2,
            "total_area": "52,3",
            "summary": "Светлая квартира"
        });
        assert_eq!(
            fallback_description(&item, Some("https://listing/1")),
            "Адрес: Москва, Тверская 1. Цена: 45000 ₽. Комнат: 2. Площадь: 52,3 м². Светлая квартира."
        );
    }

    #[test]
    fn fallback_without_data_uses_owner_url_then_placeholder() {
        assert_eq!(
            fallback_description(&json!({}), Some("https://listing/1")),
            "Адрес: https://listing/1. Цена: Цена не указана."
        );
        assert_eq!(
            fallback_description(&json!({"rooms_count": 3}), None),
            "Адрес: Адрес не указан. Цена: Цена не указана. Комнат: 3."
        );
    }

    #[test]
    fn context_prefers_primary_keys_and_skips_absent_fields() {
        let item = json!({"payment": 100, "rooms_count": 1, "summary": "", "description": "desc"});
        let context = build_context(&item, Some("https://listing/2"));
        assert_eq!(context.price, Some(json!(100)));
        assert_eq!(context.rooms, Some(json!(1)));
        assert_eq!(context.summary, Some(json!("desc")));
        let rendered = serde_json::to_value(&context).unwrap();
        assert!(rendered.get("floor").is_none());
        assert_eq!(rendered["address"], json!("https://listing/2"));
    }

    #[tokio::test]
    async fn disabled_generator_returns_template() {
        let notifier = RecordingNotifier::default();
        let text = DescriptionGenerator::disabled()
            .generate(&json!({"address": "A"}), None, &notifier)
            .await;
        assert_eq!(text, "Адрес: A. Цена: Цена не указана.");
        assert!(notifier.sent().is_empty());
    }

    type Prompts = Arc<std::sync::Mutex<Vec<Value>>>;

    async fn spawn_llm(status: StatusCode) -> (String, Prompts) {
        let prompts: Prompts = Arc::default();
        let app = Router::new()
            .route(
                "/v1/chat/completions",
                post(
                    move |State(prompts): State<Prompts>, Json(body): Json<Value>| async move {
                        prompts.lock().unwrap().push(body["messages"].clone());
                        (
                            status,
                            Json(json!({"choices": [{"message": {"content": "  Уютная студия.  "}}]})),
                        )
                    },
                ),
            )
            .with_state(prompts.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/v1"), prompts)
    }

    fn generator(api_url: String, prompt_path: &Path) -> DescriptionGenerator {
        let client = ChatClient::new(LlmConfig {
            api_url,
            api_key: "key".into(),
            model: "polza-1".into(),
            max_tokens: 400,
            temperature: 0.65,
        });
        DescriptionGenerator::new(Some(client), prompt_path)
    }

    #[tokio::test]
    async fn fills_placeholder_and_caches_template() {
        let (api_url, prompts) = spawn_llm(StatusCode::OK).await;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "Опиши квартиру:\n{{{{DATA_JSON}}}}").unwrap();
        let path = file.path().to_path_buf();
        let generator = generator(api_url, &path);
        let notifier = RecordingNotifier::default();
        let item = json!({"address": "Тверская 1", "price": "45 000"});

        let text = generator.generate(&item, None, &notifier).await;
        assert_eq!(text, "Уютная студия.");

        drop(file);
        let again = generator.generate(&item, None, &notifier).await;
        assert_eq!(again, "Уютная студия.");

        let sent = prompts.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        let user = sent[0][1]["content"].as_str().unwrap();
        assert!(user.starts_with("Опиши квартиру:\n{"), "{user}");
        assert!(user.contains("\"address\": \"Тверская 1\""), "{user}");
        assert!(!user.contains("DATA_JSON"));
        assert_eq!(sent[0][0]["role"], json!("system"));
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn missing_template_falls_back_silently() {
        let (api_url, prompts) = spawn_llm(StatusCode::OK).await;
        let dir = tempfile::tempdir().unwrap();
        let generator = generator(api_url, &dir.path().join("absent.txt"));
        let notifier = RecordingNotifier::default();
        let text = generator.generate(&json!({}), Some("https://l/1"), &notifier).await;
        assert_eq!(text, "Адрес: https://l/1. Цена: Цена не указана.");
        assert!(prompts.lock().unwrap().is_empty());
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn upstream_failure_notifies_and_falls_back() {
        let (api_url, _) = spawn_llm(StatusCode::BAD_GATEWAY).await;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{{{DATA_JSON}}}}").unwrap();
        let generator = generator(api_url, file.path());
        let notifier = RecordingNotifier::default();
        let text = generator.generate(&json!({"address": "B"}), None, &notifier).await;
        assert_eq!(text, "Адрес: B. Цена: Цена не указана.");
        assert_eq!(notifier.count_containing(Channel::Log, "502"), 1);
    }

    #[tokio::test]
    async fn failure_notice_is_html_escaped() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{{{DATA_JSON}}}}").unwrap();
        let generator = generator("gateway?a=1&b=<2>".into(), file.path());
        let notifier = RecordingNotifier::default();
        generator.generate(&json!({"address": "C"}), None, &notifier).await;
        let logs = notifier.texts(Channel::Log);
        assert_eq!(logs.len(), 1);
        assert!(logs[0].contains("a=1&amp;b=&lt;2&gt;"), "{}", logs[0]);
        assert!(!logs[0].contains("<2>"));
    }
}
