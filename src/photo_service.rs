use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

const PHOTO_PATHS: [&str; 6] = [
    "/photos",
    "/data/photos",
    "/result/photos",
    "/data/result/photos",
    "/photo",
    "/data/photo",
];

const BALANCE_PATHS: [&str; 6] = [
    "/balance",
    "/data/balance",
    "/result/balance",
    "/data/result/balance",
    "/data/account/balance",
    "/account/balance",
];

#[derive(Debug, Error)]
pub enum PhotoServiceError {
    #[error("photo service unreachable: {0}")]
    Http(String),
    #[error("photo service returned HTTP {0}")]
    Status(u16),
    #[error("invalid photo service response: {0}")]
    InvalidResponse(String),
}

/// Error envelope reported by the service itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFault {
    pub code: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhotoReport {
    pub photos: Vec<String>,
    pub balance: Option<f64>,
    pub fault: Option<ServiceFault>,
}

/// Paid source of additional listing photos; also reports the account balance.
#[async_trait]
pub trait PhotoProvider: Send + Sync {
    async fn photos_for(&self, listing_url: &str) -> Result<PhotoReport, PhotoServiceError>;
}

#[derive(Debug, Clone)]
pub struct PhotoServiceConfig {
    pub api_url: String,
    pub api_key: String,
    pub action: String,
}

pub struct PhotoServiceClient {
    http: Client,
    config: PhotoServiceConfig,
}

impl PhotoServiceClient {
    pub fn new(config: PhotoServiceConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }
}

#[async_trait]
impl PhotoProvider for PhotoServiceClient {
    async fn photos_for(&self, listing_url: &str) -> Result<PhotoReport, PhotoServiceError> {
        let key = self.config.api_key.as_str();
        let response = self
            .http
            .get(&self.config.api_url)
            .query(&[
                ("k", key),
                ("key", key),
                ("action", self.config.action.as_str()),
                ("url", listing_url),
                ("u", listing_url),
            ])
            .send()
            .await
            .map_err(|err| PhotoServiceError::Http(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PhotoServiceError::Status(status.as_u16()));
        }
        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| PhotoServiceError::InvalidResponse(err.to_string()))?;
        let report = read_envelope(&payload);
        match &report.fault {
            Some(fault) => warn!(
                target = "reconciler.photos",
                code = %fault.code,
                text = %fault.text,
                balance = ?report.balance,
                "photo_service_fault"
            ),
            None => debug!(
                target = "reconciler.photos",
                count = report.photos.len(),
                balance = ?report.balance,
                "photo_service_ok"
            ),
        }
        Ok(report)
    }
}

/// Interprets a photo-service response body.
pub fn read_envelope(payload: &Value) -> PhotoReport {
    if payload.get("status").and_then(Value::as_str) == Some("error") {
        let code = match payload.get("err_code") {
            Some(Value::String(code)) => code.clone(),
            Some(Value::Null) | None => "0".to_string(),
            Some(other) => other.to_string(),
        };
        let text = payload
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or("ошибка фотосервиса")
            .to_string();
        return PhotoReport {
            photos: Vec::new(),
            balance: payload.get("balance").and_then(normalize_balance),
            fault: Some(ServiceFault { code, text }),
        };
    }

    let raw_photos = first_present(payload, &PHOTO_PATHS).or_else(|| payload.is_array().then_some(payload));
    let photos = raw_photos
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let balance = first_present(payload, &BALANCE_PATHS).and_then(normalize_balance);
    PhotoReport {
        photos,
        balance,
        fault: None,
    }
}

fn first_present<'a>(payload: &'a Value, paths: &[&str]) -> Option<&'a Value> {
    paths
        .iter()
        .filter_map(|path| payload.pointer(path))
        .find(|value| !value.is_null())
}

/// Balances arrive as numbers or numeric strings.
pub fn normalize_balance(raw: &Value) -> Option<f64> {
    match raw {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Replays scripted reports in order; the last one repeats.
    pub struct ScriptedPhotos {
        script: Mutex<Vec<Result<PhotoReport, u16>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedPhotos {
        pub fn reporting(photos: &[&str], balance: Option<f64>) -> Self {
            Self::script(vec![Ok(PhotoReport {
                photos: photos.iter().map(|p| p.to_string()).collect(),
                balance,
                fault: None,
            })])
        }

        pub fn script(script: Vec<Result<PhotoReport, u16>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: Mutex::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl PhotoProvider for ScriptedPhotos {
        async fn photos_for(&self, _listing_url: &str) -> Result<PhotoReport, PhotoServiceError> {
            *self.calls.lock().unwrap() += 1;
            let mut script = self.script.lock().unwrap();
            let next = if script.len() > 1 {
                script.remove(0)
            } else {
                script[0].clone()
            };
            next.map_err(PhotoServiceError::Status)
        }
    }
}
