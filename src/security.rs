use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{convert::Infallible, sync::Arc};
use tracing::warn;

pub const SIGNATURE_HEADER: &str = "X-Supabase-Signature";

/// Shared secret the store's webhook must present; `None` accepts every call.
#[derive(Clone, Default)]
pub struct WebhookAuth {
    secret: Option<Arc<str>>,
}

impl WebhookAuth {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.map(Arc::from),
        }
    }

    fn accepts(&self, headers: &HeaderMap) -> bool {
        let Some(secret) = self.secret.as_deref() else {
            return true;
        };
        headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|presented| presented == secret)
    }
}

pub async fn require_webhook_signature(
    State(auth): State<WebhookAuth>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    if !auth.accepts(request.headers()) {
        warn!(target = "reconciler.api", "webhook_signature_mismatch");
        return Ok(error_response(
            StatusCode::UNAUTHORIZED,
            "invalid_signature",
            "Signature header does not match",
        ));
    }
    Ok(next.run(request).await)
}

/// Why a manual resume request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeRejection {
    NotConfigured,
    InvalidToken,
}

/// Compares the presented resume token with the configured one.
pub fn check_resume_token(
    configured: Option<&str>,
    presented: Option<&str>,
) -> Result<(), ResumeRejection> {
    let configured = configured.ok_or(ResumeRejection::NotConfigured)?;
    if presented == Some(configured) {
        Ok(())
    } else {
        warn!(target = "reconciler.api", "resume_token_mismatch");
        Err(ResumeRejection::InvalidToken)
    }
}

impl IntoResponse for ResumeRejection {
    fn into_response(self) -> Response {
        match self {
            ResumeRejection::NotConfigured => error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "resume_not_configured",
                "Resume token is not configured",
            ),
            ResumeRejection::InvalidToken => {
                error_response(StatusCode::FORBIDDEN, "invalid_token", "Token not recognized")
            }
        }
    }
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (status, Json(payload)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, middleware, routing::post};
    use tower::ServiceExt;

    fn app(secret: Option<&str>) -> Router {
        let auth = WebhookAuth::new(secret.map(str::to_string));
        Router::new()
            .route("/webhook", post(|| async { "ok" }))
            .route_layer(middleware::from_fn_with_state(auth, require_webhook_signature))
    }

    fn request(signature: Option<&str>) -> Request<Body> {
        let mut builder = Request::post("/webhook");
        if let Some(signature) = signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn webhook_requires_matching_signature_when_configured() {
        let response = app(Some("s3cret")).oneshot(request(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app(Some("s3cret")).oneshot(request(Some("nope"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app(Some("s3cret")).oneshot(request(Some("s3cret"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn webhook_is_open_without_secret() {
        let response = app(None).oneshot(request(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn resume_token_checks() {
        assert_eq!(
            check_resume_token(None, Some("t")),
            Err(ResumeRejection::NotConfigured)
        );
        assert_eq!(
            check_resume_token(Some("t"), Some("x")),
            Err(ResumeRejection::InvalidToken)
        );
        assert_eq!(
            check_resume_token(Some("t"), None),
            Err(ResumeRejection::InvalidToken)
        );
        assert_eq!(check_resume_token(Some("t"), Some("t")), Ok(()));
        assert_eq!(
            ResumeRejection::NotConfigured.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ResumeRejection::InvalidToken.into_response().status(),
            StatusCode::FORBIDDEN
        );
    }
}
