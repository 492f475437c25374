mod balance;
mod config;
mod cycle;
mod http;
mod llm;
mod metrics;
mod models;
mod normalize;
mod notify;
mod photo_service;
mod photos;
mod pipeline;
mod scraper;
mod security;
mod store;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    middleware,
    routing::{get, post},
};
use balance::{BalanceGate, GateState, RESUME_PATH, resume_action};
use config::AppConfig;
use cycle::{CycleRunner, CycleTrigger};
use eyre::WrapErr;
use llm::{ChatClient, DescriptionGenerator};
use notify::{Notifier, TelegramNotifier};
use photo_service::{PhotoProvider, PhotoServiceClient};
use pipeline::{Pipeline, PipelineConfig};
use scraper::ScraperClient;
use security::{ResumeRejection, WebhookAuth, check_resume_token, require_webhook_signature};
use serde::Deserialize;
use serde_json::{Value, json};
use std::{net::SocketAddr, sync::Arc};
use store::SupabaseClient;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

const SERVICE_NAME: &str = "listing-reconciler";

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    if let Err(err) = run().await {
        error!(target = "reconciler.api", "server crashed: {err:#}");
        return Err(err);
    }
    Ok(())
}

async fn run() -> eyre::Result<()> {
    let config = AppConfig::from_env()?;

    let notifier: Arc<dyn Notifier> = Arc::new(TelegramNotifier::new(config.telegram.clone()));
    let gate = Arc::new(BalanceGate::new(resume_action(
        config.public_base_url.as_deref(),
        config.resume_token.as_deref(),
    )));
    let photos = config
        .photo_service
        .clone()
        .map(|photo_config| Arc::new(PhotoServiceClient::new(photo_config)) as Arc<dyn PhotoProvider>);
    let describer = DescriptionGenerator::new(
        config.llm.clone().map(ChatClient::new),
        config.prompt_path.clone(),
    );
    let pipeline = Pipeline::new(
        Arc::new(SupabaseClient::new(config.supabase.clone())),
        Arc::new(ScraperClient::new(config.scraper_endpoint.clone())),
        notifier,
        gate,
        PipelineConfig {
            agent_id: config.agent_id,
        },
    )
    .with_photos(photos)
    .with_describer(describer);

    let runner = Arc::new(CycleRunner::new(pipeline));
    let state = AppState {
        runner: runner.clone(),
        resume_token: config.resume_token.clone().map(Arc::from),
    };
    let app = router(state, WebhookAuth::new(config.webhook_secret.clone()));

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("failed to bind {addr}"))?;
    info!(target = "reconciler.api", "listening on {addr}");

    let startup = runner.clone();
    tokio::spawn(async move {
        startup.trigger(CycleTrigger::Startup).await;
    });
    let _ticker = cycle::spawn_interval(runner, config.check_interval);

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    runner: Arc<CycleRunner>,
    resume_token: Option<Arc<str>>,
}

fn router(state: AppState, webhook_auth: WebhookAuth) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let webhook = Router::new()
        .route("/webhook", post(handle_webhook))
        .route_layer(middleware::from_fn_with_state(
            webhook_auth,
            require_webhook_signature,
        ));

    Router::new()
        .route("/health", get(health))
        .route(RESUME_PATH, get(resume))
        .merge(webhook)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    metrics::inc_requests("health");
    let status = if state.runner.is_running() {
        "busy"
    } else {
        "idle"
    };
    Json(json!({
        "status": status,
        "service": SERVICE_NAME,
    }))
}

async fn handle_webhook(State(state): State<AppState>, body: Bytes) -> Json<Value> {
    metrics::inc_requests("webhook");
    let owner_id = serde_json::from_slice::<Value>(&body)
        .ok()
        .and_then(|payload| payload.get("owner_id").filter(|id| !id.is_null()).cloned())
        .map(|id| match id {
            Value::String(text) => text,
            other => other.to_string(),
        });
    info!(target = "reconciler.api", owner_id = ?owner_id, "webhook_received");
    state
        .runner
        .pipeline()
        .notifier()
        .log(&format!(
            "Webhook triggered ({})",
            notify::escape_html(owner_id.as_deref().unwrap_or("owner unknown"))
        ))
        .await;

    let runner = state.runner.clone();
    tokio::spawn(async move {
        runner.trigger(CycleTrigger::Webhook).await;
    });
    Json(json!({ "status": "scheduled" }))
}

#[derive(Debug, Deserialize)]
struct ResumeQuery {
    token: Option<String>,
}

async fn resume(
    State(state): State<AppState>,
    Query(query): Query<ResumeQuery>,
) -> Result<Json<Value>, ResumeRejection> {
    metrics::inc_requests("balance_resume");
    check_resume_token(state.resume_token.as_deref(), query.token.as_deref())?;
    let pipeline = state.runner.pipeline();
    let previous = pipeline.gate().manual_resume(pipeline.notifier()).await;
    Ok(Json(json!({
        "status": "resumed",
        "was_paused": previous == GateState::Paused,
    })))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
