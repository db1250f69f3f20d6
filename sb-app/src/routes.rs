//! Webhook HTTP surface: the only inbound interface the process exposes.

use axum::extract::Query;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use sb_transport::{InboundEvent, WebhookPayload, build_inbound_events};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

pub struct AppState {
    pub verify_token: String,
    pub inbound_tx: mpsc::Sender<InboundEvent>,
    pub started_at: Instant,
}

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/webhook", get(get_webhook_verification).post(post_webhook))
        .route("/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_webhook_verification(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    match verification_challenge(&params, &state.verify_token) {
        Some(challenge) => {
            tracing::info!("webhook verification handshake accepted");
            (StatusCode::OK, challenge)
        }
        None => {
            tracing::warn!("webhook verification handshake rejected");
            (StatusCode::FORBIDDEN, String::new())
        }
    }
}

#[tracing::instrument(level = "debug", skip_all)]
async fn post_webhook(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<WebhookPayload>,
) -> impl IntoResponse {
    let events = build_inbound_events(&payload);
    let received = events.len();
    for event in events {
        if let Err(error) = state.inbound_tx.send(event).await {
            tracing::error!(%error, "inbound queue closed; dropping webhook event");
        }
    }
    tracing::debug!(received, "webhook delivery ingested");
    (StatusCode::OK, Json(serde_json::json!({ "received": received })))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "checked_at": Utc::now(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

/// Graph webhook verification: echo `hub.challenge` back iff the mode is a
/// subscription and the caller presents the configured token.
fn verification_challenge(
    params: &HashMap<String, String>,
    verify_token: &str,
) -> Option<String> {
    let mode = params.get("hub.mode").map(String::as_str)?;
    let token = params.get("hub.verify_token").map(String::as_str)?;
    let challenge = params.get("hub.challenge")?;
    if mode == "subscribe" && token == verify_token {
        return Some(challenge.clone());
    }
    None
}
