//! Switchboard server: wires the transport, backend, and core together and
//! exposes the webhook listener that feeds the event stream.

use crate::config::SwitchboardConfig;
use crate::gateway::Gateway;
use crate::routes;
use crate::routes::AppState;
use anyhow::Result;
use axum::Extension;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use sb_backend::AssistantBackend;
use sb_core::{
    Dispatcher, InboundAggregator, ManualCorrelator, ResponseEmitter, SelfEchoRegistry,
    ThreadBindingRegistry,
};
use sb_transport::{ConversationId, OutboundMessage, Transport, WhatsAppCloudTransport};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = SwitchboardConfig::load(config_path).await?;
    tracing::info!(
        phone_number_id = %cfg.whatsapp.phone_number_id,
        assistant_id = %cfg.backend.assistant_id,
        bind_addr = %cfg.runtime.bind_addr,
        debounce_ms = cfg.aggregator.debounce_ms,
        cooldown_ms = cfg.dispatcher.cooldown_ms,
        "config ok"
    );
    Ok(())
}

pub async fn send_one_shot(
    config_path: Option<PathBuf>,
    recipient: &str,
    message: &str,
) -> Result<()> {
    let cfg = SwitchboardConfig::load(config_path).await?;
    let transport =
        WhatsAppCloudTransport::new(&cfg.whatsapp.access_token, &cfg.whatsapp.phone_number_id)?;
    let message_id = transport
        .send(
            &ConversationId::from_address(recipient),
            OutboundMessage {
                content: message.to_string(),
                reply_to_message_id: None,
            },
        )
        .await?;
    tracing::info!(%message_id, "one-shot message sent");
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = SwitchboardConfig::load(config_path).await?;
    let started_at = Instant::now();
    let addr: SocketAddr = cfg
        .runtime
        .bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid runtime.bind_addr {}: {e}", cfg.runtime.bind_addr))?;
    tracing::info!(
        bind_addr = %addr,
        phone_number_id = %cfg.whatsapp.phone_number_id,
        assistant_id = %cfg.backend.assistant_id,
        debounce_ms = cfg.aggregator.debounce_ms,
        cooldown_ms = cfg.dispatcher.cooldown_ms,
        max_attempts = cfg.dispatcher.max_attempts,
        max_queue = cfg.dispatcher.max_queue,
        max_chunk_chars = cfg.emitter.max_chunk_chars,
        pacing_ms = cfg.emitter.pacing_ms,
        echo_retention_secs = cfg.echo.retention_secs,
        binding_idle_ttl_secs = cfg.bindings.idle_ttl_secs,
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    let transport: Arc<dyn Transport> = Arc::new(WhatsAppCloudTransport::new(
        &cfg.whatsapp.access_token,
        &cfg.whatsapp.phone_number_id,
    )?);
    let mut backend = AssistantBackend::new(&cfg.backend.api_key, &cfg.backend.assistant_id)?
        .with_run_timeout(Duration::from_secs(cfg.backend.run_timeout_seconds))
        .with_poll_interval(Duration::from_millis(cfg.backend.poll_interval_ms));
    if let Some(base_url) = cfg.backend.base_url.clone() {
        backend = backend.with_base_url(base_url);
    }

    let echoes = Arc::new(SelfEchoRegistry::new(cfg.echo_retention()));
    let bindings = Arc::new(ThreadBindingRegistry::new(cfg.binding_idle_ttl()));
    let emitter = Arc::new(ResponseEmitter::new(
        cfg.emitter_config(),
        transport.clone(),
        echoes.clone(),
    ));
    let dispatcher = Dispatcher::new(
        cfg.dispatcher_config(),
        bindings.clone(),
        Arc::new(backend),
        emitter,
    );
    let aggregator = InboundAggregator::new(cfg.aggregator_config(), dispatcher.clone());
    let correlator = ManualCorrelator::new(
        cfg.correlator_config(),
        bindings,
        dispatcher,
        echoes,
    );

    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(1024);
    transport.start(inbound_tx.clone()).await?;

    let gateway = Arc::new(Gateway::new(aggregator, correlator, inbound_rx));
    let shutdown = CancellationToken::new();
    let gateway_handle = gateway.start(shutdown.child_token());
    tracing::info!("gateway started");

    let state = Arc::new(AppState {
        verify_token: cfg.whatsapp.verify_token.clone(),
        inbound_tx,
        started_at,
    });

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = routes::router()
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(cfg.runtime.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.runtime.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "switchboard serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    match gateway_handle.await {
        Ok(()) => tracing::info!("gateway shutdown completed"),
        Err(e) => tracing::error!(error = %e, "gateway task join failed during shutdown"),
    }

    Ok(())
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
