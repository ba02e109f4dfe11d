//! HTTP route handlers.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use futures::stream::Stream;
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::engine::{Engine, RequestEvent, Submission};
use crate::history::RunRecord;
use crate::strategy::StrategyInfo;

use super::hub::RequestHub;
use super::types::*;

const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Shared application state.
pub struct AppState {
    pub engine: Arc<Engine>,
    pub hub: RequestHub,
}

/// Start the HTTP server.
pub async fn serve(engine: Arc<Engine>) -> anyhow::Result<()> {
    let config = Arc::clone(engine.config());
    let state = Arc::new(AppState {
        engine,
        hub: RequestHub::new(),
    });

    let app = router(Arc::clone(&state));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}

/// Build the API router over `state`.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/requests", post(submit_request))
        .route("/api/requests/:id", get(get_request))
        .route("/api/requests/:id/events", get(request_events))
        .route("/api/requests/:id/cancel", post(cancel_request))
        .route("/api/strategies", get(list_strategies))
        .route("/api/history", get(list_history))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wait for a shutdown signal, then cancel whatever is still running.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    let cancelled = state.hub.cancel_all().await;
    if cancelled > 0 {
        tracing::info!(cancelled, "shutdown signal received, cancelled running requests");
    } else {
        tracing::info!("shutdown signal received");
    }
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let config = state.engine.config();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        planner_model: config.planner_model.clone(),
        synthesis_model: config.synthesis_model.clone(),
        fan_out_limit: config.fan_out_limit,
        history_persistent: state.engine.store().is_persistent(),
    })
}

/// Accept a request and start driving it in the background.
async fn submit_request(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, (StatusCode, String)> {
    if req.text.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "request text is empty".to_string()));
    }

    let request_id = Uuid::new_v4();
    let cancel = state.hub.register(request_id).await;
    state
        .hub
        .publish(request_id, RequestEvent::Accepted { request_id })
        .await;

    let submission = Submission {
        text: req.text,
        recent_context: req.recent_context,
        confirm_budget: req.confirm_budget,
    };
    let task_state = Arc::clone(&state);
    tokio::spawn(async move {
        run_request(task_state, request_id, submission, cancel).await;
    });

    Ok(Json(SubmitResponse { request_id }))
}

/// Drive one request to completion, mirroring engine events into the hub.
async fn run_request(
    state: Arc<AppState>,
    request_id: Uuid,
    submission: Submission,
    cancel: CancellationToken,
) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let pump_state = Arc::clone(&state);
    let pump = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            pump_state.hub.publish(request_id, event).await;
        }
    });

    // The engine records and reports its own failures; the hub sees them
    // as a `failed` event through the pump.
    let _ = state.engine.run(request_id, &submission, cancel, &tx).await;
    drop(tx);
    let _ = pump.await;
}

/// Get a request's progress and outcome snapshot.
async fn get_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<RequestSnapshot>, (StatusCode, String)> {
    state
        .hub
        .snapshot(id)
        .await
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("request {} not found", id)))
}

/// Stream a request's events via SSE.
///
/// The log so far is replayed first, then the stream follows live events
/// and closes after the terminal one.
async fn request_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    let (replay, mut rx) = state
        .hub
        .subscribe(id)
        .await
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("request {} not found", id)))?;

    let stream = async_stream::stream! {
        let mut done = false;
        for event in replay {
            done = event.is_terminal();
            yield Ok(sse_event(&event));
            if done {
                break;
            }
        }
        while !done {
            match rx.recv().await {
                Ok(event) => {
                    done = event.is_terminal();
                    yield Ok(sse_event(&event));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(request_id = %id, skipped, "events client lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

fn sse_event(event: &RequestEvent) -> Event {
    Event::default()
        .event(event.event_name())
        .json_data(event)
        .unwrap()
}

/// Request cooperative cancellation of a running request.
async fn cancel_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    match state.hub.cancel(id).await {
        Some(true) => Ok(Json(serde_json::json!({
            "success": true,
            "message": "cancellation requested"
        }))),
        Some(false) => Err((
            StatusCode::BAD_REQUEST,
            format!("request {} has already finished", id),
        )),
        None => Err((StatusCode::NOT_FOUND, format!("request {} not found", id))),
    }
}

/// List the registered gathering strategies.
async fn list_strategies(State(state): State<Arc<AppState>>) -> Json<Vec<StrategyInfo>> {
    Json(state.engine.registry().catalog())
}

/// Query parameters for the history listing.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    limit: Option<usize>,
}

/// List recent run records, newest first.
async fn list_history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<Vec<RunRecord>>, (StatusCode, String)> {
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    state
        .engine
        .store()
        .recent(limit)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
