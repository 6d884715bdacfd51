//! HTTP surface: status, the live event stream and the manual scan trigger.
//!
//! `GET /scrape` streams server-sent events. A new client first receives one
//! status log and one result frame built from the cache at connection time
//! (restricted by the optional `city`/`category` query parameters), then every
//! frame broadcast afterwards, unfiltered.

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, future};
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::broadcast::Broadcaster;
use crate::models::{Frame, LogFrame, LogLevel};
use crate::scheduler::{ScanJob, Scheduler};
use crate::store::{EventFilter, EventStore, StoreHandle};

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub struct AppState<J> {
    pub store: StoreHandle,
    pub broadcaster: Broadcaster,
    pub scheduler: Arc<Scheduler<J>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    scanning: bool,
    events: usize,
    timestamp: Option<DateTime<Utc>>,
    next_scan: Option<i64>,
    logs: Vec<LogFrame>,
}

pub fn build_router<J: ScanJob + 'static>(state: Arc<AppState<J>>) -> Router {
    Router::new()
        .route("/", get(status::<J>))
        .route("/scrape", get(scrape::<J>))
        .route("/scan", post(start_scan::<J>))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn status<J: ScanJob + 'static>(State(state): State<Arc<AppState<J>>>) -> impl IntoResponse {
    let scanning = state.scheduler.gate().is_scanning();
    let body = state.store.read(|s| StatusBody {
        status: "online",
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        scanning,
        events: s.events().len(),
        timestamp: s.timestamp(),
        next_scan: s.next_scan().map(|at| at.timestamp_millis()),
        logs: s.logs().to_vec(),
    });
    Json(body)
}

fn status_log(store: &EventStore, scanning: bool) -> Frame {
    if scanning {
        Frame::log("A scan is in progress; analyzing sources...", LogLevel::Warn)
    } else if store.timestamp().is_some() {
        Frame::log("Serving AI-verified results.", LogLevel::Success)
    } else {
        Frame::log("First scan pending... Please wait.", LogLevel::Warn)
    }
}

async fn scrape<J: ScanJob + 'static>(
    State(state): State<Arc<AppState<J>>>,
    Query(filter): Query<EventFilter>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let gate = state.scheduler.gate().clone();
    let store = state.store.clone();
    let subscription = state.broadcaster.subscribe_with(|| {
        let scanning = gate.is_scanning();
        store.read(|s| {
            vec![
                status_log(s, scanning),
                Frame::Result(s.result_frame(&filter)),
            ]
        })
    });
    info!(
        subscriber = subscription.id(),
        city = ?filter.city,
        category = ?filter.category,
        "SSE client connected"
    );

    let stream = subscription.filter_map(|frame| {
        future::ready(match Event::default().json_data(&frame) {
            Ok(event) => Some(Ok(event)),
            Err(e) => {
                warn!(error = %e, "Dropping frame that failed to serialize");
                None
            }
        })
    });
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    )
}

async fn start_scan<J: ScanJob + 'static>(
    State(state): State<Arc<AppState<J>>>,
) -> impl IntoResponse {
    if state.scheduler.trigger_in_background() {
        info!("Manual scan started");
        (StatusCode::ACCEPTED, Json(json!({"status": "started"})))
    } else {
        (StatusCode::CONFLICT, Json(json!({"status": "busy"})))
    }
}

/// Bind and serve until Ctrl+C.
pub async fn serve(router: Router, port: u16) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        future::pending::<()>().await;
    }
    info!("Shutting down");
}
