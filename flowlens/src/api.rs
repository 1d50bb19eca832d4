//! HTTP read paths over the published stats.
//!
//! The REST API requires `Authorization: Bearer <api_key>` on every route.
//! The Prometheus scrape endpoint is served on its own listener without
//! authentication.

use std::{fmt::Write as _, io, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::SecondsFormat;
use serde::Serialize;
use serde_json::json;
use tokio::{net::TcpListener, sync::watch};
use tracing::{debug, info};

use crate::{
    model::ServerPlayerStats,
    publisher::{StatsPublisher, StatsSnapshot},
};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone)]
struct ApiState {
    publisher: Arc<StatsPublisher>,
    api_key: Arc<str>,
}

#[derive(Debug, Serialize)]
struct ServerMetrics {
    server_id: String,
    active_players: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    unique_ips: Vec<String>,
    sample_window_seconds: u64,
    total_bytes: u64,
    timestamp: String,
}

impl From<&ServerPlayerStats> for ServerMetrics {
    fn from(stats: &ServerPlayerStats) -> Self {
        Self {
            server_id: stats.server_id.clone(),
            active_players: stats.active_players,
            unique_ips: stats.unique_addresses.iter().map(|a| a.to_string()).collect(),
            sample_window_seconds: stats.sample_window.as_secs(),
            total_bytes: stats.total_bytes,
            timestamp: stats.computed_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

#[derive(Debug, Serialize)]
struct ServersResponse {
    servers: Vec<ServerMetrics>,
}

/// The authenticated REST router.
pub fn router(publisher: Arc<StatsPublisher>, api_key: &str) -> Router {
    let state = ApiState {
        publisher,
        api_key: Arc::from(api_key),
    };
    Router::new()
        .route("/metrics/servers", get(list_servers))
        .route("/metrics/servers/:id", get(get_server))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer))
        .with_state(state)
}

/// The unauthenticated Prometheus scrape router.
pub fn prometheus_router(publisher: Arc<StatsPublisher>) -> Router {
    Router::new()
        .route("/metrics", get(scrape))
        .with_state(publisher)
}

/// Serves `router` until `shutdown` flips, then drains in-flight requests.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "http listener started");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    info!(%addr, "http listener stopped");
    Ok(())
}

async fn require_bearer(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Response {
    if !authorized(request.headers(), &state.api_key) {
        debug!(path = %request.uri().path(), "rejected unauthenticated request");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "unauthorized" })),
        )
            .into_response();
    }
    next.run(request).await
}

fn authorized(headers: &HeaderMap, api_key: &str) -> bool {
    let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
    else {
        return false;
    };
    constant_time_eq(token.as_bytes(), api_key.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

async fn list_servers(State(state): State<ApiState>) -> Json<ServersResponse> {
    let snapshot = state.publisher.snapshot();
    Json(ServersResponse {
        servers: snapshot.servers.values().map(ServerMetrics::from).collect(),
    })
}

async fn get_server(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.publisher.get(&id) {
        Some(stats) => Json(ServerMetrics::from(&stats)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "server not found" })),
        )
            .into_response(),
    }
}

async fn scrape(State(publisher): State<Arc<StatsPublisher>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        render_prometheus(&publisher.snapshot()),
    )
}

/// Renders the snapshot in the Prometheus text exposition format. Servers
/// without a record have no series.
fn render_prometheus(snapshot: &StatsSnapshot) -> String {
    let mut out = String::new();
    let gauges: [(&str, &str, fn(&ServerPlayerStats) -> u64); 2] = [
        (
            "flowlens_active_players",
            "Number of active players on game server",
            |s| s.active_players as u64,
        ),
        (
            "flowlens_total_bytes",
            "Total bytes transferred in sample window",
            |s| s.total_bytes,
        ),
    ];
    for (name, help, value) in gauges {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} gauge");
        for stats in snapshot.servers.values() {
            let _ = writeln!(
                out,
                "{name}{{server_id=\"{}\"}} {}",
                escape_label(&stats.server_id),
                value(stats)
            );
        }
    }
    out
}

fn escape_label(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    escaped
}
