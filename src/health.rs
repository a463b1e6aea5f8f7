//! Health check and introspection HTTP endpoint

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;

use crate::registry::{Tunnel, TunnelRegistry};
use crate::server::{MetricsSnapshot, ServerMetrics};

/// Health check state
pub struct HealthState {
    pub metrics: Arc<ServerMetrics>,
    pub registry: Arc<TunnelRegistry>,
    pub start_time: Instant,
    pub server_id: String,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub server_id: String,
    pub uptime_secs: u64,
    pub active_tunnels: usize,
    pub metrics: MetricsSnapshot,
}

impl HealthState {
    fn response(&self, status: &'static str) -> HealthResponse {
        HealthResponse {
            status,
            server_id: self.server_id.clone(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            active_tunnels: self.registry.len(),
            metrics: self.metrics.snapshot(),
        }
    }
}

/// Liveness probe - just checks if server is running
async fn liveness() -> impl IntoResponse {
    StatusCode::OK
}

async fn readiness(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.response("ready")))
}

async fn health(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.response("healthy")))
}

/// Same data as the LIST command
async fn tunnels(State(state): State<Arc<HealthState>>) -> Json<Vec<Tunnel>> {
    Json(state.registry.snapshot())
}

/// Prometheus-compatible metrics endpoint
async fn prometheus_metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let metrics = state.metrics.snapshot();

    let output = format!(
        r#"# HELP punchd_active_sessions Current number of control connections
# TYPE punchd_active_sessions gauge
punchd_active_sessions {{server_id="{server_id}"}} {active_sessions}

# HELP punchd_total_sessions Total control connections since start
# TYPE punchd_total_sessions counter
punchd_total_sessions {{server_id="{server_id}"}} {total_sessions}

# HELP punchd_active_tunnels Current number of registered tunnels
# TYPE punchd_active_tunnels gauge
punchd_active_tunnels {{server_id="{server_id}"}} {active_tunnels}

# HELP punchd_punches_succeeded Total verified reconnections
# TYPE punchd_punches_succeeded counter
punchd_punches_succeeded {{server_id="{server_id}"}} {punches_succeeded}

# HELP punchd_punch_timeouts Total challenges that expired
# TYPE punchd_punch_timeouts counter
punchd_punch_timeouts {{server_id="{server_id}"}} {punch_timeouts}

# HELP punchd_punch_mismatches Total reconnections with a wrong nonce
# TYPE punchd_punch_mismatches counter
punchd_punch_mismatches {{server_id="{server_id}"}} {punch_mismatches}

# HELP punchd_active_relays Current number of running relays
# TYPE punchd_active_relays gauge
punchd_active_relays {{server_id="{server_id}"}} {active_relays}

# HELP punchd_bytes_relayed Total bytes relayed in both directions
# TYPE punchd_bytes_relayed counter
punchd_bytes_relayed {{server_id="{server_id}"}} {bytes_relayed}

# HELP punchd_errors Total error events
# TYPE punchd_errors counter
punchd_errors {{server_id="{server_id}"}} {errors}

# HELP punchd_uptime_seconds Server uptime in seconds
# TYPE punchd_uptime_seconds gauge
punchd_uptime_seconds {{server_id="{server_id}"}} {uptime}
"#,
        server_id = state.server_id,
        active_sessions = metrics.active_sessions,
        total_sessions = metrics.total_sessions,
        active_tunnels = state.registry.len(),
        punches_succeeded = metrics.punches_succeeded,
        punch_timeouts = metrics.punch_timeouts,
        punch_mismatches = metrics.punch_mismatches,
        active_relays = metrics.active_relays,
        bytes_relayed = metrics.bytes_relayed,
        errors = metrics.errors,
        uptime = state.start_time.elapsed().as_secs(),
    );

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        output,
    )
}

/// Create the health check router
pub fn health_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/livez", get(liveness))
        .route("/readyz", get(readiness))
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/tunnels", get(tunnels))
        .with_state(state)
}

/// Run the health check HTTP server
pub async fn run_health_server(state: Arc<HealthState>, bind_ip: IpAddr, port: u16) -> anyhow::Result<()> {
    let listener = bind_health(bind_ip, port).await?;
    serve_health(listener, state).await
}

/// Bind the health listener on the same address as the control listener
pub async fn bind_health(bind_ip: IpAddr, port: u16) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(SocketAddr::new(bind_ip, port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "Health check server listening");
    Ok(listener)
}

pub async fn serve_health(listener: TcpListener, state: Arc<HealthState>) -> anyhow::Result<()> {
    axum::serve(listener, health_router(state)).await?;
    Ok(())
}
