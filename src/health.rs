//! Health and readiness reporting.
//!
//! The reconciler and the bootstrap gate record their progress in a shared
//! [`Health`] handle; an optional HTTP listener exposes it as
//! `/healthz`, `/readyz` and `/status`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use log::info;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::shutdown::Shutdown;

/// Where the reconciliation loop currently is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Reconciling,
    Converged,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusReport {
    pub bootstrap_passed: bool,
    pub bootstrap_error: Option<String>,
    pub phase: Phase,
    /// The last reconciliation left both sinks matching the snapshot.
    pub converged: bool,
    pub store_error: Option<String>,
    pub artifact_error: Option<String>,
    pub desired_version: u64,
    pub applied_version: u64,
    pub peers: usize,
    pub last_applied_at: Option<u64>,
    pub last_attempt_at: Option<u64>,
}

impl StatusReport {
    pub fn is_ready(&self) -> bool {
        self.bootstrap_passed && self.converged
    }
}

#[derive(Clone, Default)]
pub struct Health(Arc<RwLock<StatusReport>>);

impl Health {
    pub async fn update(&self, f: impl FnOnce(&mut StatusReport)) {
        let mut report = self.0.write().await;
        f(&mut report);
    }

    pub async fn report(&self) -> StatusReport {
        self.0.read().await.clone()
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Serves the health endpoints until shutdown.
pub async fn run_health_server(bind: SocketAddr, health: Health, mut shutdown: Shutdown) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/status", get(status))
        .with_state(health);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("Health endpoint listening on {}", bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;
    Ok(())
}

/// GET /healthz - the process is alive
async fn healthz() -> impl IntoResponse {
    "OK"
}

/// GET /readyz - bootstrap passed and the last reconciliation converged
async fn readyz(State(health): State<Health>) -> impl IntoResponse {
    let report = health.report().await;
    if report.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// GET /status - full report
async fn status(State(health): State<Health>) -> impl IntoResponse {
    Json(health.report().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn readiness_needs_bootstrap_and_convergence() {
        let health = Health::default();
        let resp = readyz(State(health.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        health
            .update(|r| {
                r.bootstrap_passed = true;
                r.converged = true;
            })
            .await;
        let resp = readyz(State(health.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        health.update(|r| r.converged = false).await;
        let resp = readyz(State(health)).await.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn status_serialises_phase() {
        let health = Health::default();
        health.update(|r| r.phase = Phase::Failed).await;
        let value = serde_json::to_value(health.report().await).unwrap();
        assert_eq!(value["phase"], "failed");
        assert_eq!(value["converged"], false);
    }
}
