//! # Status Server
//!
//! Read-only HTTP surface of the relay: liveness, Prometheus metrics and job lookup.

use std::net::SocketAddr;

use alloy_primitives::B256;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use zkbridge_types::RelayJob;

use crate::{service::coordinator::JobRegistry, storage::JobStore};

/// State shared by the status handlers.
#[derive(Clone)]
pub struct StatusState {
    /// In-memory job view.
    pub registry: JobRegistry,
    /// Job log, consulted for jobs no longer held in memory.
    pub store: Option<JobStore>,
    /// Prometheus handle; `/metrics` is empty without one.
    pub metrics: Option<PrometheusHandle>,
}

/// Builds the router of the status server.
pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(StatusCode::OK))
        .route("/metrics", get(get_metrics))
        .route("/jobs/{source_tx_hash}", get(get_job))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// HTTP handler for the `/metrics` endpoint.
async fn get_metrics(State(state): State<StatusState>) -> String {
    state
        .metrics
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default()
}

/// HTTP handler for the `/jobs/{source_tx_hash}` endpoint.
async fn get_job(
    State(state): State<StatusState>,
    Path(source_tx_hash): Path<String>,
) -> Result<Json<RelayJob>, (StatusCode, String)> {
    let source_tx_hash: B256 = source_tx_hash
        .parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid transaction hash".to_string()))?;

    if let Some(job) = state.registry.get(&source_tx_hash).await {
        return Ok(Json(job));
    }

    let persisted = match &state.store {
        Some(store) => store
            .load(&source_tx_hash)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?,
        None => None,
    };
    persisted
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, "Job not found".to_string()))
}

pub struct StatusServer {
    port: u16,
    state: StatusState,
}

impl StatusServer {
    pub fn new(port: u16, state: StatusState) -> Self {
        Self { port, state }
    }

    pub async fn run(self, shutdown_token: CancellationToken) -> anyhow::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(addr = %addr, "Status server listening");

        let result = axum::serve(listener, router(self.state))
            .with_graceful_shutdown(shutdown_token.cancelled_owned())
            .await;
        if let Err(e) = &result {
            error!(error = %e, "Status server error");
        }

        info!("Status server stopped");
        Ok(result?)
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{B256, U256};
    use axum::{
        extract::{Path, State},
        http::StatusCode,
    };
    use zkbridge_types::{LockEvent, RelayJob};

    use super::{StatusState, get_job, get_metrics};
    use crate::{service::coordinator::JobRegistry, storage::JobStore};

    fn job(tx: u8) -> RelayJob {
        RelayJob::new(
            LockEvent {
                encrypted_data: U256::from(1u64),
                block_number: 1,
                timestamp: 1,
                nonce_hash: B256::ZERO,
                source_tx_hash: B256::repeat_byte(tx),
                log_block_number: 1,
                log_index: 0,
            },
            1,
        )
    }

    #[tokio::test]
    async fn test_get_job_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path()).unwrap();
        store.save(&job(1)).unwrap();

        let state = StatusState {
            registry: JobRegistry::new(16),
            store: Some(store),
            metrics: None,
        };

        let response = get_job(State(state), Path(B256::repeat_byte(1).to_string()))
            .await
            .unwrap();
        assert_eq!(response.source_tx_hash, B256::repeat_byte(1));
    }

    #[tokio::test]
    async fn test_get_job_errors() {
        let state = StatusState {
            registry: JobRegistry::new(16),
            store: None,
            metrics: None,
        };

        let (status, _) = get_job(State(state.clone()), Path("0x1234".to_string()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, message) = get_job(State(state), Path(B256::repeat_byte(2).to_string()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(message, "Job not found");
    }

    #[tokio::test]
    async fn test_metrics_without_recorder() {
        let state = StatusState {
            registry: JobRegistry::new(16),
            store: None,
            metrics: None,
        };
        assert_eq!(get_metrics(State(state)).await, "");
    }
}
