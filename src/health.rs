// Health endpoint - exposes the daemon's state over HTTP
//
// GET /health returns queue depths, pipeline and correlator counters, store
// statistics and uptime as JSON. Binds to 127.0.0.1 by default (localhost
// only). `hookq status` builds the same snapshot without a running daemon.

use crate::correlator::CorrelatorSnapshot;
use crate::pipeline::{Pipeline, PipelineSnapshot};
use crate::queue::QueueDepths;
use crate::store::StoreStats;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// State shared with the health handler
#[derive(Clone)]
pub struct HealthState {
    pipeline: Arc<Pipeline>,
    started: Instant,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    /// Running, but something needs an operator: dead letters, or the queue
    /// or store could not be read
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub queue: QueueDepths,
    pub last_success_at: Option<DateTime<Utc>>,
    pub pipeline: PipelineSnapshot,
    pub correlator: CorrelatorSnapshot,
    pub store: Option<StoreStats>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl HealthState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            pipeline,
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// Collect a snapshot (blocking: lists directories and queries the store)
    pub fn snapshot(&self) -> HealthSnapshot {
        let mut errors = Vec::new();

        let queue = self.pipeline.layout().depths().unwrap_or_else(|e| {
            errors.push(format!("queue: {e}"));
            QueueDepths::default()
        });
        let store = match self.pipeline.correlator().store().stats() {
            Ok(stats) => Some(stats),
            Err(e) => {
                errors.push(format!("store: {e}"));
                None
            }
        };

        let status = if errors.is_empty() && queue.failed == 0 {
            HealthStatus::Ok
        } else {
            HealthStatus::Degraded
        };
        let pipeline = self.pipeline.metrics().snapshot();

        HealthSnapshot {
            status,
            started_at: self.started_at,
            uptime_secs: self.started.elapsed().as_secs(),
            queue,
            last_success_at: pipeline.last_success_at,
            pipeline,
            correlator: self.pipeline.correlator().metrics(),
            store,
            errors,
        }
    }
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .with_state(state)
}

/// Serve `/health` until `shutdown_rx` fires
pub async fn serve(
    listener: TcpListener,
    state: HealthState,
    shutdown_rx: oneshot::Receiver<()>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Health endpoint on http://{}/health", addr);
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        })
        .await
}

async fn get_health(State(state): State<HealthState>) -> impl IntoResponse {
    match tokio::task::spawn_blocking(move || state.snapshot()).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => {
            tracing::error!("Health snapshot failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::{Correlator, CorrelatorConfig};
    use crate::envelope::{EventEnvelope, EventPayload, SessionStarted};
    use crate::pipeline::PipelineOptions;
    use crate::queue::{QueueLayout, QueueWriter};
    use crate::store::testing::temp_store;

    fn state() -> (tempfile::TempDir, tempfile::TempDir, QueueWriter, HealthState) {
        let (db_dir, store) = temp_store();
        let dir = tempfile::tempdir().unwrap();
        let layout = QueueLayout::new(dir.path());
        let writer = QueueWriter::new(layout.clone()).unwrap();
        let correlator = Arc::new(Correlator::new(Arc::new(store), CorrelatorConfig::default()));
        let pipeline = Arc::new(Pipeline::new(layout, correlator, PipelineOptions::default()));
        (dir, db_dir, writer, HealthState::new(pipeline))
    }

    #[test]
    fn test_snapshot_counts_incoming() {
        let (_dir, _db_dir, writer, state) = state();
        writer
            .write(&EventEnvelope::new(
                "s1",
                EventPayload::SessionStarted(SessionStarted::default()),
            ))
            .unwrap();

        let snap = state.snapshot();
        assert_eq!(snap.status, HealthStatus::Ok);
        assert_eq!(snap.queue.incoming, 1);
        assert_eq!(snap.last_success_at, None);
        assert_eq!(snap.store.unwrap().events, 0);
    }

    #[test]
    fn test_dead_letters_degrade() {
        let (_dir, _db_dir, writer, state) = state();
        let failed = writer.layout().dir(crate::queue::QueueState::Failed);
        std::fs::write(failed.join("1-s-session_ended-e.json"), "{}").unwrap();

        assert_eq!(state.snapshot().status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_health_endpoint_serves_json() {
        let (_dir, _db_dir, _writer, state) = state();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let server = tokio::spawn(serve(listener, state, shutdown_rx));

        let body: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["queue"]["incoming"], 0);
        assert!(body["uptime_secs"].is_u64());
        assert_eq!(body["pipeline"]["archived"], 0);

        shutdown_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
