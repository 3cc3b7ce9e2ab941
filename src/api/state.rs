use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::domain::{PipelineError, RemoteChangeEvent, StageModel};

#[derive(Clone, Debug)]
pub struct AppState {
    pub db: Option<SqlitePool>,
    pub events_tx: broadcast::Sender<String>,
    pub stages: Arc<StageModel>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(
        db: Option<SqlitePool>,
        events_tx: broadcast::Sender<String>,
        stages: Arc<StageModel>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            events_tx,
            stages,
            config,
        }
    }

    pub fn require_db(&self) -> Result<&SqlitePool, PipelineError> {
        self.db
            .as_ref()
            .ok_or_else(|| PipelineError::Internal("Database not available".into()))
    }

    /// Fans a change out to every board socket. Having no listeners is fine.
    pub fn publish(&self, event: &RemoteChangeEvent) {
        match serde_json::to_string(event) {
            Ok(json) => {
                let _ = self.events_tx.send(json);
            }
            Err(e) => tracing::error!("Failed to serialize change event: {}", e),
        }
    }
}
