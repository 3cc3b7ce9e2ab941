use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::domain::BoardFilters;

use super::channel::{ChannelConfig, RealtimeChannel};
use super::{
    BoardSource, BoardStore, CommandGateway, HttpGateway, ReconciliationController, SyncError,
    TransitionValidator,
};

/// One connected board client: store, controller and live channel wired
/// together.
pub struct SyncSession {
    controller: Arc<ReconciliationController>,
    channel: RealtimeChannel,
    pump: JoinHandle<()>,
}

impl SyncSession {
    pub async fn connect(config: ClientConfig) -> Result<Self, SyncError> {
        let gateway = Arc::new(HttpGateway::new(
            reqwest::Client::new(),
            config.api_url.clone(),
            config.session_id.clone(),
            config.request_timeout,
        ));
        Self::connect_with(config, gateway.clone(), gateway).await
    }

    pub async fn connect_with(
        config: ClientConfig,
        gateway: Arc<dyn CommandGateway>,
        source: Arc<dyn BoardSource>,
    ) -> Result<Self, SyncError> {
        let board = source
            .fetch_board(&BoardFilters::default())
            .await
            .map_err(|e| SyncError::BoardFetch(e.to_string()))?;
        let model = board
            .stage_model()
            .map_err(|e| SyncError::BoardFetch(e.to_string()))?;

        tracing::info!(
            session_id = config.session_id.as_str(),
            stages = model.all().len(),
            cards = board.len(),
            "Board loaded"
        );

        let store = Arc::new(BoardStore::new(board));
        let controller = Arc::new(ReconciliationController::new(
            config.session_id.clone(),
            store,
            TransitionValidator::new(model),
            gateway,
            source,
        )
        .with_resync_backoff(config.reconnect_initial, config.reconnect_max));

        let channel = RealtimeChannel::new(ChannelConfig {
            url: config.ws_url.clone(),
            initial_backoff: config.reconnect_initial,
            max_backoff: config.reconnect_max,
        });
        let pump = tokio::spawn(Arc::clone(&controller).run(channel.subscribe()));
        channel.start();

        Ok(Self {
            controller,
            channel,
            pump,
        })
    }

    pub fn controller(&self) -> &Arc<ReconciliationController> {
        &self.controller
    }

    pub fn store(&self) -> &Arc<BoardStore> {
        self.controller.store()
    }

    pub fn channel(&self) -> &RealtimeChannel {
        &self.channel
    }

    pub fn session_id(&self) -> &str {
        self.controller.session_id()
    }

    pub fn shutdown(self) {
        self.channel.close();
        self.pump.abort();
        tracing::info!(session_id = self.controller.session_id(), "Sync session closed");
    }
}
