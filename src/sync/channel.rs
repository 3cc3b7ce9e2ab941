//! Live board subscription over a WebSocket.
//!
//! The channel joins the `board` room, waits for the server's `connected`
//! acknowledgement and then relays every change event to its subscribers.
//! Dropped connections are retried with exponential backoff. Nothing is
//! replayed after a reconnect, so consumers resync the whole board whenever
//! the state returns to [`ChannelState::Connected`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use crate::domain::RemoteChangeEvent;

pub const BOARD_ROOM: &str = "board";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const NOTICE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting { attempt: u32 },
    Connected,
}

impl ChannelState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ChannelState::Connected)
    }
}

#[derive(Debug, Clone)]
pub enum ChannelNotice {
    Event(RemoteChangeEvent),
    State(ChannelState),
}

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    Join { room: String },
    Ping,
}

/// Frames received from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Connected { room: Option<String> },
    Pong,
    Event(RemoteChangeEvent),
    Unknown(String),
}

pub fn parse_server_frame(text: &str) -> Result<ServerFrame, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    let frame_type = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Ok(match frame_type.as_str() {
        "connected" => ServerFrame::Connected {
            room: value.get("room").and_then(Value::as_str).map(String::from),
        },
        "pong" => ServerFrame::Pong,
        "lead-updated" | "lead-status-updated" | "lead-archived" => {
            ServerFrame::Event(serde_json::from_value(value)?)
        }
        _ => ServerFrame::Unknown(frame_type),
    })
}

/// Delay before reconnect attempt `attempt` (1-based): `initial`, doubling
/// each time, capped at `max`.
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    initial.saturating_mul(1u32 << exponent).min(max)
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

pub struct RealtimeChannel {
    config: ChannelConfig,
    notices: broadcast::Sender<ChannelNotice>,
    state_tx: Arc<watch::Sender<ChannelState>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeChannel {
    /// Creates a closed channel. Subscribe first, then call [`start`](Self::start)
    /// so no notice is missed.
    pub fn new(config: ChannelConfig) -> Self {
        let (notices, _rx) = broadcast::channel(NOTICE_CAPACITY);
        let (state_tx, _state_rx) = watch::channel(ChannelState::Disconnected);
        Self {
            config,
            notices,
            state_tx: Arc::new(state_tx),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let Ok(mut task) = self.task.lock() else {
            return;
        };
        if task.is_some() || self.shutdown.is_cancelled() {
            return;
        }

        let worker = ChannelWorker {
            config: self.config.clone(),
            notices: self.notices.clone(),
            state_tx: Arc::clone(&self.state_tx),
            shutdown: self.shutdown.clone(),
        };
        *task = Some(tokio::spawn(worker.run()));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelNotice> {
        self.notices.subscribe()
    }

    /// Runs `handler` for every event, in arrival order, on a dedicated task.
    pub fn on_event<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: Fn(RemoteChangeEvent) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ChannelNotice::Event(event)) => handler(event),
                    Ok(ChannelNotice::State(_)) => {}
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Realtime event handler lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn state(&self) -> ChannelState {
        self.state_tx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct ChannelWorker {
    config: ChannelConfig,
    notices: broadcast::Sender<ChannelNotice>,
    state_tx: Arc<watch::Sender<ChannelState>>,
    shutdown: CancellationToken,
}

impl ChannelWorker {
    async fn run(self) {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.set_state(ChannelState::Connecting { attempt });

            let result = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.connect_and_listen(&mut attempt) => result,
            };

            self.set_state(ChannelState::Disconnected);
            match result {
                Ok(()) => tracing::info!("Realtime channel closed by server, reconnecting..."),
                Err(e) => tracing::warn!(error = %e, attempt, "Realtime channel error"),
            }

            let delay = backoff_delay(
                attempt.max(1),
                self.config.initial_backoff,
                self.config.max_backoff,
            );
            tracing::debug!(delay_ms = delay.as_millis() as u64, "Waiting before reconnect");

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ChannelState::Disconnected);
        tracing::info!("Realtime channel closed");
    }

    async fn connect_and_listen(&self, attempt: &mut u32) -> Result<()> {
        tracing::info!(url = self.config.url.as_str(), "Connecting realtime channel");

        let (ws_stream, _response) = connect_async(self.config.url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let join = serde_json::to_string(&ClientFrame::Join {
            room: BOARD_ROOM.into(),
        })?;
        write.send(Message::Text(join)).await?;

        tokio::time::timeout(HANDSHAKE_TIMEOUT, wait_for_ack(&mut read))
            .await
            .map_err(|_| anyhow!("handshake timed out"))??;

        *attempt = 0;
        self.set_state(ChannelState::Connected);
        tracing::info!("Realtime channel connected");

        while let Some(message) = read.next().await {
            match message? {
                Message::Text(text) => self.relay(&text),
                Message::Ping(data) => write.send(Message::Pong(data)).await?,
                Message::Close(_) => return Ok(()),
                _ => {}
            }
        }

        Ok(())
    }

    fn relay(&self, text: &str) {
        match parse_server_frame(text) {
            Ok(ServerFrame::Event(event)) => {
                tracing::debug!(
                    card_id = event.card_id.as_str(),
                    actor = event.actor_session_id.as_str(),
                    "Received remote change"
                );
                let _ = self.notices.send(ChannelNotice::Event(event));
            }
            Ok(ServerFrame::Connected { .. }) | Ok(ServerFrame::Pong) => {}
            Ok(ServerFrame::Unknown(frame_type)) => {
                tracing::debug!(frame_type = frame_type.as_str(), "Skipping unknown frame");
            }
            Err(e) => {
                tracing::warn!(error = %e, raw = text, "Skipping malformed realtime frame");
            }
        }
    }

    fn set_state(&self, state: ChannelState) {
        let previous = self.state_tx.send_replace(state.clone());
        if previous != state {
            let _ = self.notices.send(ChannelNotice::State(state));
        }
    }
}

async fn wait_for_ack<S>(read: &mut S) -> Result<()>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(message) = read.next().await {
        if let Message::Text(text) = message? {
            match parse_server_frame(&text) {
                Ok(ServerFrame::Connected { .. }) => return Ok(()),
                Ok(other) => tracing::debug!(frame = ?other, "Frame before handshake ack"),
                Err(e) => tracing::warn!(error = %e, "Malformed frame before handshake ack"),
            }
        }
    }
    Err(anyhow!("connection closed before handshake ack"))
}
