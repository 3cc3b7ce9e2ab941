//! Connects a sync session to a board server and logs what it sees.

use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_stream::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pipeline_sync::config::ClientConfig;
use pipeline_sync::domain::Board;
use pipeline_sync::sync::SyncSession;

fn summarize(board: &Board) -> String {
    board
        .columns
        .iter()
        .map(|c| format!("{}={}", c.stage.id, c.cards.len()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,pipeline_sync=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ClientConfig::from_env()?;
    tracing::info!(
        api_url = config.api_url.as_str(),
        ws_url = config.ws_url.as_str(),
        session_id = config.session_id.as_str(),
        "Connecting"
    );

    let session = SyncSession::connect(config).await?;

    let mut boards = WatchStream::new(session.store().subscribe());
    let mut stale = WatchStream::new(session.controller().watch_stale());
    let mut notices = BroadcastStream::new(session.controller().notices());

    loop {
        tokio::select! {
            Some(board) = boards.next() => {
                tracing::info!(cards = board.len(), columns = summarize(&board).as_str(), "Board");
            }
            Some(is_stale) = stale.next() => {
                if is_stale {
                    tracing::warn!("Live updates unavailable, board may be stale");
                } else {
                    tracing::info!("Live updates active");
                }
            }
            Some(notice) = notices.next() => match notice {
                Ok(notice) => tracing::info!(?notice, "Notice"),
                Err(e) => tracing::warn!("Missed notices: {}", e),
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    session.shutdown();
    Ok(())
}
