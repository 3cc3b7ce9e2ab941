#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tokio::sync::{broadcast, oneshot};
use tower::ServiceExt;

use pipeline_sync::api::{create_router, AppState};
use pipeline_sync::config::Config;
use pipeline_sync::domain::{Board, BoardFilters, Card, StageId, StageModel};
use pipeline_sync::sync::{
    BoardSource, BoardStore, CommandGateway, GatewayError, ReconciliationController,
    TransitionValidator,
};

/// Single-connection in-memory database with the real migrations applied.
pub async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create test database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

pub fn test_config() -> Arc<Config> {
    Arc::new(Config {
        port: 0,
        database_url: "sqlite::memory:".to_string(),
        cors_origin: "http://localhost:5173".to_string(),
        stages: vec![
            "INQUIRY".into(),
            "PROPOSAL".into(),
            "BOOKED".into(),
            "COMPLETED".into(),
        ],
    })
}

pub async fn test_state() -> AppState {
    let pool = setup_test_db().await;
    let (events_tx, _) = broadcast::channel(100);
    let config = test_config();
    let stages = config.stage_model().expect("valid stages");
    AppState::new(Some(pool), events_tx, Arc::new(stages), config)
}

pub fn test_app(state: AppState) -> Router {
    let config = Arc::clone(&state.config);
    create_router(state, &config)
}

/// Serves the app on an ephemeral local port.
pub async fn spawn_server(state: AppState) -> SocketAddr {
    let app = test_app(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("test server");
    });
    addr
}

pub async fn make_request(
    app: Router,
    method: &str,
    uri: &str,
    body: Option<String>,
    session_id: Option<&str>,
) -> (StatusCode, String) {
    let mut request = Request::builder().uri(uri).method(method);

    if body.is_some() {
        request = request.header("content-type", "application/json");
    }
    if let Some(session_id) = session_id {
        request = request.header("x-session-id", session_id);
    }

    let request = request
        .body(Body::from(body.unwrap_or_default()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body_str = String::from_utf8(body.to_vec()).unwrap();

    (status, body_str)
}

pub fn lead(id: &str, stage: &str, at: DateTime<Utc>) -> Card {
    let mut card = Card::new(id, format!("Lead {id}"), StageId::from(stage));
    card.entered_stage_at = at;
    card.updated_at = at;
    card
}

/// In-process stand-in for the board server: applies commands to its own
/// copy of the leads and can be told to hold, fail or back-date a reply.
#[derive(Default)]
pub struct FakeServer {
    pub model: StageModel,
    pub cards: Mutex<HashMap<String, Card>>,
    pub stage_calls: Mutex<Vec<(String, StageId)>>,
    pub archive_calls: Mutex<Vec<String>>,
    pub failure: Mutex<Option<GatewayError>>,
    pub fetch_failure: Mutex<Option<GatewayError>>,
    pub hold: Mutex<Option<oneshot::Receiver<()>>>,
    pub reply_at: Mutex<Option<DateTime<Utc>>>,
    pub last_filters: Mutex<Option<BoardFilters>>,
    pub fetches: AtomicUsize,
}

impl FakeServer {
    pub fn with_cards(cards: &[Card]) -> Self {
        let server = Self::default();
        server
            .cards
            .lock()
            .unwrap()
            .extend(cards.iter().map(|c| (c.id.clone(), c.clone())));
        server
    }

    /// Holds the next command until the returned sender fires or drops.
    pub fn hold_next(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.hold.lock().unwrap() = Some(rx);
        tx
    }

    pub fn fail_with(&self, err: GatewayError) {
        *self.failure.lock().unwrap() = Some(err);
    }

    pub fn reply_at(&self, at: DateTime<Utc>) {
        *self.reply_at.lock().unwrap() = Some(at);
    }

    /// A write made by some other session directly on the server.
    pub fn move_directly(&self, card_id: &str, stage: &str, at: DateTime<Utc>) -> Card {
        let mut cards = self.cards.lock().unwrap();
        let card = cards.get_mut(card_id).expect("known card");
        card.enter_stage(StageId::from(stage), at);
        card.updated_at = at;
        card.clone()
    }

    pub fn stage_call_count(&self) -> usize {
        self.stage_calls.lock().unwrap().len()
    }

    pub fn archive_call_count(&self) -> usize {
        self.archive_calls.lock().unwrap().len()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    async fn wait_for_release(&self) {
        let hold = self.hold.lock().unwrap().take();
        if let Some(hold) = hold {
            let _ = hold.await;
        }
    }

    fn take_failure(&self) -> Option<GatewayError> {
        self.failure.lock().unwrap().take()
    }
}

#[async_trait::async_trait]
impl CommandGateway for FakeServer {
    async fn send_stage_change(&self, card_id: &str, dest: &StageId) -> Result<Card, GatewayError> {
        self.stage_calls
            .lock()
            .unwrap()
            .push((card_id.to_string(), dest.clone()));
        self.wait_for_release().await;

        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let at = self.reply_at.lock().unwrap().take().unwrap_or_else(Utc::now);
        let mut cards = self.cards.lock().unwrap();
        let card = cards.get_mut(card_id).ok_or_else(|| GatewayError::Http {
            status: 404,
            message: format!("Lead not found: {card_id}"),
        })?;
        if card.enter_stage(dest.clone(), at) {
            card.updated_at = at;
        }
        Ok(card.clone())
    }

    async fn send_archive(&self, card_id: &str) -> Result<(), GatewayError> {
        self.archive_calls.lock().unwrap().push(card_id.to_string());
        self.wait_for_release().await;

        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let mut cards = self.cards.lock().unwrap();
        if let Some(card) = cards.get_mut(card_id) {
            if !card.archived {
                card.archived = true;
                card.updated_at = Utc::now();
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BoardSource for FakeServer {
    async fn fetch_board(&self, filters: &BoardFilters) -> Result<Board, GatewayError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        *self.last_filters.lock().unwrap() = Some(filters.clone());
        let failure = self.fetch_failure.lock().unwrap().take();
        if let Some(err) = failure {
            return Err(err);
        }
        let mut cards: Vec<Card> = self
            .cards
            .lock()
            .unwrap()
            .values()
            .filter(|c| filters.matches(c))
            .cloned()
            .collect();
        cards.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(Board::from_cards(&self.model, cards))
    }
}

/// Controller over a fresh store seeded with `cards`, backed by a
/// [`FakeServer`] holding the same cards.
pub fn controller_with(
    session_id: &str,
    cards: &[Card],
) -> (Arc<ReconciliationController>, Arc<FakeServer>) {
    let server = Arc::new(FakeServer::with_cards(cards));
    let model = StageModel::wedding_pipeline();
    let store = Arc::new(BoardStore::new(Board::from_cards(&model, cards.to_vec())));
    let controller = Arc::new(ReconciliationController::new(
        session_id,
        store,
        TransitionValidator::new(model),
        server.clone(),
        server.clone(),
    )
    .with_resync_backoff(Duration::from_millis(10), Duration::from_millis(50)));
    (controller, server)
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub async fn recv_within<T: Clone>(rx: &mut broadcast::Receiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("nothing received in time")
        .expect("channel closed")
}
