mod common;

use axum::http::StatusCode;
use serde_json::{json, Value};

use pipeline_sync::domain::{Board, Card, RemoteChangeEvent, RemoteEventKind};

async fn create_lead(app: axum::Router, body: Value) -> Card {
    let (status, body) =
        common::make_request(app, "POST", "/api/leads", Some(body.to_string()), None).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    serde_json::from_str(&body).unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let app = common::test_app(common::test_state().await);

    let (status, body) = common::make_request(app, "GET", "/health", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("\"status\":\"ok\""));
}

#[tokio::test]
async fn test_create_and_get_lead() {
    let app = common::test_app(common::test_state().await);

    let lead = create_lead(
        app.clone(),
        json!({
            "title": "Garcia / Chen wedding",
            "estimateCents": 1_250_000,
            "location": "Napa",
            "eventDate": "2027-06-12"
        }),
    )
    .await;

    assert_eq!(lead.stage.as_str(), "INQUIRY");
    assert_eq!(lead.estimate_cents, 1_250_000);
    assert!(!lead.archived);

    let (status, body) =
        common::make_request(app, "GET", &format!("/api/leads/{}", lead.id), None, None).await;
    assert_eq!(status, StatusCode::OK);
    let fetched: Card = serde_json::from_str(&body).unwrap();
    assert_eq!(fetched, lead);
}

#[tokio::test]
async fn test_create_lead_with_unknown_stage_is_rejected() {
    let app = common::test_app(common::test_state().await);

    let (status, body) = common::make_request(
        app,
        "POST",
        "/api/leads",
        Some(json!({ "title": "Lead", "stage": "NEGOTIATING" }).to_string()),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["status"], 400);
    assert!(body["error"].as_str().unwrap().contains("NEGOTIATING"));
}

#[tokio::test]
async fn test_get_missing_lead_returns_404() {
    let app = common::test_app(common::test_state().await);

    let (status, _) = common::make_request(app, "GET", "/api/leads/nope", None, None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_board_groups_leads_by_stage() {
    let app = common::test_app(common::test_state().await);

    create_lead(app.clone(), json!({ "title": "A" })).await;
    create_lead(app.clone(), json!({ "title": "B", "stage": "BOOKED" })).await;
    create_lead(app.clone(), json!({ "title": "C", "stage": "BOOKED" })).await;

    let (status, body) = common::make_request(app, "GET", "/api/board", None, None).await;
    assert_eq!(status, StatusCode::OK);
    let board: Board = serde_json::from_str(&body).unwrap();

    let ids: Vec<&str> = board.columns.iter().map(|c| c.stage.id.as_str()).collect();
    assert_eq!(ids, vec!["INQUIRY", "PROPOSAL", "BOOKED", "COMPLETED"]);
    let counts: Vec<usize> = board.columns.iter().map(|c| c.cards.len()).collect();
    assert_eq!(counts, vec![1, 0, 2, 0]);
    let booked: Vec<&str> = board.columns[2].cards.iter().map(|c| c.title.as_str()).collect();
    assert_eq!(booked, vec!["B", "C"]);
}

#[tokio::test]
async fn test_board_filters() {
    let app = common::test_app(common::test_state().await);

    create_lead(
        app.clone(),
        json!({ "title": "Vineyard", "location": "Napa", "estimateCents": 900_000, "eventDate": "2027-05-01" }),
    )
    .await;
    create_lead(
        app.clone(),
        json!({ "title": "Beach", "location": "Malibu", "estimateCents": 300_000, "eventDate": "2027-08-20" }),
    )
    .await;
    create_lead(app.clone(), json!({ "title": "Courthouse" })).await;

    let fetch = |uri: &'static str| {
        let app = app.clone();
        async move {
            let (status, body) = common::make_request(app, "GET", uri, None, None).await;
            assert_eq!(status, StatusCode::OK, "{body}");
            let board: Board = serde_json::from_str(&body).unwrap();
            let mut titles: Vec<String> = board.cards().map(|c| c.title.clone()).collect();
            titles.sort();
            titles
        }
    };

    assert_eq!(fetch("/api/board?search=beach").await, vec!["Beach"]);
    assert_eq!(fetch("/api/board?locations=napa,malibu").await, vec!["Beach", "Vineyard"]);
    assert_eq!(fetch("/api/board?budget_min=500000").await, vec!["Vineyard"]);
    assert_eq!(fetch("/api/board?budget_max=500000").await, vec!["Beach", "Courthouse"]);
    assert_eq!(fetch("/api/board?date_from=2027-06-01").await, vec!["Beach"]);
    assert_eq!(
        fetch("/api/board?date_from=2027-01-01&date_to=2027-12-31").await,
        vec!["Beach", "Vineyard"]
    );
}

#[tokio::test]
async fn test_change_status_moves_lead_and_broadcasts() {
    let state = common::test_state().await;
    let mut events = state.events_tx.subscribe();
    let app = common::test_app(state);

    let lead = create_lead(app.clone(), json!({ "title": "Lead" })).await;
    // creation event
    events.recv().await.unwrap();

    let (status, body) = common::make_request(
        app,
        "POST",
        &format!("/api/leads/{}/status", lead.id),
        Some(json!({ "stage": "PROPOSAL" }).to_string()),
        Some("session-a"),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let moved: Card = serde_json::from_str(&body).unwrap();
    assert_eq!(moved.stage.as_str(), "PROPOSAL");
    assert!(moved.entered_stage_at > lead.entered_stage_at);

    let event: RemoteChangeEvent = serde_json::from_str(&events.recv().await.unwrap()).unwrap();
    assert_eq!(event.kind, RemoteEventKind::LeadStatusUpdated);
    assert_eq!(event.card_id, lead.id);
    assert_eq!(event.new_stage.as_ref().map(|s| s.as_str()), Some("PROPOSAL"));
    assert_eq!(event.actor_session_id, "session-a");
    assert_eq!(event.server_timestamp, moved.updated_at);
}

#[tokio::test]
async fn test_change_status_to_same_stage_is_silent() {
    let state = common::test_state().await;
    let mut events = state.events_tx.subscribe();
    let app = common::test_app(state);

    let lead = create_lead(app.clone(), json!({ "title": "Lead" })).await;
    events.recv().await.unwrap();

    let (status, body) = common::make_request(
        app,
        "POST",
        &format!("/api/leads/{}/status", lead.id),
        Some(json!({ "stage": "INQUIRY" }).to_string()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let same: Card = serde_json::from_str(&body).unwrap();
    assert_eq!(same.entered_stage_at, lead.entered_stage_at);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_change_status_rejects_unknown_stage() {
    let app = common::test_app(common::test_state().await);
    let lead = create_lead(app.clone(), json!({ "title": "Lead" })).await;

    let (status, _) = common::make_request(
        app,
        "POST",
        &format!("/api/leads/{}/status", lead.id),
        Some(json!({ "stage": "LOST" }).to_string()),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_archive_is_idempotent_and_hides_lead() {
    let state = common::test_state().await;
    let mut events = state.events_tx.subscribe();
    let app = common::test_app(state);

    let lead = create_lead(app.clone(), json!({ "title": "Lead" })).await;
    events.recv().await.unwrap();

    let uri = format!("/api/leads/{}/archive", lead.id);
    let (status, _) = common::make_request(app.clone(), "POST", &uri, None, Some("s1")).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let event: RemoteChangeEvent = serde_json::from_str(&events.recv().await.unwrap()).unwrap();
    assert_eq!(event.kind, RemoteEventKind::LeadArchived);
    assert!(event.archived);

    let (status, _) = common::make_request(app.clone(), "POST", &uri, None, Some("s1")).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(events.try_recv().is_err());

    let (_, body) = common::make_request(app.clone(), "GET", "/api/board", None, None).await;
    let board: Board = serde_json::from_str(&body).unwrap();
    assert!(board.is_empty());

    let (status, _) = common::make_request(
        app,
        "POST",
        &format!("/api/leads/{}/status", lead.id),
        Some(json!({ "stage": "BOOKED" }).to_string()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_update_lead_keeps_stage_entry_time() {
    let app = common::test_app(common::test_state().await);
    let lead = create_lead(
        app.clone(),
        json!({ "title": "Lead", "location": "Napa", "eventDate": "2027-06-12" }),
    )
    .await;

    let (status, body) = common::make_request(
        app,
        "PATCH",
        &format!("/api/leads/{}", lead.id),
        Some(json!({ "title": "Renamed", "location": "", "estimateCents": 42 }).to_string()),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    let updated: Card = serde_json::from_str(&body).unwrap();
    assert_eq!(updated.title, "Renamed");
    assert_eq!(updated.location, None);
    assert_eq!(updated.estimate_cents, 42);
    assert_eq!(updated.event_date, lead.event_date);
    assert_eq!(updated.stage, lead.stage);
    assert_eq!(updated.entered_stage_at, lead.entered_stage_at);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_stage_changes_keep_newest_write() {
    use pipeline_sync::api::dto::CreateLeadRequest;
    use pipeline_sync::infrastructure::db::init_db;
    use pipeline_sync::services::LeadService;

    let path = std::env::temp_dir().join(format!("pipeline-sync-{}.db", uuid::Uuid::new_v4()));
    let pool = init_db(&format!("sqlite:{}", path.display())).await.unwrap();
    let model = common::test_config().stage_model().unwrap();

    let lead = LeadService::create_lead(
        &pool,
        &model,
        CreateLeadRequest {
            title: "Okafor wedding".into(),
            stage: None,
            estimate_cents: None,
            assignee: None,
            location: None,
            event_date: None,
        },
    )
    .await
    .unwrap();

    let stages = ["PROPOSAL", "BOOKED", "COMPLETED"];
    let tasks: Vec<_> = (0..9)
        .map(|i| {
            let pool = pool.clone();
            let model = model.clone();
            let id = lead.id.clone();
            let stage = stages[i % stages.len()];
            tokio::spawn(async move { LeadService::change_stage(&pool, &model, &id, stage).await })
        })
        .collect();

    let mut written = Vec::new();
    for task in tasks {
        // Writers that lose the race on a stale read may fail; none may commit out of order.
        if let Ok((card, true)) = task.await.unwrap() {
            written.push(card);
        }
    }

    let newest = written
        .iter()
        .max_by_key(|card| card.updated_at)
        .expect("at least one write committed");
    let stored = LeadService::get_lead(&pool, &lead.id).await.unwrap();
    assert_eq!(stored.stage, newest.stage);
    assert_eq!(stored.updated_at, newest.updated_at);

    pool.close().await;
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
    }
}
