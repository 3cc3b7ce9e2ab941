use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;

use crate::api::dto::{ChangeStatusRequest, CreateLeadRequest, UpdateLeadRequest};
use crate::api::AppState;
use crate::domain::{Card, PipelineError, RemoteChangeEvent};
use crate::services::LeadService;
use crate::sync::SESSION_HEADER;

const SERVER_ACTOR: &str = "server";

/// Session that issued the request, echoed back in the change event so the
/// issuing client can recognise its own writes.
fn actor(headers: &HeaderMap) -> String {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(SERVER_ACTOR)
        .to_string()
}

pub async fn create_lead(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateLeadRequest>,
) -> Result<(StatusCode, Json<Card>), PipelineError> {
    let pool = state.require_db()?;
    let lead = LeadService::create_lead(pool, &state.stages, req).await?;
    state.publish(&RemoteChangeEvent::updated(&lead, &actor(&headers)));
    Ok((StatusCode::CREATED, Json(lead)))
}

pub async fn get_lead(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Card>, PipelineError> {
    let pool = state.require_db()?;
    Ok(Json(LeadService::get_lead(pool, &id).await?))
}

pub async fn update_lead(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<UpdateLeadRequest>,
) -> Result<Json<Card>, PipelineError> {
    let pool = state.require_db()?;
    let lead = LeadService::update_lead(pool, &id, req).await?;
    state.publish(&RemoteChangeEvent::updated(&lead, &actor(&headers)));
    Ok(Json(lead))
}

pub async fn change_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ChangeStatusRequest>,
) -> Result<Json<Card>, PipelineError> {
    let pool = state.require_db()?;
    let (lead, changed) = LeadService::change_stage(pool, &state.stages, &id, &req.stage).await?;
    if changed {
        state.publish(&RemoteChangeEvent::stage_changed(&lead, &actor(&headers)));
    }
    Ok(Json(lead))
}

pub async fn archive_lead(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, PipelineError> {
    let pool = state.require_db()?;
    let (lead, changed) = LeadService::archive_lead(pool, &id).await?;
    if changed {
        state.publish(&RemoteChangeEvent::archived(&lead, &actor(&headers)));
    }
    Ok(StatusCode::NO_CONTENT)
}
