use axum::extract::{Query, State};
use axum::Json;

use crate::api::AppState;
use crate::domain::{Board, BoardQuery, PipelineError};
use crate::services::LeadService;

pub async fn get_board(
    State(state): State<AppState>,
    Query(query): Query<BoardQuery>,
) -> Result<Json<Board>, PipelineError> {
    let pool = state.require_db()?;
    let filters = query.into_filters();
    let board = LeadService::get_board(pool, &state.stages, &filters).await?;
    Ok(Json(board))
}
