use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{Row, SqliteExecutor, SqlitePool};
use uuid::Uuid;

use crate::api::dto::{CreateLeadRequest, UpdateLeadRequest};
use crate::domain::{Board, BoardFilters, Card, PipelineError, StageId, StageModel};

/// Storage row for a lead; timestamps are kept as RFC 3339 text.
#[derive(Debug, sqlx::FromRow)]
struct LeadRow {
    id: String,
    title: String,
    stage: String,
    estimate_cents: i64,
    entered_stage_at: String,
    assignee: Option<String>,
    archived: bool,
    location: Option<String>,
    event_date: Option<String>,
    updated_at: String,
}

impl LeadRow {
    fn into_card(self) -> Result<Card, PipelineError> {
        let event_date = self
            .event_date
            .as_deref()
            .map(|d| {
                NaiveDate::parse_from_str(d, "%Y-%m-%d")
                    .map_err(|e| PipelineError::Internal(format!("bad event_date {d}: {e}")))
            })
            .transpose()?;

        Ok(Card {
            entered_stage_at: parse_timestamp(&self.entered_stage_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            id: self.id,
            title: self.title,
            stage: StageId::new(self.stage),
            estimate_cents: self.estimate_cents,
            assignee: self.assignee,
            archived: self.archived,
            location: self.location,
            event_date,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, PipelineError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PipelineError::Internal(format!("bad timestamp {value}: {e}")))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

const LEAD_COLUMNS: &str = "id, title, stage, estimate_cents, entered_stage_at, assignee, archived, location, event_date, updated_at";

pub struct LeadService;

impl LeadService {
    pub async fn create_lead(
        pool: &SqlitePool,
        model: &StageModel,
        req: CreateLeadRequest,
    ) -> Result<Card, PipelineError> {
        let title = req.title.trim().to_string();
        if title.is_empty() {
            return Err(PipelineError::BadRequest("Lead title is required".into()));
        }

        let stage = match req.stage {
            Some(stage) => Self::validate_stage(model, &stage)?,
            None => model.first().id.clone(),
        };

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let position = Self::next_position(pool, &stage).await?;

        sqlx::query(
            "INSERT INTO leads (id, title, stage, estimate_cents, entered_stage_at, assignee, archived, location, event_date, position, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&title)
        .bind(stage.as_str())
        .bind(req.estimate_cents.unwrap_or(0))
        .bind(&now)
        .bind(non_empty(req.assignee))
        .bind(non_empty(req.location))
        .bind(req.event_date.map(|d| d.format("%Y-%m-%d").to_string()))
        .bind(position)
        .bind(&now)
        .bind(&now)
        .execute(pool)
        .await?;

        tracing::info!(lead_id = id.as_str(), stage = stage.as_str(), "Lead created");
        Self::get_lead(pool, &id).await
    }

    pub async fn get_lead(pool: &SqlitePool, id: &str) -> Result<Card, PipelineError> {
        Self::fetch_lead(pool, id).await
    }

    async fn fetch_lead<'e, E>(executor: E, id: &str) -> Result<Card, PipelineError>
    where
        E: SqliteExecutor<'e>,
    {
        let row: LeadRow = sqlx::query_as(&format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?"))
            .bind(id)
            .fetch_optional(executor)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("Lead not found: {}", id)))?;

        row.into_card()
    }

    /// Active (non-archived) leads matching `filters`, in board order.
    pub async fn list_leads(
        pool: &SqlitePool,
        filters: &BoardFilters,
    ) -> Result<Vec<Card>, PipelineError> {
        let rows: Vec<LeadRow> = sqlx::query_as(&format!(
            "SELECT {LEAD_COLUMNS} FROM leads WHERE archived = 0 ORDER BY position ASC, created_at ASC"
        ))
        .fetch_all(pool)
        .await?;

        let mut leads = Vec::with_capacity(rows.len());
        for row in rows {
            let card = row.into_card()?;
            if filters.matches(&card) {
                leads.push(card);
            }
        }
        Ok(leads)
    }

    pub async fn get_board(
        pool: &SqlitePool,
        model: &StageModel,
        filters: &BoardFilters,
    ) -> Result<Board, PipelineError> {
        let leads = Self::list_leads(pool, filters).await?;
        Ok(Board::from_cards(model, leads))
    }

    /// Moves a lead to `stage`. Returns the stored lead and whether anything
    /// changed; `entered_stage_at` is only restamped on an actual stage change.
    ///
    /// The read and the update share one transaction and the timestamp is
    /// taken after the read, so a later commit never carries an older stamp.
    /// A writer whose read went stale fails instead of committing.
    pub async fn change_stage(
        pool: &SqlitePool,
        model: &StageModel,
        id: &str,
        stage: &str,
    ) -> Result<(Card, bool), PipelineError> {
        let stage = Self::validate_stage(model, stage)?;
        let mut tx = pool.begin().await?;
        let current = Self::fetch_lead(&mut *tx, id).await?;

        if current.archived {
            return Err(PipelineError::BadRequest(format!(
                "Lead {} is archived",
                id
            )));
        }
        if current.stage == stage {
            return Ok((current, false));
        }

        let now = Utc::now().to_rfc3339();
        let position = Self::next_position(&mut *tx, &stage).await?;

        sqlx::query(
            "UPDATE leads SET stage = ?, entered_stage_at = ?, position = ?, updated_at = ? WHERE id = ?",
        )
        .bind(stage.as_str())
        .bind(&now)
        .bind(position)
        .bind(&now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let updated = Self::fetch_lead(&mut *tx, id).await?;
        tx.commit().await?;

        tracing::info!(
            lead_id = id,
            from = current.stage.as_str(),
            to = stage.as_str(),
            "Lead stage changed"
        );
        Ok((updated, true))
    }

    /// Archives a lead. Archiving an already archived lead succeeds without
    /// writing.
    pub async fn archive_lead(pool: &SqlitePool, id: &str) -> Result<(Card, bool), PipelineError> {
        let mut tx = pool.begin().await?;
        let current = Self::fetch_lead(&mut *tx, id).await?;
        if current.archived {
            return Ok((current, false));
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE leads SET archived = 1, updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let archived = Self::fetch_lead(&mut *tx, id).await?;
        tx.commit().await?;

        tracing::info!(lead_id = id, "Lead archived");
        Ok((archived, true))
    }

    pub async fn update_lead(
        pool: &SqlitePool,
        id: &str,
        req: UpdateLeadRequest,
    ) -> Result<Card, PipelineError> {
        let mut tx = pool.begin().await?;
        let current = Self::fetch_lead(&mut *tx, id).await?;

        let title = match req.title {
            Some(title) if title.trim().is_empty() => {
                return Err(PipelineError::BadRequest("Lead title cannot be empty".into()))
            }
            Some(title) => title.trim().to_string(),
            None => current.title,
        };
        let estimate_cents = req.estimate_cents.unwrap_or(current.estimate_cents);
        let assignee = match req.assignee {
            Some(a) => non_empty(Some(a)),
            None => current.assignee,
        };
        let location = match req.location {
            Some(l) => non_empty(Some(l)),
            None => current.location,
        };
        let event_date = match req.event_date {
            Some(d) => match non_empty(Some(d)) {
                Some(d) => Some(NaiveDate::parse_from_str(&d, "%Y-%m-%d").map_err(|_| {
                    PipelineError::BadRequest(format!("Invalid event date: {}", d))
                })?),
                None => None,
            },
            None => current.event_date,
        };

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE leads SET title = ?, estimate_cents = ?, assignee = ?, location = ?, event_date = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&title)
        .bind(estimate_cents)
        .bind(&assignee)
        .bind(&location)
        .bind(event_date.map(|d| d.format("%Y-%m-%d").to_string()))
        .bind(&now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let updated = Self::fetch_lead(&mut *tx, id).await?;
        tx.commit().await?;
        Ok(updated)
    }

    fn validate_stage(model: &StageModel, stage: &str) -> Result<StageId, PipelineError> {
        let stage = StageId::from(stage.trim());
        if !model.contains(&stage) {
            return Err(PipelineError::BadRequest(model.unknown_stage_error(&stage)));
        }
        Ok(stage)
    }

    // New and moved leads go to the end of their column.
    async fn next_position<'e, E>(executor: E, stage: &StageId) -> Result<i64, PipelineError>
    where
        E: SqliteExecutor<'e>,
    {
        let row = sqlx::query("SELECT COALESCE(MAX(position), 0) as max_pos FROM leads WHERE stage = ?")
            .bind(stage.as_str())
            .fetch_one(executor)
            .await?;
        let max_pos: i64 = row.get("max_pos");
        Ok(max_pos + 1000)
    }
}
