use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::StageId;

/// A wedding-planning lead as it sits on the pipeline board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub id: String,
    pub title: String,
    pub stage: StageId,
    /// Estimated booking value in minor currency units.
    pub estimate_cents: i64,
    pub entered_stage_at: DateTime<Utc>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub event_date: Option<NaiveDate>,
    pub updated_at: DateTime<Utc>,
}

impl Card {
    pub fn new(id: impl Into<String>, title: impl Into<String>, stage: StageId) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            stage,
            estimate_cents: 0,
            entered_stage_at: now,
            assignee: None,
            archived: false,
            location: None,
            event_date: None,
            updated_at: now,
        }
    }

    /// Moves the card to `stage`, stamping `entered_stage_at` only when the
    /// stage actually changes.
    pub fn enter_stage(&mut self, stage: StageId, at: DateTime<Utc>) -> bool {
        if self.stage == stage {
            return false;
        }
        self.stage = stage;
        self.entered_stage_at = at;
        true
    }
}

/// A requested, not yet applied, stage change for one card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveIntent {
    pub card_id: String,
    pub from: StageId,
    pub to: StageId,
    pub initiated_at: DateTime<Utc>,
}

impl MoveIntent {
    /// Returns `None` for a same-stage move, which is a no-op.
    pub fn new(card_id: impl Into<String>, from: StageId, to: StageId) -> Option<Self> {
        if from == to {
            return None;
        }
        Some(Self {
            card_id: card_id.into(),
            from,
            to,
            initiated_at: Utc::now(),
        })
    }
}
