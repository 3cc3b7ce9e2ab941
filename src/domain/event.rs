use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Card, StageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteEventKind {
    LeadUpdated,
    LeadStatusUpdated,
    LeadArchived,
}

/// Server-pushed notification that a lead's stage or archived flag changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChangeEvent {
    #[serde(rename = "type")]
    pub kind: RemoteEventKind,
    pub card_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_stage: Option<StageId>,
    #[serde(default)]
    pub archived: bool,
    pub actor_session_id: String,
    pub server_timestamp: DateTime<Utc>,
    /// Full snapshot, sent with `lead-updated` when the lead was created or
    /// edited outside a stage change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead: Option<Card>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteChange {
    Stage(StageId),
    Archived,
}

impl RemoteChangeEvent {
    pub fn stage_changed(card: &Card, actor_session_id: &str) -> Self {
        Self {
            kind: RemoteEventKind::LeadStatusUpdated,
            card_id: card.id.clone(),
            new_stage: Some(card.stage.clone()),
            archived: false,
            actor_session_id: actor_session_id.to_string(),
            server_timestamp: card.updated_at,
            lead: None,
        }
    }

    pub fn archived(card: &Card, actor_session_id: &str) -> Self {
        Self {
            kind: RemoteEventKind::LeadArchived,
            card_id: card.id.clone(),
            new_stage: None,
            archived: true,
            actor_session_id: actor_session_id.to_string(),
            server_timestamp: card.updated_at,
            lead: None,
        }
    }

    pub fn updated(card: &Card, actor_session_id: &str) -> Self {
        Self {
            kind: RemoteEventKind::LeadUpdated,
            card_id: card.id.clone(),
            new_stage: Some(card.stage.clone()),
            archived: card.archived,
            actor_session_id: actor_session_id.to_string(),
            server_timestamp: card.updated_at,
            lead: Some(card.clone()),
        }
    }

    pub fn change(&self) -> Option<RemoteChange> {
        if self.archived || self.kind == RemoteEventKind::LeadArchived {
            return Some(RemoteChange::Archived);
        }
        self.new_stage.clone().map(RemoteChange::Stage)
    }
}
