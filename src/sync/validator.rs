use std::fmt;

use crate::domain::{MoveIntent, StageModel};

use super::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Forward,
    Backward,
    Lateral,
}

impl Transition {
    /// Walking a lead back down the pipeline needs an explicit decision.
    pub fn requires_confirmation(self) -> bool {
        matches!(self, Transition::Backward)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Forward => "forward",
            Transition::Backward => "backward",
            Transition::Lateral => "lateral",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct TransitionValidator {
    model: StageModel,
}

impl TransitionValidator {
    pub fn new(model: StageModel) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &StageModel {
        &self.model
    }

    pub fn classify(&self, intent: &MoveIntent) -> Result<Transition, SyncError> {
        let from = self
            .model
            .rank(&intent.from)
            .ok_or_else(|| SyncError::UnknownStage(intent.from.clone()))?;
        let to = self
            .model
            .rank(&intent.to)
            .ok_or_else(|| SyncError::UnknownStage(intent.to.clone()))?;

        Ok(match to.cmp(&from) {
            std::cmp::Ordering::Greater => Transition::Forward,
            std::cmp::Ordering::Less => Transition::Backward,
            std::cmp::Ordering::Equal => Transition::Lateral,
        })
    }
}
