use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::PipelineError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(String);

impl StageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl FromStr for StageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err("Invalid stage: empty id".into());
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// One column of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub id: StageId,
    pub label: String,
    pub rank: u32,
    #[serde(default)]
    pub hidden: bool,
}

impl Stage {
    pub fn new(id: impl Into<String>, label: impl Into<String>, rank: u32) -> Self {
        Self {
            id: StageId::new(id),
            label: label.into(),
            rank,
            hidden: false,
        }
    }
}

/// The fixed, ranked set of stages a board session works with.
///
/// Ranks are unique and contiguous starting at zero. Hidden stages keep their
/// rank; hiding only affects which columns are rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageModel {
    stages: Vec<Stage>,
}

impl StageModel {
    pub fn new(mut stages: Vec<Stage>) -> Result<Self, PipelineError> {
        if stages.is_empty() {
            return Err(PipelineError::InvalidStageModel(
                "a pipeline needs at least one stage".into(),
            ));
        }

        stages.sort_by_key(|s| s.rank);

        let mut seen = HashSet::new();
        for (expected, stage) in stages.iter().enumerate() {
            if !seen.insert(stage.id.clone()) {
                return Err(PipelineError::InvalidStageModel(format!(
                    "duplicate stage id: {}",
                    stage.id
                )));
            }
            if stage.rank as usize != expected {
                return Err(PipelineError::InvalidStageModel(format!(
                    "stage {} has rank {}, expected {} (ranks must be unique and contiguous)",
                    stage.id, stage.rank, expected
                )));
            }
        }

        Ok(Self { stages })
    }

    /// Builds a model from an ordered list of ids; rank follows list position.
    pub fn from_ids<S: AsRef<str>>(ids: &[S]) -> Result<Self, PipelineError> {
        let stages = ids
            .iter()
            .enumerate()
            .map(|(rank, id)| {
                let id = id.as_ref().trim();
                Stage::new(id, display_label(id), rank as u32)
            })
            .collect();
        Self::new(stages)
    }

    pub fn wedding_pipeline() -> Self {
        Self {
            stages: vec![
                Stage::new("INQUIRY", "Inquiry", 0),
                Stage::new("PROPOSAL", "Proposal", 1),
                Stage::new("BOOKED", "Booked", 2),
                Stage::new("COMPLETED", "Completed", 3),
            ],
        }
    }

    pub fn all(&self) -> &[Stage] {
        &self.stages
    }

    pub fn visible(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter().filter(|s| !s.hidden)
    }

    pub fn get(&self, id: &StageId) -> Option<&Stage> {
        self.stages.iter().find(|s| &s.id == id)
    }

    pub fn contains(&self, id: &StageId) -> bool {
        self.get(id).is_some()
    }

    pub fn rank(&self, id: &StageId) -> Option<u32> {
        self.get(id).map(|s| s.rank)
    }

    pub fn first(&self) -> &Stage {
        &self.stages[0]
    }

    pub fn is_forward(&self, from: &StageId, to: &StageId) -> bool {
        matches!((self.rank(from), self.rank(to)), (Some(a), Some(b)) if b > a)
    }

    pub fn set_hidden(&mut self, id: &StageId, hidden: bool) -> bool {
        match self.stages.iter_mut().find(|s| &s.id == id) {
            Some(stage) => {
                stage.hidden = hidden;
                true
            }
            None => false,
        }
    }

    pub fn unknown_stage_error(&self, id: &StageId) -> String {
        let known: Vec<&str> = self.stages.iter().map(|s| s.id.as_str()).collect();
        format!("Invalid stage: {}. Known stages: {}", id, known.join(", "))
    }
}

impl Default for StageModel {
    fn default() -> Self {
        Self::wedding_pipeline()
    }
}

fn display_label(id: &str) -> String {
    id.split(['_', '-'])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let lower = part.to_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}
