use std::collections::HashSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::{Card, PipelineError, Stage, StageId, StageModel};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub stage: Stage,
    pub cards: Vec<Card>,
}

/// Ordered (stage, cards) pairs. Card order inside a column is display order
/// only.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Board {
    pub columns: Vec<Column>,
}

impl Board {
    pub fn empty(model: &StageModel) -> Self {
        Self {
            columns: model
                .all()
                .iter()
                .map(|stage| Column {
                    stage: stage.clone(),
                    cards: Vec::new(),
                })
                .collect(),
        }
    }

    /// Groups cards into columns. Archived cards and cards whose stage is not
    /// part of the model are left out.
    pub fn from_cards(model: &StageModel, cards: impl IntoIterator<Item = Card>) -> Self {
        let mut board = Self::empty(model);
        for card in cards {
            if card.archived {
                continue;
            }
            let card_id = card.id.clone();
            if !board.push_card(card) {
                tracing::warn!(card_id = card_id.as_str(), "Dropping card with unknown stage");
            }
        }
        board
    }

    pub fn stage_model(&self) -> Result<StageModel, PipelineError> {
        StageModel::new(self.columns.iter().map(|c| c.stage.clone()).collect())
    }

    pub fn column(&self, stage: &StageId) -> Option<&Column> {
        self.columns.iter().find(|c| &c.stage.id == stage)
    }

    pub fn cards(&self) -> impl Iterator<Item = &Card> {
        self.columns.iter().flat_map(|c| c.cards.iter())
    }

    pub fn card(&self, card_id: &str) -> Option<&Card> {
        self.cards().find(|c| c.id == card_id)
    }

    pub fn stage_of(&self, card_id: &str) -> Option<&StageId> {
        self.columns
            .iter()
            .find(|c| c.cards.iter().any(|card| card.id == card_id))
            .map(|c| &c.stage.id)
    }

    pub fn len(&self) -> usize {
        self.columns.iter().map(|c| c.cards.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when no card id appears in more than one place.
    pub fn is_exclusive(&self) -> bool {
        let mut seen = HashSet::new();
        self.cards().all(|card| seen.insert(card.id.as_str()))
    }

    pub(crate) fn take_card(&mut self, card_id: &str) -> Option<Card> {
        for column in &mut self.columns {
            if let Some(index) = column.cards.iter().position(|c| c.id == card_id) {
                return Some(column.cards.remove(index));
            }
        }
        None
    }

    /// Appends the card to the column named by `card.stage`.
    pub(crate) fn push_card(&mut self, card: Card) -> bool {
        match self.columns.iter_mut().find(|c| c.stage.id == card.stage) {
            Some(column) => {
                column.cards.push(card);
                true
            }
            None => false,
        }
    }

    pub(crate) fn card_mut(&mut self, card_id: &str) -> Option<&mut Card> {
        self.columns
            .iter_mut()
            .flat_map(|c| c.cards.iter_mut())
            .find(|c| c.id == card_id)
    }
}

/// Filter set applied to a board fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoardFilters {
    pub search: Option<String>,
    pub locations: Vec<String>,
    pub budget_min: Option<i64>,
    pub budget_max: Option<i64>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl BoardFilters {
    /// True when no filter narrows the board.
    pub fn is_empty(&self) -> bool {
        self.search.as_deref().map_or(true, |s| s.trim().is_empty())
            && self.locations.is_empty()
            && self.budget_min.is_none()
            && self.budget_max.is_none()
            && self.date_from.is_none()
            && self.date_to.is_none()
    }

    pub fn to_query(&self) -> BoardQuery {
        BoardQuery {
            search: self.search.clone(),
            locations: if self.locations.is_empty() {
                None
            } else {
                Some(self.locations.join(","))
            },
            budget_min: self.budget_min,
            budget_max: self.budget_max,
            date_from: self.date_from,
            date_to: self.date_to,
        }
    }

    pub fn matches(&self, card: &Card) -> bool {
        if let Some(search) = self.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            let needle = search.to_lowercase();
            let in_title = card.title.to_lowercase().contains(&needle);
            let in_location = card
                .location
                .as_deref()
                .is_some_and(|l| l.to_lowercase().contains(&needle));
            if !in_title && !in_location {
                return false;
            }
        }

        if !self.locations.is_empty() {
            let Some(location) = card.location.as_deref() else {
                return false;
            };
            if !self.locations.iter().any(|l| l.eq_ignore_ascii_case(location)) {
                return false;
            }
        }

        if self.budget_min.is_some_and(|min| card.estimate_cents < min) {
            return false;
        }
        if self.budget_max.is_some_and(|max| card.estimate_cents > max) {
            return false;
        }

        if self.date_from.is_some() || self.date_to.is_some() {
            let Some(date) = card.event_date else {
                return false;
            };
            if self.date_from.is_some_and(|from| date < from) {
                return false;
            }
            if self.date_to.is_some_and(|to| date > to) {
                return false;
            }
        }

        true
    }
}

/// Flat, URL-encodable form of [`BoardFilters`]; locations are comma separated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BoardQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_min: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_max: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_from: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_to: Option<NaiveDate>,
}

impl BoardQuery {
    pub fn into_filters(self) -> BoardFilters {
        BoardFilters {
            search: self.search,
            locations: self
                .locations
                .map(|l| {
                    l.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            budget_min: self.budget_min,
            budget_max: self.budget_max,
            date_from: self.date_from,
            date_to: self.date_to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lead(id: &str, stage: &str) -> Card {
        Card::new(id, format!("Lead {id}"), StageId::from(stage))
    }

    #[test]
    fn from_cards_groups_by_stage_and_skips_archived() {
        let model = StageModel::wedding_pipeline();
        let mut archived = lead("lead-3", "BOOKED");
        archived.archived = true;

        let board = Board::from_cards(
            &model,
            vec![lead("lead-1", "INQUIRY"), lead("lead-2", "BOOKED"), archived, lead("lead-4", "LOST")],
        );

        assert_eq!(board.columns.len(), 4);
        assert_eq!(board.len(), 2);
        assert_eq!(board.stage_of("lead-2").map(StageId::as_str), Some("BOOKED"));
        assert!(board.card("lead-3").is_none());
        assert!(board.card("lead-4").is_none());
        assert!(board.is_exclusive());
    }

    #[test]
    fn filters_round_trip_through_query() {
        let filters = BoardFilters {
            search: Some("smith".into()),
            locations: vec!["Napa".into(), "Sonoma".into()],
            budget_min: Some(100_000),
            ..Default::default()
        };
        let query = filters.to_query();
        assert_eq!(query.locations.as_deref(), Some("Napa,Sonoma"));
        assert_eq!(query.into_filters(), filters);
    }

    #[test]
    fn filters_match_budget_location_and_dates() {
        let mut card = lead("lead-1", "INQUIRY");
        card.title = "Smith & Jones".into();
        card.location = Some("Napa".into());
        card.estimate_cents = 250_000;
        card.event_date = NaiveDate::from_ymd_opt(2027, 6, 12);

        let mut filters = BoardFilters {
            search: Some("jones".into()),
            locations: vec!["napa".into()],
            budget_min: Some(200_000),
            budget_max: Some(300_000),
            date_from: NaiveDate::from_ymd_opt(2027, 1, 1),
            date_to: NaiveDate::from_ymd_opt(2027, 12, 31),
        };
        assert!(filters.matches(&card));

        filters.budget_max = Some(100_000);
        assert!(!filters.matches(&card));

        filters.budget_max = None;
        filters.locations = vec!["Sonoma".into()];
        assert!(!filters.matches(&card));
    }

    #[test]
    fn blank_search_does_not_count_as_a_filter() {
        let mut filters = BoardFilters::default();
        assert!(filters.is_empty());

        filters.search = Some("  ".into());
        assert!(filters.is_empty());

        filters.budget_min = Some(100_000);
        assert!(!filters.is_empty());
    }
}
