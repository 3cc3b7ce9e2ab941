use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::domain::{Board, Card, StageId};

/// Per-session copy of the board.
///
/// The store is the single writer of board state: every mutation goes through
/// one of its methods and each one publishes the new snapshot to subscribers
/// before returning.
#[derive(Debug)]
pub struct BoardStore {
    tx: watch::Sender<Board>,
}

impl BoardStore {
    pub fn new(board: Board) -> Self {
        let (tx, _rx) = watch::channel(board);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Board> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> Board {
        self.tx.borrow().clone()
    }

    pub fn card(&self, card_id: &str) -> Option<Card> {
        self.tx.borrow().card(card_id).cloned()
    }

    pub fn stage_of(&self, card_id: &str) -> Option<StageId> {
        self.tx.borrow().stage_of(card_id).cloned()
    }

    pub fn replace(&self, board: Board) {
        self.tx.send_replace(board);
    }

    /// Moves the card to the end of `dest` and returns the stage it left.
    /// Unknown cards and unknown destinations leave the board untouched.
    pub fn move_card_locally(&self, card_id: &str, dest: &StageId) -> Option<StageId> {
        self.move_card_at(card_id, dest, Utc::now())
    }

    /// Same as [`move_card_locally`](Self::move_card_locally) with an explicit
    /// stage-entry time, used when replaying a server-stamped change.
    pub fn move_card_at(
        &self,
        card_id: &str,
        dest: &StageId,
        at: DateTime<Utc>,
    ) -> Option<StageId> {
        let mut previous = None;
        self.tx.send_if_modified(|board| {
            if board.column(dest).is_none() {
                return false;
            }
            let Some(current) = board.stage_of(card_id).cloned() else {
                return false;
            };
            previous = Some(current.clone());
            if &current == dest {
                return false;
            }
            let Some(mut card) = board.take_card(card_id) else {
                return false;
            };
            card.enter_stage(dest.clone(), at);
            board.push_card(card)
        });

        if previous.is_none() {
            tracing::debug!(card_id, dest = dest.as_str(), "Ignoring local move: unknown card or stage");
        }
        previous
    }

    pub fn archive_locally(&self, card_id: &str) -> bool {
        self.tx
            .send_if_modified(|board| board.take_card(card_id).is_some())
    }

    /// Reconciles one card to an authoritative value: updated in place when
    /// its stage is unchanged, moved otherwise, removed when archived.
    pub fn upsert_card(&self, card: Card) -> bool {
        self.tx.send_if_modified(|board| {
            if card.archived {
                return board.take_card(&card.id).is_some();
            }
            if board.column(&card.stage).is_none() {
                tracing::warn!(
                    card_id = card.id.as_str(),
                    stage = card.stage.as_str(),
                    "Ignoring card for a stage outside the board"
                );
                return false;
            }
            if let Some(existing) = board.card_mut(&card.id) {
                if existing.stage == card.stage {
                    if *existing == card {
                        return false;
                    }
                    *existing = card;
                    return true;
                }
            }
            board.take_card(&card.id);
            board.push_card(card)
        })
    }

    /// Puts a previously captured copy of a card back, undoing an optimistic
    /// move or archive.
    pub fn restore_card(&self, card: Card) -> bool {
        self.upsert_card(card)
    }
}
