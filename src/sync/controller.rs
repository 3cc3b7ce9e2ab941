//! Per-card reconciliation of optimistic moves, command results and remote
//! change events.
//!
//! Each card is either idle, waiting for the user to confirm a backward move,
//! or applying a command. Every store mutation made here happens while the
//! ledger lock is held and the lock is never held across an `.await`, so local
//! moves, gateway results and remote events are applied one at a time in the
//! order they reach the controller.
//!
//! Conflicts are settled by last-write-wins on the server timestamp: the
//! ledger remembers the newest authoritative write seen for every card, and
//! anything older than that is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};

use crate::domain::{Board, BoardFilters, Card, MoveIntent, RemoteChange, RemoteChangeEvent, StageId};

use super::channel::{backoff_delay, ChannelNotice, ChannelState};
use super::{BoardSource, BoardStore, CommandGateway, SyncError, TransitionValidator};

const NOTICE_CAPACITY: usize = 64;
const RESYNC_RETRY_INITIAL: Duration = Duration::from_secs(1);
const RESYNC_RETRY_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardPhase {
    Idle,
    PendingConfirmation,
    Applying,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MoveOutcome {
    /// Destination equals the current stage; nothing was sent.
    NoOp,
    /// Backward move parked until [`ReconciliationController::confirm`] or
    /// [`ReconciliationController::cancel`].
    ConfirmationRequired(MoveIntent),
    /// The server accepted the move and the store holds its card.
    Applied(Card),
    /// The server accepted the move, but a newer write from another session
    /// already replaced it on the board.
    Superseded(Card),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    Applied,
    /// Echo of this session's own command.
    Redundant,
    /// Older than the newest write already seen for the card.
    Stale,
    NoChange,
    /// The event names a card this session does not hold; refetch the board.
    NeedsResync,
}

/// Transient, user-visible notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotice {
    MoveFailed { card_id: String, message: String },
    ArchiveFailed { card_id: String, message: String },
    ConfirmationSuperseded { intent: MoveIntent },
    LiveUpdatesUnavailable,
    LiveUpdatesRestored,
    Resynced { cards: usize },
    ResyncFailed { message: String },
}

#[derive(Debug, Clone)]
enum PendingCommand {
    StageChange(MoveIntent),
    Archive,
}

#[derive(Debug, Clone)]
enum PendingOp {
    Confirmation(MoveIntent),
    Applying {
        command: PendingCommand,
        prior: Card,
        /// Set once an authoritative value replaced the optimistic one; a
        /// failed command must not roll back over it.
        superseded: bool,
    },
}

#[derive(Debug, Default)]
struct Ledger {
    ops: HashMap<String, PendingOp>,
    authoritative: HashMap<String, DateTime<Utc>>,
}

impl Ledger {
    fn last_write(&self, card_id: &str) -> Option<DateTime<Utc>> {
        self.authoritative.get(card_id).copied()
    }

    fn record(&mut self, card_id: &str, at: DateTime<Utc>) {
        let entry = self.authoritative.entry(card_id.to_string()).or_insert(at);
        if at > *entry {
            *entry = at;
        }
    }

    /// Drops recorded writes for cards that are neither on `board` nor
    /// waiting on a command.
    fn forget_absent(&mut self, board: &Board) {
        let ops = &self.ops;
        self.authoritative
            .retain(|card_id, _| ops.contains_key(card_id) || board.card(card_id).is_some());
    }

    fn mark_superseded(&mut self, card_id: &str) -> Option<MoveIntent> {
        if let Some(PendingOp::Applying { superseded, .. }) = self.ops.get_mut(card_id) {
            *superseded = true;
            return None;
        }
        match self.ops.remove(card_id) {
            Some(PendingOp::Confirmation(intent)) => Some(intent),
            Some(other) => {
                self.ops.insert(card_id.to_string(), other);
                None
            }
            None => None,
        }
    }
}

pub struct ReconciliationController {
    session_id: String,
    store: Arc<BoardStore>,
    validator: TransitionValidator,
    gateway: Arc<dyn CommandGateway>,
    source: Arc<dyn BoardSource>,
    filters: Mutex<BoardFilters>,
    ledger: Mutex<Ledger>,
    stale: watch::Sender<bool>,
    notices: broadcast::Sender<SyncNotice>,
    resync_retry: (Duration, Duration),
}

impl ReconciliationController {
    pub fn new(
        session_id: impl Into<String>,
        store: Arc<BoardStore>,
        validator: TransitionValidator,
        gateway: Arc<dyn CommandGateway>,
        source: Arc<dyn BoardSource>,
    ) -> Self {
        let mut ledger = Ledger::default();
        for card in store.snapshot().cards() {
            ledger.record(&card.id, card.updated_at);
        }

        let (stale, _stale_rx) = watch::channel(false);
        let (notices, _notices_rx) = broadcast::channel(NOTICE_CAPACITY);

        Self {
            session_id: session_id.into(),
            store,
            validator,
            gateway,
            source,
            filters: Mutex::new(BoardFilters::default()),
            ledger: Mutex::new(ledger),
            stale,
            notices,
            resync_retry: (RESYNC_RETRY_INITIAL, RESYNC_RETRY_MAX),
        }
    }

    /// Delay bounds between attempts when the resync after a reconnect fails.
    pub fn with_resync_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.resync_retry = (initial, max);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn store(&self) -> &Arc<BoardStore> {
        &self.store
    }

    pub fn validator(&self) -> &TransitionValidator {
        &self.validator
    }

    pub fn notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.notices.subscribe()
    }

    pub fn is_stale(&self) -> bool {
        *self.stale.borrow()
    }

    pub fn watch_stale(&self) -> watch::Receiver<bool> {
        self.stale.subscribe()
    }

    pub fn phase(&self, card_id: &str) -> CardPhase {
        match self.ledger().ops.get(card_id) {
            None => CardPhase::Idle,
            Some(PendingOp::Confirmation(_)) => CardPhase::PendingConfirmation,
            Some(PendingOp::Applying { .. }) => CardPhase::Applying,
        }
    }

    pub fn pending_intent(&self, card_id: &str) -> Option<MoveIntent> {
        match self.ledger().ops.get(card_id) {
            Some(PendingOp::Confirmation(intent)) => Some(intent.clone()),
            _ => None,
        }
    }

    /// Number of cards with a recorded server write.
    pub fn tracked_cards(&self) -> usize {
        self.ledger().authoritative.len()
    }

    pub fn filters(&self) -> BoardFilters {
        self.filters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Entry point for a drag-and-drop or a stage selector change.
    pub async fn request_move(&self, card_id: &str, dest: &StageId) -> Result<MoveOutcome, SyncError> {
        if !self.validator.model().contains(dest) {
            return Err(SyncError::UnknownStage(dest.clone()));
        }

        let intent = {
            let mut ledger = self.ledger();
            if ledger.ops.contains_key(card_id) {
                return Err(SyncError::CardBusy(card_id.to_string()));
            }

            let current = self
                .store
                .stage_of(card_id)
                .ok_or_else(|| SyncError::UnknownCard(card_id.to_string()))?;

            let Some(intent) = MoveIntent::new(card_id, current, dest.clone()) else {
                tracing::debug!(card_id, "Move to current stage ignored");
                return Ok(MoveOutcome::NoOp);
            };

            let transition = self.validator.classify(&intent)?;
            tracing::info!(
                card_id,
                from = intent.from.as_str(),
                to = intent.to.as_str(),
                transition = transition.as_str(),
                "Move requested"
            );

            if transition.requires_confirmation() {
                ledger
                    .ops
                    .insert(card_id.to_string(), PendingOp::Confirmation(intent.clone()));
                return Ok(MoveOutcome::ConfirmationRequired(intent));
            }

            self.begin_stage_change(&mut ledger, intent)?
        };

        self.dispatch_stage_change(intent).await
    }

    /// Accepts a parked backward move and applies it.
    pub async fn confirm(&self, card_id: &str) -> Result<MoveOutcome, SyncError> {
        let intent = {
            let mut ledger = self.ledger();
            let intent = match ledger.ops.remove(card_id) {
                Some(PendingOp::Confirmation(intent)) => intent,
                Some(other) => {
                    ledger.ops.insert(card_id.to_string(), other);
                    return Err(SyncError::CardBusy(card_id.to_string()));
                }
                None => return Err(SyncError::NoPendingConfirmation(card_id.to_string())),
            };

            if self.store.stage_of(card_id).as_ref() != Some(&intent.from) {
                tracing::info!(card_id, "Confirmed move no longer matches the board, dropping it");
                return Err(SyncError::NoPendingConfirmation(card_id.to_string()));
            }

            tracing::info!(card_id, to = intent.to.as_str(), "Backward move confirmed");
            self.begin_stage_change(&mut ledger, intent)?
        };

        self.dispatch_stage_change(intent).await
    }

    /// Discards a parked backward move. Nothing was sent, so nothing is undone.
    pub fn cancel(&self, card_id: &str) -> Option<MoveIntent> {
        let mut ledger = self.ledger();
        match ledger.ops.remove(card_id) {
            Some(PendingOp::Confirmation(intent)) => {
                tracing::info!(card_id, "Backward move cancelled");
                Some(intent)
            }
            Some(other) => {
                ledger.ops.insert(card_id.to_string(), other);
                None
            }
            None => None,
        }
    }

    pub async fn request_archive(&self, card_id: &str) -> Result<(), SyncError> {
        {
            let mut ledger = self.ledger();
            if ledger.ops.contains_key(card_id) {
                return Err(SyncError::CardBusy(card_id.to_string()));
            }
            let prior = self
                .store
                .card(card_id)
                .ok_or_else(|| SyncError::UnknownCard(card_id.to_string()))?;

            self.store.archive_locally(card_id);
            ledger.ops.insert(
                card_id.to_string(),
                PendingOp::Applying {
                    command: PendingCommand::Archive,
                    prior,
                    superseded: false,
                },
            );
        }

        let result = self.gateway.send_archive(card_id).await;

        let mut ledger = self.ledger();
        let op = ledger.ops.remove(card_id);
        match result {
            Ok(()) => {
                // Terminal on the server, even if a snapshot re-added the card
                // while the command was in flight.
                if self.store.archive_locally(card_id) {
                    tracing::debug!(card_id, "Card re-added during archive removed again");
                }
                tracing::info!(card_id, "Archive confirmed");
                Ok(())
            }
            Err(err) => {
                if let Some(PendingOp::Applying {
                    prior,
                    superseded: false,
                    ..
                }) = op
                {
                    self.store.restore_card(prior);
                }
                tracing::warn!(card_id, error = %err, "Archive failed, rolled back");
                self.notify(SyncNotice::ArchiveFailed {
                    card_id: card_id.to_string(),
                    message: err.to_string(),
                });
                Err(SyncError::Gateway(err))
            }
        }
    }

    /// Applies one event from the realtime channel.
    pub fn handle_remote_event(&self, event: &RemoteChangeEvent) -> RemoteOutcome {
        let card_id = event.card_id.as_str();
        let own = event.actor_session_id == self.session_id;
        let mut ledger = self.ledger();

        if let Some(seen) = ledger.last_write(card_id) {
            if event.server_timestamp < seen {
                tracing::debug!(card_id, "Dropping stale remote change");
                return RemoteOutcome::Stale;
            }
            if own && event.server_timestamp <= seen {
                return RemoteOutcome::Redundant;
            }
        }
        if own && matches!(ledger.ops.get(card_id), Some(PendingOp::Applying { .. })) {
            return RemoteOutcome::Redundant;
        }

        let changed = match (&event.lead, event.change()) {
            (Some(lead), _) => {
                if !lead.archived && !self.filters().matches(lead) {
                    self.store.archive_locally(card_id)
                } else {
                    self.store.upsert_card(lead.clone())
                }
            }
            (None, Some(RemoteChange::Archived)) => self.store.archive_locally(card_id),
            (None, Some(RemoteChange::Stage(stage))) => {
                if !self.validator.model().contains(&stage) {
                    tracing::warn!(card_id, stage = stage.as_str(), "Remote change names an unknown stage");
                    return RemoteOutcome::NoChange;
                }
                match self.store.stage_of(card_id) {
                    // Already seen, or hidden by the active filters.
                    None if ledger.last_write(card_id).is_some() || !self.filters().is_empty() => {
                        tracing::debug!(card_id, "Remote change for a card outside this board");
                        return RemoteOutcome::NoChange;
                    }
                    None => {
                        tracing::info!(card_id, "Remote change for a card not on this board");
                        return RemoteOutcome::NeedsResync;
                    }
                    Some(current) if current == stage => false,
                    Some(_) => self
                        .store
                        .move_card_at(card_id, &stage, event.server_timestamp)
                        .is_some(),
                }
            }
            (None, None) => return RemoteOutcome::NoChange,
        };

        ledger.record(card_id, event.server_timestamp);
        if let Some(intent) = ledger.mark_superseded(card_id) {
            tracing::info!(card_id, "Pending backward move superseded by a remote change");
            self.notify(SyncNotice::ConfirmationSuperseded { intent });
        }

        tracing::debug!(
            card_id,
            actor = event.actor_session_id.as_str(),
            changed,
            "Remote change applied"
        );

        if changed {
            RemoteOutcome::Applied
        } else {
            RemoteOutcome::NoChange
        }
    }

    /// Refetches the whole board with the current filters and swaps it in.
    ///
    /// Cards with a command in flight keep their optimistic placement unless
    /// the server has already recorded a newer write for them.
    pub async fn resync(&self) -> Result<usize, SyncError> {
        let filters = self.filters();
        let mut board = match self.source.fetch_board(&filters).await {
            Ok(board) => board,
            Err(err) => {
                tracing::warn!(error = %err, "Board resync failed");
                self.notify(SyncNotice::ResyncFailed {
                    message: err.to_string(),
                });
                return Err(SyncError::BoardFetch(err.to_string()));
            }
        };

        let cards = {
            let mut ledger = self.ledger();
            let current = self.store.snapshot();
            Self::keep_newer_local_writes(&ledger, &current, &mut board);

            for card in board.cards() {
                ledger.record(&card.id, card.updated_at);
            }
            Self::overlay_in_flight(&mut ledger, &mut board);
            ledger.forget_absent(&board);

            let cards = board.len();
            self.store.replace(board);
            cards
        };

        tracing::info!(cards, "Board resynced");
        self.notify(SyncNotice::Resynced { cards });
        Ok(cards)
    }

    pub async fn set_filters(&self, filters: BoardFilters) -> Result<usize, SyncError> {
        *self.filters.lock().unwrap_or_else(PoisonError::into_inner) = filters;
        self.resync().await
    }

    /// Consumes channel notices until the channel goes away.
    ///
    /// The resync owed after a connect is retried with backoff until it
    /// succeeds or the channel drops again.
    pub async fn run(self: Arc<Self>, mut notices: broadcast::Receiver<ChannelNotice>) {
        let (retry_initial, retry_max) = self.resync_retry;
        let mut failed_resyncs: u32 = 0;

        loop {
            let retry_in = backoff_delay(failed_resyncs.max(1), retry_initial, retry_max);
            let notice = tokio::select! {
                notice = notices.recv() => notice,
                _ = tokio::time::sleep(retry_in), if failed_resyncs > 0 => {
                    failed_resyncs = self.catch_up(failed_resyncs).await;
                    continue;
                }
            };

            match notice {
                Ok(ChannelNotice::Event(event)) => {
                    if self.handle_remote_event(&event) == RemoteOutcome::NeedsResync {
                        let _ = self.resync().await;
                    }
                }
                Ok(ChannelNotice::State(ChannelState::Connected)) => {
                    failed_resyncs = self.catch_up(0).await;
                }
                Ok(ChannelNotice::State(ChannelState::Disconnected)) => {
                    failed_resyncs = 0;
                    if !self.stale.send_replace(true) {
                        tracing::warn!("Live updates unavailable, board may be stale");
                        self.notify(SyncNotice::LiveUpdatesUnavailable);
                    }
                }
                Ok(ChannelNotice::State(ChannelState::Connecting { .. })) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Missed realtime events, resyncing");
                    let _ = self.resync().await;
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    /// Resyncs after a connect; returns the updated failure count, zero once
    /// the board is current again.
    async fn catch_up(&self, failed_resyncs: u32) -> u32 {
        match self.resync().await {
            Ok(_) => {
                if self.stale.send_replace(false) {
                    self.notify(SyncNotice::LiveUpdatesRestored);
                }
                0
            }
            Err(_) => {
                let failed_resyncs = failed_resyncs.saturating_add(1);
                tracing::warn!(failed_resyncs, "Resync after connect failed, will retry");
                failed_resyncs
            }
        }
    }

    fn begin_stage_change(&self, ledger: &mut Ledger, intent: MoveIntent) -> Result<MoveIntent, SyncError> {
        let prior = self
            .store
            .card(&intent.card_id)
            .ok_or_else(|| SyncError::UnknownCard(intent.card_id.clone()))?;

        self.store.move_card_locally(&intent.card_id, &intent.to);
        ledger.ops.insert(
            intent.card_id.clone(),
            PendingOp::Applying {
                command: PendingCommand::StageChange(intent.clone()),
                prior,
                superseded: false,
            },
        );
        Ok(intent)
    }

    async fn dispatch_stage_change(&self, intent: MoveIntent) -> Result<MoveOutcome, SyncError> {
        let result = self
            .gateway
            .send_stage_change(&intent.card_id, &intent.to)
            .await;

        let card_id = intent.card_id.as_str();
        let mut ledger = self.ledger();
        let op = ledger.ops.remove(card_id);

        match result {
            Ok(card) => {
                let newer_seen = ledger
                    .last_write(card_id)
                    .is_some_and(|seen| seen > card.updated_at);
                if newer_seen {
                    tracing::info!(card_id, "Stage change accepted but a newer remote write wins");
                    return Ok(MoveOutcome::Superseded(card));
                }

                ledger.record(card_id, card.updated_at);
                self.store.upsert_card(card.clone());
                if card.stage != intent.to {
                    tracing::info!(
                        card_id,
                        requested = intent.to.as_str(),
                        actual = card.stage.as_str(),
                        "Server placed card in a different stage"
                    );
                }
                Ok(MoveOutcome::Applied(card))
            }
            Err(err) => {
                match op {
                    Some(PendingOp::Applying {
                        prior,
                        superseded: false,
                        ..
                    }) => {
                        self.store.restore_card(prior);
                        tracing::warn!(card_id, error = %err, "Stage change failed, rolled back");
                    }
                    _ => {
                        tracing::warn!(card_id, error = %err, "Stage change failed after a newer write");
                    }
                }
                self.notify(SyncNotice::MoveFailed {
                    card_id: card_id.to_string(),
                    message: err.to_string(),
                });
                Err(SyncError::Gateway(err))
            }
        }
    }

    /// A remote event that raced the fetch may be newer than what the fetch
    /// returned; the fresher local copy stays.
    fn keep_newer_local_writes(ledger: &Ledger, current: &Board, board: &mut Board) {
        let outdated: Vec<String> = board
            .cards()
            .filter(|card| {
                ledger
                    .last_write(&card.id)
                    .is_some_and(|seen| seen > card.updated_at)
            })
            .map(|card| card.id.clone())
            .collect();

        for card_id in outdated {
            board.take_card(&card_id);
            if let Some(local) = current.card(&card_id) {
                board.push_card(local.clone());
            }
        }
    }

    fn overlay_in_flight(ledger: &mut Ledger, board: &mut Board) {
        for (card_id, op) in ledger.ops.iter_mut() {
            let PendingOp::Applying {
                command,
                prior,
                superseded,
            } = op
            else {
                continue;
            };

            let server_moved_on = match board.card(card_id) {
                Some(server) => server.updated_at > prior.updated_at,
                None => matches!(command, PendingCommand::StageChange(_)),
            };
            if server_moved_on {
                *superseded = true;
                continue;
            }

            match command {
                PendingCommand::StageChange(intent) => {
                    if let Some(mut card) = board.take_card(card_id) {
                        card.enter_stage(intent.to.clone(), intent.initiated_at);
                        board.push_card(card);
                    }
                }
                PendingCommand::Archive => {
                    board.take_card(card_id);
                }
            }
        }
    }

    fn notify(&self, notice: SyncNotice) {
        let _ = self.notices.send(notice);
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
