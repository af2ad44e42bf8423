//! Handoff session table
//!
//! One live session per player session id. Admission goes through the map's
//! entry API, so concurrent requests for the same player collapse into a
//! single leader; everyone else follows the leader's outcome.

use super::{HandoffError, HandoffGrant, HandoffRequest};
use crate::{CellId, PlayerSessionId, WorldServerId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

pub type HandoffOutcome = Result<HandoffGrant, HandoffError>;

/// Protocol state of a handoff session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffState {
    Requested,
    Validated,
    NotificationDispatched,
    Committed,
    Failed,
}

impl HandoffState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Failed)
    }

    pub fn can_transition_to(self, next: HandoffState) -> bool {
        use HandoffState::*;
        match (self, next) {
            (Requested, Validated)
            | (Validated, NotificationDispatched)
            | (NotificationDispatched, Committed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Snapshot of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffSession {
    pub token: Uuid,
    pub player_session_id: PlayerSessionId,
    pub character_name: String,
    pub source_server_id: WorldServerId,
    pub source_cell_id: CellId,
    pub target_cell_id: CellId,
    /// Captured at validation and never re-checked.
    pub target_server_id: Option<WorldServerId>,
    pub state: HandoffState,
    pub created_at: Instant,
    pub deadline: Instant,
}

impl HandoffSession {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

struct SessionSlot {
    session: HandoffSession,
    outcome: watch::Sender<Option<HandoffOutcome>>,
}

pub(crate) enum Admission {
    /// This request owns a fresh session and must drive it.
    Lead(HandoffSession),
    /// A session for the same player and target is already live.
    Follow {
        token: Uuid,
        deadline: Instant,
        outcome: watch::Receiver<Option<HandoffOutcome>>,
    },
}

pub struct SessionTable {
    sessions: DashMap<PlayerSessionId, SessionSlot>,
    ttl: Duration,
}

impl SessionTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
        }
    }

    pub(crate) fn admit(
        &self,
        request: &HandoffRequest,
        now: Instant,
    ) -> Result<Admission, HandoffError> {
        match self.sessions.entry(request.player_session_id) {
            Entry::Vacant(vacant) => {
                let slot = self.new_slot(request, now);
                let session = slot.session.clone();
                vacant.insert(slot);
                Ok(Admission::Lead(session))
            }
            Entry::Occupied(mut occupied) => {
                let existing = &occupied.get().session;

                if existing.is_expired(now) {
                    tracing::debug!(
                        player = %request.player_session_id,
                        token = %existing.token,
                        "expired handoff session replaced"
                    );
                } else if existing.target_cell_id == request.target_cell_id {
                    return Ok(Admission::Follow {
                        token: existing.token,
                        deadline: existing.deadline,
                        outcome: occupied.get().outcome.subscribe(),
                    });
                } else if existing.state.is_terminal() {
                    tracing::debug!(
                        player = %request.player_session_id,
                        previous_target = %existing.target_cell_id,
                        "completed handoff session superseded"
                    );
                } else {
                    return Err(HandoffError::HandoffInProgress {
                        player: request.player_session_id,
                        target_cell: existing.target_cell_id.clone(),
                    });
                }

                let slot = self.new_slot(request, now);
                let session = slot.session.clone();
                occupied.insert(slot);
                Ok(Admission::Lead(session))
            }
        }
    }

    pub(crate) fn mark_validated(
        &self,
        player: PlayerSessionId,
        token: Uuid,
        target: WorldServerId,
    ) -> bool {
        self.transition(player, token, HandoffState::Validated, |session| {
            session.target_server_id = Some(target);
        })
    }

    pub(crate) fn mark_dispatched(&self, player: PlayerSessionId, token: Uuid) -> bool {
        self.transition(player, token, HandoffState::NotificationDispatched, |_| {})
    }

    /// Publishes the leader's outcome. Successful sessions stay as `Committed`
    /// until their deadline so retries get the same answer; failed sessions
    /// are removed at once.
    pub(crate) fn finish(&self, player: PlayerSessionId, token: Uuid, outcome: &HandoffOutcome) {
        match outcome {
            Ok(_) => {
                if let Some(mut slot) = self.sessions.get_mut(&player) {
                    if slot.session.token == token {
                        if slot.session.state.can_transition_to(HandoffState::Committed) {
                            slot.session.state = HandoffState::Committed;
                        }
                        slot.outcome.send_replace(Some(outcome.clone()));
                    }
                }
            }
            Err(_) => {
                if let Some((_, mut slot)) = self
                    .sessions
                    .remove_if(&player, |_, slot| slot.session.token == token)
                {
                    slot.session.state = HandoffState::Failed;
                    slot.outcome.send_replace(Some(outcome.clone()));
                }
            }
        }
    }

    pub fn get(&self, player: PlayerSessionId) -> Option<HandoffSession> {
        self.sessions.get(&player).map(|slot| slot.session.clone())
    }

    /// Drops every session whose deadline has passed. No notification or
    /// retry is triggered. Returns how many were dropped.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, slot| !slot.session.is_expired(now));
        let dropped = before.saturating_sub(self.sessions.len());
        if dropped > 0 {
            tracing::debug!(dropped, "expired handoff sessions dropped");
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn new_slot(&self, request: &HandoffRequest, now: Instant) -> SessionSlot {
        let (outcome, _) = watch::channel(None);
        SessionSlot {
            session: HandoffSession {
                token: Uuid::new_v4(),
                player_session_id: request.player_session_id,
                character_name: request.character_name.clone(),
                source_server_id: request.source_server_id,
                source_cell_id: request.current_cell_id.clone(),
                target_cell_id: request.target_cell_id.clone(),
                target_server_id: None,
                state: HandoffState::Requested,
                created_at: now,
                deadline: now + self.ttl,
            },
            outcome,
        }
    }

    fn transition(
        &self,
        player: PlayerSessionId,
        token: Uuid,
        next: HandoffState,
        update: impl FnOnce(&mut HandoffSession),
    ) -> bool {
        let Some(mut slot) = self.sessions.get_mut(&player) else {
            return false;
        };
        let session = &mut slot.session;
        if session.token != token || !session.state.can_transition_to(next) {
            return false;
        }
        update(session);
        session.state = next;
        true
    }
}
