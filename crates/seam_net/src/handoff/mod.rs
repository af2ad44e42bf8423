//! Handoff coordination
//!
//! Validates a player's move from one cell to another, resolves the owners of
//! both cells and durably tells the target owner to prepare. The coordinator's
//! job ends once the notification is with the channel: it never waits for the
//! target to become ready. That handshake happens directly between the two
//! world servers over their RPC endpoints.
//!
//! Checks run in a fixed order so that systemic failures short-circuit before
//! request-specific ones:
//!
//! 1. channel availability
//! 2. tenant identity
//! 3. request shape
//! 4. session admission (duplicates follow the in-flight session)
//! 5. target owner, then source owner
//! 6. dispatch

mod error;
mod request;
mod session;

pub use error::{HandoffError, HandoffErrorKind};
pub use request::{
    CharacterBaseline, CharacterBaselineProvider, HandoffGrant, HandoffRequest, HandoffResponse,
    PrepareToReceivePlayer,
};
pub use session::{HandoffOutcome, HandoffSession, HandoffState, SessionTable};

use crate::authority::CellOwnershipRegistry;
use crate::channel::{ChannelHandle, Notification, NotificationChannel};
use crate::{PlayerSessionId, TenantId, WorldServerId};
use session::Admission;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Dispatch addressing and session timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffConfig {
    pub exchange: String,
    /// Routing keys are `<routing_prefix>.<targetServerID>`.
    pub routing_prefix: String,
    pub persistent: bool,
    pub session_ttl: Duration,
    /// Upper bound on one publish. The session deadline bounds it too, so it
    /// only has effect when shorter than `session_ttl`.
    pub dispatch_timeout: Duration,
}

impl HandoffConfig {
    pub fn routing_key(&self, target: WorldServerId) -> String {
        format!("{}.{}", self.routing_prefix, target)
    }
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            exchange: "seam.instance.management".to_string(),
            routing_prefix: "handoff.prepare".to_string(),
            persistent: true,
            session_ttl: Duration::from_secs(30),
            dispatch_timeout: Duration::from_secs(5),
        }
    }
}

pub struct HandoffCoordinator<C> {
    cells: Arc<CellOwnershipRegistry>,
    channel: ChannelHandle<C>,
    sessions: Arc<SessionTable>,
    baseline: Option<Arc<dyn CharacterBaselineProvider>>,
    config: HandoffConfig,
}

impl<C: NotificationChannel> HandoffCoordinator<C> {
    pub fn new(
        cells: Arc<CellOwnershipRegistry>,
        channel: ChannelHandle<C>,
        config: HandoffConfig,
    ) -> Self {
        Self {
            cells,
            channel,
            sessions: Arc::new(SessionTable::new(config.session_ttl)),
            baseline: None,
            config,
        }
    }

    pub fn with_baseline_provider(mut self, provider: Arc<dyn CharacterBaselineProvider>) -> Self {
        self.baseline = Some(provider);
        self
    }

    pub fn config(&self) -> &HandoffConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn channel(&self) -> &ChannelHandle<C> {
        &self.channel
    }

    /// Runs one handoff request to a terminal result.
    ///
    /// `tenant` is the identity the caller-facing layer authenticated; `None`
    /// means the caller supplied none.
    pub async fn request_handoff(
        &self,
        tenant: Option<TenantId>,
        request: HandoffRequest,
    ) -> HandoffOutcome {
        if !self.channel.is_available() {
            tracing::error!(
                player = %request.player_session_id,
                "handoff rejected: notification channel unavailable"
            );
            return Err(HandoffError::ChannelUnavailable);
        }

        let tenant = match tenant {
            Some(tenant) if !tenant.is_nil() => tenant,
            _ => {
                tracing::warn!(
                    player = %request.player_session_id,
                    "handoff rejected: empty tenant identity"
                );
                return Err(HandoffError::Unauthorized);
            }
        };

        if let Err(err) = request.validate() {
            tracing::warn!(error = %err, ?request, "handoff rejected: invalid request parameters");
            return Err(err);
        }

        tracing::info!(
            character = %request.character_name,
            target_cell = %request.target_cell_id,
            "handoff preparation requested"
        );

        let now = Instant::now();
        let session = match self.sessions.admit(&request, now) {
            Ok(Admission::Lead(session)) => session,
            Ok(Admission::Follow {
                token,
                deadline,
                outcome,
            }) => {
                tracing::debug!(
                    player = %request.player_session_id,
                    %token,
                    "duplicate handoff request follows in-flight session"
                );
                return follow(deadline.min(now + self.config.dispatch_timeout), outcome).await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "handoff rejected");
                return Err(err);
            }
        };

        let guard = LeaderGuard {
            sessions: &self.sessions,
            player: request.player_session_id,
            token: session.token,
            settled: false,
        };
        let outcome = self.drive(tenant, &request, &session).await;
        guard.settle(&outcome);
        outcome
    }

    /// Drops sessions past their deadline.
    pub fn sweep_expired(&self) -> usize {
        self.sessions.sweep_expired(Instant::now())
    }

    /// Sweeps expired sessions every `interval` until the task is aborted.
    pub fn spawn_session_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                sessions.sweep_expired(Instant::now());
            }
        })
    }

    async fn drive(
        &self,
        tenant: TenantId,
        request: &HandoffRequest,
        session: &HandoffSession,
    ) -> HandoffOutcome {
        let player = request.player_session_id;

        let target = self
            .cells
            .resolve(&request.target_cell_id)
            .and_then(|owner| owner.rpc_endpoint.map(|endpoint| (owner.server_id, endpoint)));
        let Some((target_server, target_endpoint)) = target else {
            tracing::warn!(
                target_cell = %request.target_cell_id,
                "target cell not managed or target server RPC endpoint not configured"
            );
            return Err(HandoffError::TargetUnavailable {
                cell: request.target_cell_id.clone(),
            });
        };

        let source = self
            .cells
            .resolve(&request.current_cell_id)
            .and_then(|owner| owner.rpc_endpoint.map(|endpoint| (owner.server_id, endpoint)));
        let Some((source_server, source_endpoint)) = source else {
            tracing::error!(
                current_cell = %request.current_cell_id,
                source_server = %request.source_server_id,
                "source server RPC endpoint not configured"
            );
            return Err(HandoffError::SourceMisconfigured {
                cell: request.current_cell_id.clone(),
            });
        };
        if source_server != request.source_server_id {
            tracing::warn!(
                current_cell = %request.current_cell_id,
                owner = %source_server,
                claimed = %request.source_server_id,
                "handoff source does not own the current cell"
            );
        }

        if !self.sessions.mark_validated(player, session.token, target_server) {
            return Err(HandoffError::DispatchFailure {
                reason: "handoff session expired before dispatch".to_string(),
            });
        }

        let payload = PrepareToReceivePlayer {
            tenant_id: tenant,
            player_session_id: player,
            character_name: request.character_name.clone(),
            source_server_id: request.source_server_id,
            source_rpc_endpoint: source_endpoint.clone(),
            target_cell_id: request.target_cell_id.clone(),
            character_baseline: self
                .baseline
                .as_ref()
                .and_then(|provider| provider.baseline(tenant, player, &request.character_name)),
        };
        let routing_key = self.config.routing_key(target_server);
        let notification = Notification::json(
            &self.config.exchange,
            &routing_key,
            self.config.persistent,
            &payload,
        )
        .map_err(|err| HandoffError::DispatchFailure {
            reason: err.to_string(),
        })?;

        // A publish never outlives its session.
        let now = Instant::now();
        if session.is_expired(now) {
            return Err(HandoffError::DispatchFailure {
                reason: "handoff session expired before dispatch".to_string(),
            });
        }
        let publish_by = session.deadline.min(now + self.config.dispatch_timeout);

        tracing::info!(
            exchange = %self.config.exchange,
            routing_key = %routing_key,
            target_server = %target_server,
            "publishing prepare-to-receive notification"
        );
        match tokio::time::timeout_at(publish_by, self.channel.publish(notification)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(
                    error = %err,
                    character = %request.character_name,
                    target_cell = %request.target_cell_id,
                    "error publishing prepare-to-receive notification"
                );
                return Err(HandoffError::DispatchFailure {
                    reason: err.to_string(),
                });
            }
            Err(_) => {
                tracing::error!(
                    routing_key = %routing_key,
                    "publishing prepare-to-receive notification timed out"
                );
                return Err(HandoffError::DispatchFailure {
                    reason: "publish timed out".to_string(),
                });
            }
        }
        self.sessions.mark_dispatched(player, session.token);

        tracing::info!(
            character = %request.character_name,
            target_endpoint = %target_endpoint,
            "handoff preparation dispatched"
        );
        Ok(HandoffGrant {
            session_token: session.token,
            target_server_id: target_server,
            target_rpc_endpoint: target_endpoint,
            source_rpc_endpoint: source_endpoint,
        })
    }
}

/// Settles a led session even when the leading request is dropped before it
/// finishes, so followers and retries are not left waiting on a dead leader.
struct LeaderGuard<'a> {
    sessions: &'a SessionTable,
    player: PlayerSessionId,
    token: Uuid,
    settled: bool,
}

impl LeaderGuard<'_> {
    fn settle(mut self, outcome: &HandoffOutcome) {
        self.sessions.finish(self.player, self.token, outcome);
        self.settled = true;
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        tracing::warn!(
            player = %self.player,
            token = %self.token,
            "handoff request dropped before completion"
        );
        let abandoned = Err(HandoffError::DispatchFailure {
            reason: "handoff request abandoned before completion".to_string(),
        });
        self.sessions.finish(self.player, self.token, &abandoned);
    }
}

/// Waits for the leader of an in-flight session, never past `deadline`.
async fn follow(
    deadline: Instant,
    mut outcome: watch::Receiver<Option<HandoffOutcome>>,
) -> HandoffOutcome {
    let waited = tokio::time::timeout_at(deadline, async move {
        outcome
            .wait_for(Option::is_some)
            .await
            .map(|outcome| outcome.clone())
    })
    .await;

    match waited {
        Ok(Ok(Some(outcome))) => outcome,
        Ok(Ok(None)) | Ok(Err(_)) => Err(HandoffError::DispatchFailure {
            reason: "in-flight handoff session was dropped".to_string(),
        }),
        Err(_) => Err(HandoffError::DispatchFailure {
            reason: "timed out waiting for in-flight handoff".to_string(),
        }),
    }
}
