use crate::{CellId, PlayerSessionId};
use thiserror::Error;

/// Why a handoff request did not proceed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandoffError {
    #[error("invalid request parameters: {reason}")]
    InvalidRequest { reason: String },

    #[error("missing tenant identity")]
    Unauthorized,

    #[error("handoff for player session {player} towards {target_cell} already in progress")]
    HandoffInProgress {
        player: PlayerSessionId,
        target_cell: CellId,
    },

    #[error("target cell {cell} is not managed or target server RPC endpoint not configured")]
    TargetUnavailable { cell: CellId },

    #[error("source server managing cell {cell} has no RPC endpoint configured")]
    SourceMisconfigured { cell: CellId },

    #[error("message queue service unavailable")]
    ChannelUnavailable,

    #[error("failed to notify target server: {reason}")]
    DispatchFailure { reason: String },
}

/// Payload-free discriminant of [`HandoffError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandoffErrorKind {
    InvalidRequest,
    Unauthorized,
    HandoffInProgress,
    TargetUnavailable,
    SourceMisconfigured,
    ChannelUnavailable,
    DispatchFailure,
}

impl HandoffError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> HandoffErrorKind {
        match self {
            Self::InvalidRequest { .. } => HandoffErrorKind::InvalidRequest,
            Self::Unauthorized => HandoffErrorKind::Unauthorized,
            Self::HandoffInProgress { .. } => HandoffErrorKind::HandoffInProgress,
            Self::TargetUnavailable { .. } => HandoffErrorKind::TargetUnavailable,
            Self::SourceMisconfigured { .. } => HandoffErrorKind::SourceMisconfigured,
            Self::ChannelUnavailable => HandoffErrorKind::ChannelUnavailable,
            Self::DispatchFailure { .. } => HandoffErrorKind::DispatchFailure,
        }
    }

    /// HTTP status the caller-facing layer should answer with.
    ///
    /// A missing target is ordinary world state (404); a missing source means
    /// the caller's own registration is broken (500).
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            HandoffErrorKind::InvalidRequest => 400,
            HandoffErrorKind::Unauthorized => 401,
            HandoffErrorKind::TargetUnavailable => 404,
            HandoffErrorKind::HandoffInProgress => 409,
            HandoffErrorKind::SourceMisconfigured | HandoffErrorKind::DispatchFailure => 500,
            HandoffErrorKind::ChannelUnavailable => 503,
        }
    }
}
