//! Caller-facing request/response and the "prepare to receive" payload.

use super::HandoffError;
use crate::{CellId, PlayerSessionId, TenantId, WorldServerId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A source world server asking to move a player into another cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffRequest {
    #[serde(rename = "playerSessionID")]
    pub player_session_id: PlayerSessionId,
    pub character_name: String,
    #[serde(rename = "sourceServerID")]
    pub source_server_id: WorldServerId,
    #[serde(rename = "currentCellID")]
    pub current_cell_id: CellId,
    #[serde(rename = "targetCellID")]
    pub target_cell_id: CellId,
}

impl HandoffRequest {
    pub fn validate(&self) -> Result<(), HandoffError> {
        if self.player_session_id.is_nil() {
            return Err(HandoffError::invalid("player session id is empty"));
        }
        if self.character_name.trim().is_empty() {
            return Err(HandoffError::invalid("character name is empty"));
        }
        if !self.source_server_id.is_valid() {
            return Err(HandoffError::invalid("source server id must be non-zero"));
        }
        if self.current_cell_id.is_blank() {
            return Err(HandoffError::invalid("current cell id is empty"));
        }
        if self.target_cell_id.is_blank() {
            return Err(HandoffError::invalid("target cell id is empty"));
        }
        Ok(())
    }
}

/// Successful outcome: the target has been durably notified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffGrant {
    pub session_token: Uuid,
    pub target_server_id: WorldServerId,
    pub target_rpc_endpoint: String,
    pub source_rpc_endpoint: String,
}

/// Wire shape returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffResponse {
    pub can_proceed: bool,
    #[serde(
        rename = "targetServerRPCEndpoint",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub target_server_rpc_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<&Result<HandoffGrant, HandoffError>> for HandoffResponse {
    fn from(result: &Result<HandoffGrant, HandoffError>) -> Self {
        match result {
            Ok(grant) => Self {
                can_proceed: true,
                target_server_rpc_endpoint: Some(grant.target_rpc_endpoint.clone()),
                error_message: None,
            },
            Err(err) => Self {
                can_proceed: false,
                target_server_rpc_endpoint: None,
                error_message: Some(err.to_string()),
            },
        }
    }
}

impl From<Result<HandoffGrant, HandoffError>> for HandoffResponse {
    fn from(result: Result<HandoffGrant, HandoffError>) -> Self {
        Self::from(&result)
    }
}

/// Persisted character fields a target may use to pre-warm the player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterBaseline {
    pub character_name: String,
    pub class_name: String,
    pub character_level: i16,
    pub map_name: String,
    pub max_health: f64,
    pub max_mana: f64,
    pub max_energy: f64,
    pub max_stamina: f64,
}

/// Notification body published to `handoff.prepare.<targetServerID>`.
///
/// `character_baseline` is a hint only; consumers fetch the baseline
/// themselves when it is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareToReceivePlayer {
    #[serde(rename = "tenantID")]
    pub tenant_id: TenantId,
    #[serde(rename = "playerSessionID")]
    pub player_session_id: PlayerSessionId,
    pub character_name: String,
    #[serde(rename = "sourceServerID")]
    pub source_server_id: WorldServerId,
    #[serde(rename = "sourceRPCEndpoint")]
    pub source_rpc_endpoint: String,
    #[serde(rename = "targetCellID")]
    pub target_cell_id: CellId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_baseline: Option<CharacterBaseline>,
}

/// Best-effort source of [`CharacterBaseline`] snapshots.
pub trait CharacterBaselineProvider: Send + Sync {
    fn baseline(
        &self,
        tenant: TenantId,
        player: PlayerSessionId,
        character_name: &str,
    ) -> Option<CharacterBaseline>;
}
