//! Seam Network Layer
//!
//! Cell ownership, world-server registry and live player handoff between
//! meshed world servers.

pub mod authority;
pub mod cell;
pub mod channel;
pub mod handoff;
pub mod world_server;

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub use authority::{CellOwnershipRegistry, CellResolution, GridCell, ResolvedOwner};
pub use channel::{ChannelError, ChannelHandle, LocalBroker, Notification, NotificationChannel};
pub use handoff::{HandoffCoordinator, HandoffError, HandoffGrant, HandoffRequest, HandoffResponse};
pub use world_server::{
    RegistryError, ServerDescriptor, ServerStatus, WorldServer, WorldServerRegistry,
};

/// World server ID (0 is never issued)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorldServerId(pub u32);

impl WorldServerId {
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for WorldServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cell ID (spatial partition identifier, e.g. `"B12"` or `"Highlands_3_-1"`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(pub String);

impl CellId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Blank ids are never valid cell references.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CellId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Map instance a cell belongs to
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MapInstanceId(pub u32);

/// Customer/tenant identity supplied by the caller-facing layer
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Player's user-session identity; handoff sessions are keyed by it
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerSessionId(pub Uuid);

impl PlayerSessionId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for PlayerSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
