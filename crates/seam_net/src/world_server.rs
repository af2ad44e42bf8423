//! World server registry
//!
//! Authoritative record of every running world-server process: addresses,
//! server-to-server RPC endpoint, coarse load and liveness.

use crate::WorldServerId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Errors returned by registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("invalid server descriptor: {reason}")]
    InvalidDescriptor { reason: String },

    #[error("world server {0} is not registered")]
    NotFound(WorldServerId),

    #[error("invalid RPC endpoint '{endpoint}': expected scheme://host:port")]
    InvalidEndpoint { endpoint: String },
}

/// Liveness as seen through heartbeats and load reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerStatus {
    Alive,
    Suspected,
    Dead,
}

/// What a launcher reports when it starts a world server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDescriptor {
    pub public_address: String,
    pub internal_address: String,
    #[serde(default)]
    pub rpc_endpoint: Option<String>,
    #[serde(default)]
    pub starting_load: Option<u32>,
}

impl ServerDescriptor {
    pub fn new(public_address: impl Into<String>, internal_address: impl Into<String>) -> Self {
        Self {
            public_address: public_address.into(),
            internal_address: internal_address.into(),
            rpc_endpoint: None,
            starting_load: Some(0),
        }
    }

    pub fn with_rpc_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.rpc_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_starting_load(mut self, load: u32) -> Self {
        self.starting_load = Some(load);
        self
    }
}

/// A registered world server. Readers always get a snapshot clone.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldServer {
    pub id: WorldServerId,
    pub public_address: String,
    pub internal_address: String,
    pub rpc_endpoint: Option<String>,
    pub load: u32,
    pub status: ServerStatus,
    pub last_heartbeat: Instant,
}

impl WorldServer {
    /// The endpoint other servers use, if one has been reported.
    pub fn reachable_endpoint(&self) -> Option<&str> {
        self.rpc_endpoint
            .as_deref()
            .filter(|endpoint| !endpoint.trim().is_empty())
    }
}

/// Registry of world servers keyed by id.
///
/// Writes lock only the entry being changed; reads of other servers never wait.
pub struct WorldServerRegistry {
    servers: DashMap<WorldServerId, WorldServer>,
    next_id: AtomicU32,
}

impl WorldServerRegistry {
    pub fn new() -> Self {
        Self {
            servers: DashMap::new(),
            next_id: AtomicU32::new(1),
        }
    }

    pub fn register(&self, descriptor: ServerDescriptor) -> Result<WorldServerId, RegistryError> {
        if descriptor.public_address.trim().is_empty() {
            return Err(RegistryError::InvalidDescriptor {
                reason: "public address is required".to_string(),
            });
        }
        if descriptor.internal_address.trim().is_empty() {
            return Err(RegistryError::InvalidDescriptor {
                reason: "internal address is required".to_string(),
            });
        }
        let Some(load) = descriptor.starting_load else {
            return Err(RegistryError::InvalidDescriptor {
                reason: "starting load is required".to_string(),
            });
        };
        if let Some(endpoint) = descriptor.rpc_endpoint.as_deref() {
            validate_rpc_endpoint(endpoint)?;
        }

        let id = WorldServerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.servers.insert(
            id,
            WorldServer {
                id,
                public_address: descriptor.public_address,
                internal_address: descriptor.internal_address,
                rpc_endpoint: descriptor.rpc_endpoint,
                load,
                status: ServerStatus::Alive,
                last_heartbeat: Instant::now(),
            },
        );

        tracing::info!(server = %id, "world server registered");
        Ok(id)
    }

    pub fn update_endpoint(
        &self,
        id: WorldServerId,
        endpoint: impl Into<String>,
    ) -> Result<(), RegistryError> {
        let endpoint = endpoint.into();
        validate_rpc_endpoint(&endpoint)?;

        let mut server = self.servers.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        if server.rpc_endpoint.as_deref() != Some(endpoint.as_str()) {
            tracing::info!(server = %id, endpoint = %endpoint, "RPC endpoint updated");
            server.rpc_endpoint = Some(endpoint);
        }
        Ok(())
    }

    /// Last write wins. Also counts as a heartbeat.
    pub fn update_load(&self, id: WorldServerId, load: u32) -> Result<(), RegistryError> {
        let mut server = self.servers.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        server.load = load;
        touch(&mut server);
        Ok(())
    }

    pub fn heartbeat(&self, id: WorldServerId) -> Result<(), RegistryError> {
        let mut server = self.servers.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        touch(&mut server);
        Ok(())
    }

    /// Removes the server. Cells it owned read as unassigned from now on;
    /// use [`crate::CellOwnershipRegistry::deregister_server`] to also clear them.
    pub fn deregister(&self, id: WorldServerId) -> Result<WorldServer, RegistryError> {
        let (_, server) = self.servers.remove(&id).ok_or(RegistryError::NotFound(id))?;
        tracing::info!(server = %id, "world server deregistered");
        Ok(server)
    }

    pub fn get(&self, id: WorldServerId) -> Result<WorldServer, RegistryError> {
        self.servers
            .get(&id)
            .map(|server| server.clone())
            .ok_or(RegistryError::NotFound(id))
    }

    pub fn contains(&self, id: WorldServerId) -> bool {
        self.servers.contains_key(&id)
    }

    pub fn servers(&self) -> Vec<WorldServer> {
        let mut servers: Vec<_> = self.servers.iter().map(|entry| entry.clone()).collect();
        servers.sort_by_key(|server| server.id);
        servers
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Downgrades servers whose last heartbeat is older than `timeout`
    /// (`Suspected`) or `2 * timeout` (`Dead`). Returns the servers whose
    /// status changed. Nothing is removed and no cell is reassigned.
    pub fn sweep_liveness(
        &self,
        now: Instant,
        timeout: Duration,
    ) -> Vec<(WorldServerId, ServerStatus)> {
        let mut changed = Vec::new();
        for mut server in self.servers.iter_mut() {
            let silent_for = now.saturating_duration_since(server.last_heartbeat);
            let status = if silent_for > timeout * 2 {
                ServerStatus::Dead
            } else if silent_for > timeout {
                ServerStatus::Suspected
            } else {
                ServerStatus::Alive
            };
            if status != server.status {
                tracing::warn!(
                    server = %server.id,
                    ?status,
                    silent_ms = silent_for.as_millis() as u64,
                    "liveness changed"
                );
                server.status = status;
                changed.push((server.id, status));
            }
        }
        changed
    }
}

impl Default for WorldServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn touch(server: &mut WorldServer) {
    server.last_heartbeat = Instant::now();
    if server.status != ServerStatus::Alive {
        tracing::info!(server = %server.id, "world server alive again");
        server.status = ServerStatus::Alive;
    }
}

/// Checks the `scheme://host:port` shape. The endpoint is otherwise opaque.
pub fn validate_rpc_endpoint(endpoint: &str) -> Result<(), RegistryError> {
    let invalid = || RegistryError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
    };

    let (scheme, authority) = endpoint.split_once("://").ok_or_else(invalid)?;
    let scheme_ok = scheme
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic())
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    if !scheme_ok {
        return Err(invalid());
    }

    let (host, port) = authority.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || host.contains('/') {
        return Err(invalid());
    }
    match port.parse::<u16>() {
        Ok(port) if port != 0 => Ok(()),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(n: u8) -> ServerDescriptor {
        ServerDescriptor::new(format!("203.0.113.{n}"), format!("10.0.0.{n}"))
    }

    #[test]
    fn descriptor_reads_launcher_field_names() {
        let descriptor: ServerDescriptor = serde_json::from_value(serde_json::json!({
            "publicAddress": "203.0.113.5",
            "internalAddress": "10.0.0.5",
            "rpcEndpoint": "rpc://10.0.0.5:7777",
            "startingLoad": 4,
        }))
        .unwrap();
        assert_eq!(descriptor.rpc_endpoint.as_deref(), Some("rpc://10.0.0.5:7777"));
        assert_eq!(descriptor.starting_load, Some(4));

        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["rpcEndpoint"], "rpc://10.0.0.5:7777");
    }

    #[test]
    fn register_assigns_increasing_nonzero_ids() {
        let registry = WorldServerRegistry::new();
        let a = registry.register(descriptor(1)).unwrap();
        let b = registry.register(descriptor(2)).unwrap();
        assert!(a.is_valid());
        assert!(b.0 > a.0);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn register_requires_addresses_and_load() {
        let registry = WorldServerRegistry::new();

        let mut missing_public = descriptor(1);
        missing_public.public_address.clear();
        assert!(matches!(
            registry.register(missing_public),
            Err(RegistryError::InvalidDescriptor { .. })
        ));

        let mut missing_internal = descriptor(1);
        missing_internal.internal_address = "  ".to_string();
        assert!(matches!(
            registry.register(missing_internal),
            Err(RegistryError::InvalidDescriptor { .. })
        ));

        let mut missing_load = descriptor(1);
        missing_load.starting_load = None;
        assert!(matches!(
            registry.register(missing_load),
            Err(RegistryError::InvalidDescriptor { .. })
        ));

        assert!(registry.is_empty());
    }

    #[test]
    fn update_endpoint_is_idempotent_overwrite() {
        let registry = WorldServerRegistry::new();
        let id = registry.register(descriptor(5)).unwrap();

        registry.update_endpoint(id, "rpc://10.0.0.5:7777").unwrap();
        registry.update_endpoint(id, "rpc://10.0.0.5:7777").unwrap();
        assert_eq!(
            registry.get(id).unwrap().reachable_endpoint(),
            Some("rpc://10.0.0.5:7777")
        );

        registry.update_endpoint(id, "grpc://10.0.0.5:50051").unwrap();
        assert_eq!(
            registry.get(id).unwrap().rpc_endpoint.as_deref(),
            Some("grpc://10.0.0.5:50051")
        );
    }

    #[test]
    fn update_endpoint_unknown_server() {
        let registry = WorldServerRegistry::new();
        assert_eq!(
            registry.update_endpoint(WorldServerId(42), "rpc://10.0.0.1:7777"),
            Err(RegistryError::NotFound(WorldServerId(42)))
        );
    }

    #[test]
    fn endpoint_shape_is_checked() {
        assert!(validate_rpc_endpoint("rpc://10.0.0.3:7777").is_ok());
        assert!(validate_rpc_endpoint("grpc://[::1]:50051").is_ok());
        assert!(validate_rpc_endpoint("10.0.0.3:7777").is_err());
        assert!(validate_rpc_endpoint("rpc://10.0.0.3").is_err());
        assert!(validate_rpc_endpoint("rpc://:7777").is_err());
        assert!(validate_rpc_endpoint("rpc://host:0").is_err());
        assert!(validate_rpc_endpoint("://host:7777").is_err());
    }

    #[test]
    fn update_load_last_write_wins() {
        let registry = WorldServerRegistry::new();
        let id = registry.register(descriptor(1).with_starting_load(10)).unwrap();
        registry.update_load(id, 50).unwrap();
        registry.update_load(id, 3).unwrap();
        assert_eq!(registry.get(id).unwrap().load, 3);
    }

    #[test]
    fn deregister_removes_server() {
        let registry = WorldServerRegistry::new();
        let id = registry.register(descriptor(1)).unwrap();
        assert_eq!(registry.deregister(id).unwrap().id, id);
        assert_eq!(registry.get(id), Err(RegistryError::NotFound(id)));
        assert_eq!(registry.deregister(id), Err(RegistryError::NotFound(id)));
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_degrades_without_heartbeats() {
        let registry = WorldServerRegistry::new();
        let quiet = registry.register(descriptor(1)).unwrap();
        let chatty = registry.register(descriptor(2)).unwrap();
        let timeout = Duration::from_secs(10);

        tokio::time::advance(Duration::from_secs(11)).await;
        registry.heartbeat(chatty).unwrap();
        let changed = registry.sweep_liveness(Instant::now(), timeout);
        assert_eq!(changed, vec![(quiet, ServerStatus::Suspected)]);

        tokio::time::advance(Duration::from_secs(11)).await;
        registry.sweep_liveness(Instant::now(), timeout);
        assert_eq!(registry.get(quiet).unwrap().status, ServerStatus::Dead);
        assert_eq!(registry.get(chatty).unwrap().status, ServerStatus::Suspected);

        registry.update_load(quiet, 1).unwrap();
        assert_eq!(registry.get(quiet).unwrap().status, ServerStatus::Alive);
    }
}
