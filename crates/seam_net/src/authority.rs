//! Authority management
//!
//! Determines which world server owns which cell. Ownership changes are rare
//! (deploys, rebalances) while reads happen on every boundary crossing, so
//! cells live in a sharded concurrent map and a reassignment only ever locks
//! the shard holding that one cell.
//!
//! Known limitation: the registry is single-tenant. Cell ids are not scoped
//! by tenant, so two tenants naming a cell `"A07"` share one ownership record.
//! Run one registry per tenant until ids carry a tenant scope.

use crate::world_server::{RegistryError, ServerStatus, WorldServer, WorldServerRegistry};
use crate::{CellId, MapInstanceId, WorldServerId};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Ownership record for one cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridCell {
    pub id: CellId,
    pub owner: Option<WorldServerId>,
    pub map_instance: MapInstanceId,
}

/// A cell owner joined with the server's registry entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOwner {
    pub server_id: WorldServerId,
    pub rpc_endpoint: Option<String>,
    pub load: u32,
    pub status: ServerStatus,
    pub public_address: String,
    pub internal_address: String,
    pub map_instance: MapInstanceId,
}

impl ResolvedOwner {
    fn new(server: WorldServer, map_instance: MapInstanceId) -> Self {
        Self {
            server_id: server.id,
            rpc_endpoint: server.reachable_endpoint().map(str::to_string),
            load: server.load,
            status: server.status,
            public_address: server.public_address,
            internal_address: server.internal_address,
            map_instance,
        }
    }
}

/// Result of resolving a single cell in a batch lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CellResolution {
    Assigned(ResolvedOwner),
    Unassigned,
}

impl CellResolution {
    pub fn owner(&self) -> Option<&ResolvedOwner> {
        match self {
            Self::Assigned(owner) => Some(owner),
            Self::Unassigned => None,
        }
    }
}

/// Cell → owning world server
pub struct CellOwnershipRegistry {
    servers: Arc<WorldServerRegistry>,
    cells: DashMap<CellId, GridCell>,
}

impl CellOwnershipRegistry {
    pub fn new(servers: Arc<WorldServerRegistry>) -> Self {
        Self {
            servers,
            cells: DashMap::new(),
        }
    }

    pub fn servers(&self) -> &Arc<WorldServerRegistry> {
        &self.servers
    }

    /// Last-writer-wins upsert. Readers see either the previous or the new
    /// owner, never an empty cell in between. Returns the previous owner.
    pub fn assign(
        &self,
        cell: CellId,
        server: WorldServerId,
        map_instance: MapInstanceId,
    ) -> Option<WorldServerId> {
        if !self.servers.contains(server) {
            tracing::warn!(cell = %cell, server = %server, "assigning cell to unregistered server");
        }

        let previous = self
            .cells
            .insert(
                cell.clone(),
                GridCell {
                    id: cell.clone(),
                    owner: Some(server),
                    map_instance,
                },
            )
            .and_then(|old| old.owner);

        tracing::info!(cell = %cell, server = %server, ?previous, "cell assigned");
        previous
    }

    /// Sets the owner to unassigned, keeping the map instance. Returns the previous owner.
    pub fn clear(&self, cell: &CellId) -> Option<WorldServerId> {
        let previous = self.cells.get_mut(cell).and_then(|mut entry| entry.owner.take());
        if let Some(server) = previous {
            tracing::info!(cell = %cell, server = %server, "cell assignment cleared");
        }
        previous
    }

    pub fn get(&self, cell: &CellId) -> Option<GridCell> {
        self.cells.get(cell).map(|entry| entry.clone())
    }

    /// Owner of `cell`. An owner that has since deregistered reads as unassigned.
    pub fn owner_of(&self, cell: &CellId) -> Option<WorldServerId> {
        let owner = self.cells.get(cell).and_then(|entry| entry.owner)?;
        self.servers.contains(owner).then_some(owner)
    }

    /// Owner of `cell` joined with its endpoint, load and addresses.
    pub fn resolve(&self, cell: &CellId) -> Option<ResolvedOwner> {
        let (owner, map_instance) = {
            let entry = self.cells.get(cell)?;
            (entry.owner?, entry.map_instance)
        };
        let server = self.servers.get(owner).ok()?;
        Some(ResolvedOwner::new(server, map_instance))
    }

    /// Resolves every requested cell independently. Unknown or unowned cells
    /// get an explicit [`CellResolution::Unassigned`] entry.
    pub fn owners_of<'a, I>(&self, cells: I) -> HashMap<CellId, CellResolution>
    where
        I: IntoIterator<Item = &'a CellId>,
    {
        cells
            .into_iter()
            .map(|cell| {
                let resolution = match self.resolve(cell) {
                    Some(owner) => CellResolution::Assigned(owner),
                    None => CellResolution::Unassigned,
                };
                (cell.clone(), resolution)
            })
            .collect()
    }

    pub fn cells_owned_by(&self, server: WorldServerId) -> HashSet<CellId> {
        self.cells
            .iter()
            .filter(|entry| entry.owner == Some(server))
            .map(|entry| entry.id.clone())
            .collect()
    }

    /// Removes the server and leaves every cell it owned unassigned. Ownership
    /// is not transferred anywhere.
    pub fn deregister_server(&self, server: WorldServerId) -> Result<WorldServer, RegistryError> {
        let removed = self.servers.deregister(server)?;

        let mut orphaned = 0usize;
        for mut entry in self.cells.iter_mut() {
            if entry.owner == Some(server) {
                entry.owner = None;
                orphaned += 1;
            }
        }
        if orphaned > 0 {
            tracing::warn!(server = %server, orphaned, "cells left unassigned by deregistration");
        }

        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}
