//! Owner of every coordinator in the process, one per session.
//!
//! Broadcast operations (clearing website data, losing the engine) iterate
//! the pool explicitly.

use crate::server::SwServer;
use crate::types::{SecurityOriginData, SessionId};
use hashbrown::{HashMap, HashSet};
use tracing::info;

/// Coordinators keyed by session.
#[derive(Debug, Default)]
pub struct SwServerPool {
    servers: HashMap<SessionId, SwServer>,
}

impl SwServerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a coordinator, returning the one it replaces for the same session.
    pub fn insert(&mut self, server: SwServer) -> Option<SwServer> {
        self.servers.insert(server.session(), server)
    }

    pub fn remove(&mut self, session: SessionId) -> Option<SwServer> {
        self.servers.remove(&session)
    }

    pub fn get(&self, session: SessionId) -> Option<&SwServer> {
        self.servers.get(&session)
    }

    pub fn get_mut(&mut self, session: SessionId) -> Option<&mut SwServer> {
        self.servers.get_mut(&session)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        self.servers.keys().copied().collect()
    }

    pub fn clear_all(&mut self) {
        info!(servers = self.servers.len(), "Clearing registrations in every session");
        for server in self.servers.values_mut() {
            server.clear_all();
        }
    }

    pub fn clear_origin(&mut self, origin: &SecurityOriginData) {
        for server in self.servers.values_mut() {
            server.clear_origin(origin);
        }
    }

    pub fn mark_all_workers_as_terminated(&mut self) {
        for server in self.servers.values_mut() {
            server.mark_all_workers_as_terminated();
        }
    }

    pub fn get_origins_with_registrations(&self) -> HashSet<SecurityOriginData> {
        self.servers
            .values()
            .flat_map(|server| server.get_origins_with_registrations())
            .collect()
    }
}
