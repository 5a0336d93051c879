//! Client registry: pages and workers known to the coordinator, grouped by origin.

use crate::types::{ClientData, ClientId, ClientOrigin, WorkerId};
use hashbrown::HashMap;
use std::time::Instant;

/// A registered client and its controller.
#[derive(Debug, Clone)]
pub struct RegisteredClient {
    pub origin: ClientOrigin,
    pub data: ClientData,
    pub controller: Option<WorkerId>,
}

/// Clients of one origin plus the idle-termination deadline armed when the
/// group empties.
#[derive(Debug, Default)]
struct OriginClients {
    identifiers: Vec<ClientId>,
    idle_deadline: Option<Instant>,
}

/// Client registry.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    per_origin: HashMap<ClientOrigin, OriginClients>,
    clients: HashMap<ClientId, RegisteredClient>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client, cancelling any pending idle deadline for its origin.
    pub fn register(&mut self, origin: ClientOrigin, data: ClientData, controller: Option<WorkerId>) {
        let id = data.id;
        let group = self.per_origin.entry(origin.clone()).or_default();
        group.idle_deadline = None;
        if !group.identifiers.contains(&id) {
            group.identifiers.push(id);
        }
        self.clients.insert(
            id,
            RegisteredClient {
                origin,
                data,
                controller,
            },
        );
    }

    /// Remove a client. Arms the origin's idle deadline at `idle_deadline`
    /// when it was the last client of that origin.
    pub fn unregister(&mut self, id: ClientId, idle_deadline: Instant) -> Option<RegisteredClient> {
        let client = self.clients.remove(&id)?;
        if let Some(group) = self.per_origin.get_mut(&client.origin) {
            group.identifiers.retain(|other| *other != id);
            if group.identifiers.is_empty() {
                group.idle_deadline = Some(idle_deadline);
            }
        }
        Some(client)
    }

    pub fn get(&self, id: ClientId) -> Option<&RegisteredClient> {
        self.clients.get(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn controller_of(&self, id: ClientId) -> Option<WorkerId> {
        self.clients.get(&id).and_then(|client| client.controller)
    }

    /// Set a client's controller, returning the previous one.
    pub fn set_controller(&mut self, id: ClientId, worker: Option<WorkerId>) -> Option<WorkerId> {
        self.clients
            .get_mut(&id)
            .and_then(|client| std::mem::replace(&mut client.controller, worker))
    }

    pub fn controlled_by(&self, worker: WorkerId) -> Vec<ClientId> {
        self.clients
            .values()
            .filter(|client| client.controller == Some(worker))
            .map(|client| client.data.id)
            .collect()
    }

    pub fn has_clients_controlled_by(&self, worker: WorkerId) -> bool {
        self.clients
            .values()
            .any(|client| client.controller == Some(worker))
    }

    /// Clients of one origin, in registration order.
    pub fn clients_for_origin(&self, origin: &ClientOrigin) -> Vec<&RegisteredClient> {
        self.per_origin
            .get(origin)
            .map(|group| {
                group
                    .identifiers
                    .iter()
                    .filter_map(|id| self.clients.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_clients_for_origin(&self, origin: &ClientOrigin) -> bool {
        self.per_origin
            .get(origin)
            .map_or(false, |group| !group.identifiers.is_empty())
    }

    pub fn next_idle_deadline(&self) -> Option<Instant> {
        self.per_origin
            .values()
            .filter_map(|group| group.idle_deadline)
            .min()
    }

    /// Drop every empty origin group whose deadline has passed and return
    /// those origins.
    pub fn take_due_idle_origins(&mut self, now: Instant) -> Vec<ClientOrigin> {
        let due: Vec<ClientOrigin> = self
            .per_origin
            .iter()
            .filter(|(_, group)| {
                group.identifiers.is_empty()
                    && group.idle_deadline.map_or(false, |deadline| deadline <= now)
            })
            .map(|(origin, _)| origin.clone())
            .collect();
        for origin in &due {
            self.per_origin.remove(origin);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClientType, ConnectionId, FrameType, SecurityOriginData};
    use std::time::Duration;
    use url::Url;

    fn origin(host: &str) -> ClientOrigin {
        let url = Url::parse(&format!("https://{}/", host)).unwrap();
        let origin = SecurityOriginData::from_url(&url);
        ClientOrigin {
            top_origin: origin.clone(),
            client_origin: origin,
        }
    }

    fn client(connection: ConnectionId, context: u64, host: &str) -> ClientData {
        ClientData {
            id: ClientId::new(connection, context),
            url: Url::parse(&format!("https://{}/page", host)).unwrap(),
            client_type: ClientType::Window,
            frame_type: FrameType::TopLevel,
        }
    }

    #[test]
    fn test_register_and_group() {
        let conn = ConnectionId::new();
        let mut registry = ClientRegistry::new();
        registry.register(origin("a.com"), client(conn, 1, "a.com"), None);
        registry.register(origin("a.com"), client(conn, 2, "a.com"), None);
        registry.register(origin("b.com"), client(conn, 3, "b.com"), None);

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.clients_for_origin(&origin("a.com")).len(), 2);
        assert!(registry.has_clients_for_origin(&origin("b.com")));
    }

    #[test]
    fn test_idle_deadline_armed_and_cancelled() {
        let conn = ConnectionId::new();
        let mut registry = ClientRegistry::new();
        let now = Instant::now();
        let deadline = now + Duration::from_secs(10);

        registry.register(origin("a.com"), client(conn, 1, "a.com"), None);
        registry.unregister(ClientId::new(conn, 1), deadline);
        assert_eq!(registry.next_idle_deadline(), Some(deadline));

        registry.register(origin("a.com"), client(conn, 2, "a.com"), None);
        assert_eq!(registry.next_idle_deadline(), None);
    }

    #[test]
    fn test_take_due_idle_origins() {
        let conn = ConnectionId::new();
        let mut registry = ClientRegistry::new();
        let now = Instant::now();

        registry.register(origin("a.com"), client(conn, 1, "a.com"), None);
        registry.unregister(ClientId::new(conn, 1), now + Duration::from_secs(5));

        assert!(registry.take_due_idle_origins(now).is_empty());
        let due = registry.take_due_idle_origins(now + Duration::from_secs(5));
        assert_eq!(due, vec![origin("a.com")]);
        assert_eq!(registry.next_idle_deadline(), None);
    }

    #[test]
    fn test_controllers() {
        let conn = ConnectionId::new();
        let worker = WorkerId::new();
        let mut registry = ClientRegistry::new();
        registry.register(origin("a.com"), client(conn, 1, "a.com"), Some(worker));
        registry.register(origin("a.com"), client(conn, 2, "a.com"), None);

        assert!(registry.has_clients_controlled_by(worker));
        assert_eq!(registry.controlled_by(worker), vec![ClientId::new(conn, 1)]);

        let previous = registry.set_controller(ClientId::new(conn, 2), Some(worker));
        assert_eq!(previous, None);
        assert_eq!(registry.controlled_by(worker).len(), 2);
    }
}
