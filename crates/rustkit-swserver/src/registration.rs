//! Registration records: one per (top origin, scope).

use crate::types::{
    ConnectionId, RegistrationData, RegistrationId, RegistrationKey, RegistrationState,
    UpdateViaCache, WorkerId,
};
use crate::worker::Worker;
use hashbrown::HashMap;
use std::time::{Duration, SystemTime};
use url::Url;

/// A service worker registration.
///
/// Slots hold worker identifiers; the workers themselves live in the
/// coordinator's worker table. Slot mutation is crate-private so the
/// coordinator can retire displaced workers in one place.
#[derive(Debug, Clone)]
pub struct Registration {
    id: RegistrationId,
    key: RegistrationKey,
    update_via_cache: UpdateViaCache,
    last_update_time: Option<SystemTime>,
    installing: Option<WorkerId>,
    waiting: Option<WorkerId>,
    active: Option<WorkerId>,
    uninstalling: bool,
    /// Connections holding registration objects, counted.
    interested: HashMap<ConnectionId, usize>,
}

impl Registration {
    pub(crate) fn new(key: RegistrationKey, update_via_cache: UpdateViaCache) -> Self {
        Self {
            id: RegistrationId::new(),
            key,
            update_via_cache,
            last_update_time: None,
            installing: None,
            waiting: None,
            active: None,
            uninstalling: false,
            interested: HashMap::new(),
        }
    }

    pub fn id(&self) -> RegistrationId {
        self.id
    }

    pub fn key(&self) -> &RegistrationKey {
        &self.key
    }

    pub fn scope_url(&self) -> &Url {
        &self.key.scope
    }

    pub fn update_via_cache(&self) -> UpdateViaCache {
        self.update_via_cache
    }

    pub fn last_update_time(&self) -> Option<SystemTime> {
        self.last_update_time
    }

    pub fn installing(&self) -> Option<WorkerId> {
        self.installing
    }

    pub fn waiting(&self) -> Option<WorkerId> {
        self.waiting
    }

    pub fn active(&self) -> Option<WorkerId> {
        self.active
    }

    pub fn is_uninstalling(&self) -> bool {
        self.uninstalling
    }

    pub fn slot(&self, state: RegistrationState) -> Option<WorkerId> {
        match state {
            RegistrationState::Installing => self.installing,
            RegistrationState::Waiting => self.waiting,
            RegistrationState::Active => self.active,
        }
    }

    /// Installing, else waiting, else active.
    pub fn newest_worker(&self) -> Option<WorkerId> {
        self.installing.or(self.waiting).or(self.active)
    }

    pub fn holds_worker(&self, worker: WorkerId) -> bool {
        [self.installing, self.waiting, self.active].contains(&Some(worker))
    }

    pub fn workers(&self) -> impl Iterator<Item = WorkerId> + '_ {
        [self.installing, self.waiting, self.active]
            .into_iter()
            .flatten()
    }

    /// Whether a script fetch should bypass the HTTP cache.
    pub fn should_bypass_cache(&self, now: SystemTime, max_age: Duration) -> bool {
        if self.update_via_cache == UpdateViaCache::None {
            return true;
        }
        match self.last_update_time {
            Some(last) => now.duration_since(last).map_or(false, |age| age > max_age),
            None => false,
        }
    }

    /// Replace a slot, returning the previous occupant.
    pub(crate) fn set_slot(
        &mut self,
        state: RegistrationState,
        worker: Option<WorkerId>,
    ) -> Option<WorkerId> {
        let slot = match state {
            RegistrationState::Installing => &mut self.installing,
            RegistrationState::Waiting => &mut self.waiting,
            RegistrationState::Active => &mut self.active,
        };
        std::mem::replace(slot, worker)
    }

    pub(crate) fn set_update_via_cache(&mut self, update_via_cache: UpdateViaCache) {
        self.update_via_cache = update_via_cache;
    }

    pub(crate) fn set_last_update_time(&mut self, time: SystemTime) {
        self.last_update_time = Some(time);
    }

    pub(crate) fn set_uninstalling(&mut self) {
        self.uninstalling = true;
    }

    pub(crate) fn add_interest(&mut self, connection: ConnectionId) {
        *self.interested.entry(connection).or_insert(0) += 1;
    }

    pub(crate) fn remove_interest(&mut self, connection: ConnectionId) {
        if let Some(count) = self.interested.get_mut(&connection) {
            *count -= 1;
            if *count == 0 {
                self.interested.remove(&connection);
            }
        }
    }

    pub(crate) fn drop_connection(&mut self, connection: ConnectionId) {
        self.interested.remove(&connection);
    }

    pub fn interested_connections(&self) -> Vec<ConnectionId> {
        self.interested.keys().copied().collect()
    }

    pub fn data(&self, workers: &HashMap<WorkerId, Worker>) -> RegistrationData {
        let snapshot = |slot: Option<WorkerId>| slot.and_then(|id| workers.get(&id)).map(Worker::data);
        RegistrationData {
            key: self.key.clone(),
            id: self.id,
            scope_url: self.key.scope.clone(),
            update_via_cache: self.update_via_cache,
            last_update_time: self.last_update_time,
            installing: snapshot(self.installing),
            waiting: snapshot(self.waiting),
            active: snapshot(self.active),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SecurityOriginData;

    fn registration() -> Registration {
        let scope = Url::parse("https://example.com/app/").unwrap();
        let key = RegistrationKey::new(SecurityOriginData::from_url(&scope), scope);
        Registration::new(key, UpdateViaCache::Imports)
    }

    #[test]
    fn test_newest_worker_prefers_installing() {
        let mut reg = registration();
        assert!(reg.newest_worker().is_none());

        let active = WorkerId::new();
        let installing = WorkerId::new();
        reg.set_slot(RegistrationState::Active, Some(active));
        assert_eq!(reg.newest_worker(), Some(active));

        reg.set_slot(RegistrationState::Installing, Some(installing));
        assert_eq!(reg.newest_worker(), Some(installing));
        assert!(reg.holds_worker(active));
        assert_eq!(reg.workers().count(), 2);
    }

    #[test]
    fn test_set_slot_returns_previous() {
        let mut reg = registration();
        let first = WorkerId::new();
        let second = WorkerId::new();

        assert_eq!(reg.set_slot(RegistrationState::Waiting, Some(first)), None);
        assert_eq!(reg.set_slot(RegistrationState::Waiting, Some(second)), Some(first));
        assert_eq!(reg.waiting(), Some(second));
    }

    #[test]
    fn test_interest_is_counted() {
        let mut reg = registration();
        let conn = ConnectionId::new();

        reg.add_interest(conn);
        reg.add_interest(conn);
        reg.remove_interest(conn);
        assert_eq!(reg.interested_connections(), vec![conn]);

        reg.remove_interest(conn);
        assert!(reg.interested_connections().is_empty());
    }

    #[test]
    fn test_bypass_cache() {
        let mut reg = registration();
        let now = SystemTime::now();
        let day = Duration::from_secs(86_400);
        assert!(!reg.should_bypass_cache(now, day));

        reg.set_last_update_time(now - Duration::from_secs(90_000));
        assert!(reg.should_bypass_cache(now, day));

        reg.set_last_update_time(now);
        reg.set_update_via_cache(UpdateViaCache::None);
        assert!(reg.should_bypass_cache(now, day));
    }
}
