//! The coordinator core.
//!
//! [`SwServer`] owns every table: registrations (keyed by scope, with an id
//! index), job queues, workers, clients and connections. All mutation happens
//! through `&mut self` on one logical thread; the tokio driver in
//! [`crate::runtime`] feeds it one event at a time.
//!
//! The implementation is split by concern:
//!
//! - `jobs`: scheduling and running register/update/unregister jobs
//! - `lifecycle`: worker start, install, activate, termination
//! - `clients`: client registry, claim, matchAll, idle timers, ready requests

mod clients;
mod jobs;
mod lifecycle;

use crate::clients::ClientRegistry;
use crate::config::SwServerConfig;
use crate::connection::{ClientMessage, ClientTransport, Connection, ContextTransport};
use crate::job::{JobData, JobQueue};
use crate::registration::Registration;
use crate::store::{open_store, RegistrationRecord, RegistrationStore};
use crate::types::{
    ClientData, ClientId, ConnectionId, FetchResult, JobId, RegistrationData, RegistrationId,
    RegistrationKey, RegistrationState, SecurityOriginData, SessionId, WorkerId,
};
use crate::worker::Worker;
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use url::Url;

pub use lifecycle::TerminationMode;

/// Callback for [`SwServer::run_service_worker_if_necessary`]; receives
/// whether the worker is running.
pub type RunWorkerCallback = Box<dyn FnOnce(bool) + Send>;

// ==================== Inbound messages ====================

/// Messages a client process sends to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientRequest {
    ScheduleJob(JobData),
    FinishFetchingScript(FetchResult),
    DidResolveRegistrationPromise(RegistrationKey),
    AddRegistrationInterest(RegistrationId),
    RemoveRegistrationInterest(RegistrationId),
    SyncTerminateWorker(WorkerId),
    WhenRegistrationReady {
        request_id: u64,
        top_origin: SecurityOriginData,
        client_url: Url,
    },
    MatchRegistration {
        request_id: u64,
        top_origin: SecurityOriginData,
        client_url: Url,
    },
    GetRegistrations {
        request_id: u64,
        top_origin: SecurityOriginData,
        client_url: Url,
    },
    RegisterClient {
        top_origin: SecurityOriginData,
        client: ClientData,
        controller: Option<WorkerId>,
    },
    UnregisterClient(ClientId),
}

/// Events the worker execution engine reports to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ContextEvent {
    ScriptContextStarted {
        job_id: Option<JobId>,
        worker_id: WorkerId,
    },
    ScriptContextFailedToStart {
        job_id: Option<JobId>,
        worker_id: WorkerId,
        message: String,
    },
    DidFinishInstall {
        job_id: Option<JobId>,
        worker_id: WorkerId,
        success: bool,
    },
    DidFinishActivation(WorkerId),
    /// The context started with `generation` is gone.
    WorkerTerminated {
        worker_id: WorkerId,
        generation: u64,
    },
    SkipWaiting(WorkerId),
}

// ==================== Notices ====================

/// Coordinator-level events for the embedder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerNotice {
    /// The registration store was imported; jobs are now processed.
    ImportComplete { registrations: usize },
    /// The store failed; registrations are memory-only from now on.
    PersistenceUnavailable { reason: String },
}

/// State of the persistence collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceStatus {
    /// Import has not completed; jobs are held.
    Importing,
    Ready,
    /// The store failed; nothing is written any more.
    Degraded,
}

// ==================== Server ====================

/// Service worker registration and lifecycle coordinator for one session.
pub struct SwServer {
    session: SessionId,
    config: SwServerConfig,
    connections: HashMap<ConnectionId, Connection>,
    registrations: HashMap<RegistrationKey, Registration>,
    registrations_by_id: HashMap<RegistrationId, RegistrationKey>,
    /// Unregistered registrations whose active worker still controls clients.
    uninstalling: HashMap<RegistrationId, Registration>,
    job_queues: HashMap<RegistrationKey, JobQueue>,
    workers: HashMap<WorkerId, Worker>,
    clients: ClientRegistry,
    context: Box<dyn ContextTransport>,
    store: Box<dyn RegistrationStore>,
    persistence: PersistenceStatus,
    /// Jobs scheduled before the import completed, in arrival order.
    pending_jobs: Vec<JobData>,
    run_requests: HashMap<WorkerId, Vec<RunWorkerCallback>>,
    notices: mpsc::UnboundedSender<ServerNotice>,
}

impl SwServer {
    /// Create a coordinator. Jobs are held until [`Self::import_registrations`]
    /// has run.
    pub fn new(
        session: SessionId,
        config: SwServerConfig,
        context: Box<dyn ContextTransport>,
        store: Box<dyn RegistrationStore>,
    ) -> (Self, mpsc::UnboundedReceiver<ServerNotice>) {
        let (notices, rx) = mpsc::unbounded_channel();
        let server = Self {
            session,
            config,
            connections: HashMap::new(),
            registrations: HashMap::new(),
            registrations_by_id: HashMap::new(),
            uninstalling: HashMap::new(),
            job_queues: HashMap::new(),
            workers: HashMap::new(),
            clients: ClientRegistry::new(),
            context,
            store,
            persistence: PersistenceStatus::Importing,
            pending_jobs: Vec::new(),
            run_requests: HashMap::new(),
            notices,
        };
        (server, rx)
    }

    /// Create a coordinator whose store is picked from the configuration.
    pub fn from_config(
        session: SessionId,
        config: SwServerConfig,
        context: Box<dyn ContextTransport>,
    ) -> (Self, mpsc::UnboundedReceiver<ServerNotice>) {
        let store = open_store(config.registration_database_directory.as_deref());
        Self::new(session, config, context, store)
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn config(&self) -> &SwServerConfig {
        &self.config
    }

    pub fn persistence_status(&self) -> PersistenceStatus {
        self.persistence
    }

    pub fn is_import_completed(&self) -> bool {
        self.persistence != PersistenceStatus::Importing
    }

    /// Live registration for a key.
    pub fn registration(&self, key: &RegistrationKey) -> Option<&Registration> {
        self.registrations.get(key)
    }

    /// Registration by id, including unregistered ones still in use.
    pub fn registration_by_id(&self, id: RegistrationId) -> Option<&Registration> {
        match self.registrations_by_id.get(&id) {
            Some(key) => self.registrations.get(key),
            None => self.uninstalling.get(&id),
        }
    }

    pub fn registration_data(&self, id: RegistrationId) -> Option<RegistrationData> {
        self.registration_by_id(id)
            .map(|registration| registration.data(&self.workers))
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.len()
    }

    pub fn worker(&self, id: WorkerId) -> Option<&Worker> {
        self.workers.get(&id)
    }

    pub fn job_queue(&self, key: &RegistrationKey) -> Option<&JobQueue> {
        self.job_queues.get(key)
    }

    pub fn job_queue_count(&self) -> usize {
        self.job_queues.len()
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Registration-ready requests still waiting for an active worker.
    pub fn pending_ready_requests(&self) -> usize {
        self.connections
            .values()
            .map(Connection::ready_request_count)
            .sum()
    }

    // ==================== Connections ====================

    /// Register a client process and return its connection id.
    pub fn register_connection(&mut self, transport: Box<dyn ClientTransport>) -> ConnectionId {
        let id = ConnectionId::new();
        self.connections.insert(id, Connection::new(id, transport));
        info!(connection = %id, session = %self.session, "Connection registered");
        id
    }

    /// Tear down a client process connection.
    ///
    /// Its clients are unregistered, its queued jobs are rejected with
    /// `ConnectionClosed` and a job it is fetching a script for fails.
    pub fn unregister_connection(&mut self, id: ConnectionId) {
        let Some(mut connection) = self.connections.remove(&id) else {
            return;
        };
        info!(connection = %id, "Connection closed");

        for client in connection.take_clients() {
            self.remove_client(client);
        }
        for registration in self
            .registrations
            .values_mut()
            .chain(self.uninstalling.values_mut())
        {
            registration.drop_connection(id);
        }
        self.pending_jobs.retain(|job| job.connection() != id);

        let keys: Vec<RegistrationKey> = self.job_queues.keys().cloned().collect();
        for key in keys {
            self.connection_closed_for_queue(&key, id);
        }
    }

    fn send_to(&mut self, connection: ConnectionId, message: ClientMessage) {
        match self.connections.get_mut(&connection) {
            Some(connection) => connection.send(message),
            None => trace!(%connection, "Connection gone, dropping message"),
        }
    }

    /// Send `message` to every connection holding the registration.
    fn broadcast(&mut self, registration_id: RegistrationId, message: ClientMessage) {
        let targets = match self.registration_by_id(registration_id) {
            Some(registration) => registration.interested_connections(),
            None => return,
        };
        for connection in targets {
            if let Some(connection) = self.connections.get_mut(&connection) {
                connection.send(message.clone());
            }
        }
    }

    fn registration_mut(&mut self, id: RegistrationId) -> Option<&mut Registration> {
        match self.registrations_by_id.get(&id) {
            Some(key) => self.registrations.get_mut(key),
            None => self.uninstalling.get_mut(&id),
        }
    }

    pub fn add_registration_interest(&mut self, connection: ConnectionId, id: RegistrationId) {
        if let Some(registration) = self.registration_mut(id) {
            registration.add_interest(connection);
        }
    }

    pub fn remove_registration_interest(&mut self, connection: ConnectionId, id: RegistrationId) {
        if let Some(registration) = self.registration_mut(id) {
            registration.remove_interest(connection);
        }
    }

    // ==================== Matching ====================

    /// The registration with the longest scope matching `client_url`.
    pub fn do_registration_matching(
        &self,
        top_origin: &SecurityOriginData,
        client_url: &Url,
    ) -> Option<RegistrationId> {
        find_matching_registration(&self.registrations, top_origin, client_url)
    }

    pub fn match_registration(
        &self,
        top_origin: &SecurityOriginData,
        client_url: &Url,
    ) -> Option<RegistrationData> {
        self.do_registration_matching(top_origin, client_url)
            .and_then(|id| self.registration_data(id))
    }

    /// Every registration visible to a client, in no particular order.
    pub fn get_registrations(
        &self,
        top_origin: &SecurityOriginData,
        client_url: &Url,
    ) -> Vec<RegistrationData> {
        let client_origin = SecurityOriginData::from_url(client_url);
        self.registrations
            .values()
            .filter(|registration| {
                registration.key().top_origin == *top_origin
                    && client_origin.contains(registration.scope_url())
            })
            .map(|registration| registration.data(&self.workers))
            .collect()
    }

    pub fn get_origins_with_registrations(&self) -> HashSet<SecurityOriginData> {
        let mut origins = HashSet::new();
        for key in self.registrations.keys() {
            origins.insert(key.top_origin.clone());
            origins.insert(SecurityOriginData::from_url(&key.scope));
        }
        origins
    }

    // ==================== Persistence ====================

    /// Load every stored registration, then release held jobs.
    pub fn import_registrations(&mut self) {
        if self.is_import_completed() {
            return;
        }
        match self.store.load() {
            Ok(records) => {
                for record in records {
                    self.add_registration_from_store(record);
                }
            }
            Err(e) => self.registration_store_database_failed_to_open(&e.to_string()),
        }
        self.registration_store_import_complete();
    }

    /// Recreate a registration with an activated, stopped worker.
    pub fn add_registration_from_store(&mut self, record: RegistrationRecord) {
        if self.registrations.contains_key(&record.key) {
            warn!(key = %record.key, "Duplicate stored registration ignored");
            return;
        }
        let mut registration = Registration::new(record.key.clone(), record.update_via_cache);
        if let Some(time) = record.last_update_time {
            registration.set_last_update_time(time);
        }
        let worker = Worker::restored(
            registration.id(),
            record.key.clone(),
            record.script_url,
            record.script,
            record.policy,
            record.worker_type,
        );
        registration.set_slot(RegistrationState::Active, Some(worker.id()));
        debug!(registration = %registration.id(), key = %record.key, "Registration imported");

        self.workers.insert(worker.id(), worker);
        self.registrations_by_id
            .insert(registration.id(), record.key.clone());
        self.registrations.insert(record.key, registration);
    }

    pub fn registration_store_import_complete(&mut self) {
        if self.persistence == PersistenceStatus::Importing {
            self.persistence = PersistenceStatus::Ready;
        }
        let registrations = self.registrations.len();
        info!(registrations, status = ?self.persistence, "Registration import complete");
        let _ = self
            .notices
            .send(ServerNotice::ImportComplete { registrations });

        for job in std::mem::take(&mut self.pending_jobs) {
            self.schedule_job(job);
        }
    }

    pub fn registration_store_database_failed_to_open(&mut self, reason: &str) {
        self.enter_degraded(reason);
    }

    fn enter_degraded(&mut self, reason: &str) {
        if self.persistence == PersistenceStatus::Degraded {
            return;
        }
        error!(%reason, "Registration store unavailable, registrations are memory-only");
        self.persistence = PersistenceStatus::Degraded;
        let _ = self.notices.send(ServerNotice::PersistenceUnavailable {
            reason: reason.to_string(),
        });
    }

    fn persist_registration(&mut self, id: RegistrationId) {
        if self.persistence != PersistenceStatus::Ready {
            return;
        }
        let Some(key) = self.registrations_by_id.get(&id) else {
            return;
        };
        let Some(registration) = self.registrations.get(key) else {
            return;
        };
        let Some(worker) = registration.active().and_then(|w| self.workers.get(&w)) else {
            return;
        };
        let record = RegistrationRecord {
            key: key.clone(),
            update_via_cache: registration.update_via_cache(),
            last_update_time: registration.last_update_time(),
            script_url: worker.script_url().clone(),
            script: worker.script().to_string(),
            policy: worker.policy().clone(),
            worker_type: worker.worker_type(),
        };
        trace!(registration = %id, "Persisting registration");
        if let Err(e) = self.store.update_registration(record) {
            self.enter_degraded(&e.to_string());
        }
    }

    fn forget_registration_record(&mut self, key: &RegistrationKey) {
        if self.persistence != PersistenceStatus::Ready {
            return;
        }
        if let Err(e) = self.store.remove_registration(key) {
            self.enter_degraded(&e.to_string());
        }
    }

    // ==================== Clearing ====================

    /// Remove every registration, cancelling their jobs and stopping their
    /// workers.
    pub fn clear_all(&mut self) {
        let keys = self.affected_keys(|_| true);
        info!(registrations = keys.len(), "Clearing all registrations");
        self.clear_keys(keys);

        let ids: Vec<RegistrationId> = self.uninstalling.keys().copied().collect();
        for id in ids {
            self.clear_uninstalling(id, TerminationMode::Synchronous);
        }

        if self.persistence == PersistenceStatus::Ready {
            if let Err(e) = self.store.clear_all() {
                self.enter_degraded(&e.to_string());
            }
        }
    }

    /// Remove every registration whose top origin or scope belongs to `origin`.
    pub fn clear_origin(&mut self, origin: &SecurityOriginData) {
        let belongs = |key: &RegistrationKey| key.top_origin == *origin || origin.contains(&key.scope);
        let keys = self.affected_keys(belongs);
        info!(%origin, registrations = keys.len(), "Clearing registrations for origin");
        self.clear_keys(keys);

        let ids: Vec<RegistrationId> = self
            .uninstalling
            .iter()
            .filter(|(_, registration)| belongs(registration.key()))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.clear_uninstalling(id, TerminationMode::Synchronous);
        }
    }

    fn affected_keys(&self, belongs: impl Fn(&RegistrationKey) -> bool) -> Vec<RegistrationKey> {
        let mut keys: Vec<RegistrationKey> = self
            .registrations
            .keys()
            .chain(self.job_queues.keys())
            .filter(|key| belongs(key))
            .cloned()
            .collect();
        keys.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
        keys.dedup();
        keys
    }

    fn clear_keys(&mut self, keys: Vec<RegistrationKey>) {
        for key in keys {
            self.abort_jobs(&key, "registration data was cleared");
            self.remove_registration(&key, TerminationMode::Synchronous);
            self.drop_queue_if_idle(&key);
        }
    }

    // ==================== Dispatch ====================

    /// Handle one message from a client process.
    pub fn handle_client_request(&mut self, connection: ConnectionId, request: ClientRequest) {
        if !self.connections.contains_key(&connection) {
            warn!(%connection, "Request from unknown connection ignored");
            return;
        }
        match request {
            ClientRequest::ScheduleJob(job) => {
                if job.connection() != connection {
                    warn!(%connection, job = %job.id, "Job submitted for another connection");
                    return;
                }
                self.schedule_job(job);
            }
            ClientRequest::FinishFetchingScript(result) => {
                self.finish_fetching_script(connection, result)
            }
            ClientRequest::DidResolveRegistrationPromise(key) => {
                self.did_resolve_registration_promise(connection, &key)
            }
            ClientRequest::AddRegistrationInterest(id) => {
                self.add_registration_interest(connection, id)
            }
            ClientRequest::RemoveRegistrationInterest(id) => {
                self.remove_registration_interest(connection, id)
            }
            ClientRequest::SyncTerminateWorker(worker) => {
                if let Err(e) = self.sync_terminate_worker(worker) {
                    warn!(%worker, error = %e, "Synchronous termination failed");
                }
            }
            ClientRequest::WhenRegistrationReady {
                request_id,
                top_origin,
                client_url,
            } => self.when_registration_ready(connection, request_id, top_origin, client_url),
            ClientRequest::MatchRegistration {
                request_id,
                top_origin,
                client_url,
            } => {
                let registration = self.match_registration(&top_origin, &client_url);
                self.send_to(
                    connection,
                    ClientMessage::DidMatchRegistration {
                        request_id,
                        registration,
                    },
                );
            }
            ClientRequest::GetRegistrations {
                request_id,
                top_origin,
                client_url,
            } => {
                let registrations = self.get_registrations(&top_origin, &client_url);
                self.send_to(
                    connection,
                    ClientMessage::DidGetRegistrations {
                        request_id,
                        registrations,
                    },
                );
            }
            ClientRequest::RegisterClient {
                top_origin,
                client,
                controller,
            } => self.register_service_worker_client(connection, top_origin, client, controller),
            ClientRequest::UnregisterClient(client) => {
                self.unregister_service_worker_client(connection, client)
            }
        }
    }

    /// Handle one event from the worker execution engine.
    pub fn handle_context_event(&mut self, event: ContextEvent) {
        match event {
            ContextEvent::ScriptContextStarted { job_id, worker_id } => {
                self.script_context_started(job_id, worker_id)
            }
            ContextEvent::ScriptContextFailedToStart {
                job_id,
                worker_id,
                message,
            } => self.script_context_failed_to_start(job_id, worker_id, &message),
            ContextEvent::DidFinishInstall {
                job_id,
                worker_id,
                success,
            } => self.did_finish_install(job_id, worker_id, success),
            ContextEvent::DidFinishActivation(worker) => self.did_finish_activation(worker),
            ContextEvent::WorkerTerminated {
                worker_id,
                generation,
            } => self.context_terminated(worker_id, generation),
            ContextEvent::SkipWaiting(worker) => self.skip_waiting(worker),
        }
    }
}

/// Longest-scope match among live registrations.
fn find_matching_registration(
    registrations: &HashMap<RegistrationKey, Registration>,
    top_origin: &SecurityOriginData,
    client_url: &Url,
) -> Option<RegistrationId> {
    registrations
        .iter()
        .filter(|(key, _)| key.is_matching(top_origin, client_url))
        .max_by_key(|(key, _)| key.scope_length())
        .map(|(_, registration)| registration.id())
}

impl std::fmt::Debug for SwServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwServer")
            .field("session", &self.session)
            .field("persistence", &self.persistence)
            .field("connections", &self.connections.len())
            .field("registrations", &self.registrations.len())
            .field("job_queues", &self.job_queues.len())
            .field("workers", &self.workers.len())
            .field("clients", &self.clients.len())
            .finish()
    }
}
