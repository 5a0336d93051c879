//! Connections between the coordinator and the processes it serves.
//!
//! A client process (pages) is reached through a [`ClientTransport`]; the
//! execution engine that runs worker scripts is reached through a
//! [`ContextTransport`]. Both are tagged-message interfaces: the coordinator
//! never calls back into a transport's owner, it only sends messages.

use crate::error::ServiceWorkerError;
use crate::types::{
    ClientId, ConnectionId, ContextData, FetchCacheMode, JobId, RegistrationData,
    RegistrationId, RegistrationKey, RegistrationState, SecurityOriginData, ServiceWorkerState,
    UpdateViaCache, WorkerData, WorkerId,
};
use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use tokio::sync::mpsc;
use tracing::trace;
use url::Url;

// ==================== Client-bound messages ====================

/// Notifications sent from the coordinator to a client process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    RejectJob {
        job_id: JobId,
        error: ServiceWorkerError,
    },
    ResolveRegistrationJob {
        job_id: JobId,
        registration: RegistrationData,
        notify_when_resolved: bool,
    },
    ResolveUnregistrationJob {
        job_id: JobId,
        key: RegistrationKey,
        unregistered: bool,
    },
    StartScriptFetch {
        job_id: JobId,
        key: RegistrationKey,
        cache_mode: FetchCacheMode,
    },
    UpdateRegistrationState {
        registration_id: RegistrationId,
        state: RegistrationState,
        worker: Option<WorkerData>,
    },
    UpdateWorkerState {
        worker_id: WorkerId,
        state: ServiceWorkerState,
    },
    FireUpdateFound {
        registration_id: RegistrationId,
    },
    SetRegistrationLastUpdateTime {
        registration_id: RegistrationId,
        time: SystemTime,
    },
    SetRegistrationUpdateViaCache {
        registration_id: RegistrationId,
        update_via_cache: UpdateViaCache,
    },
    NotifyClientsOfControllerChange {
        clients: Vec<ClientId>,
        controller: WorkerData,
    },
    RegistrationReady {
        request_id: u64,
        registration: RegistrationData,
    },
    DidMatchRegistration {
        request_id: u64,
        registration: Option<RegistrationData>,
    },
    DidGetRegistrations {
        request_id: u64,
        registrations: Vec<RegistrationData>,
    },
}

/// Transport to one client process.
pub trait ClientTransport: Send {
    fn send(&mut self, message: ClientMessage);
}

/// In-process transport over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelConnection {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl ChannelConnection {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ClientTransport for ChannelConnection {
    fn send(&mut self, message: ClientMessage) {
        if self.tx.send(message).is_err() {
            trace!("Client channel closed, dropping message");
        }
    }
}

// ==================== Context-bound commands ====================

/// Commands sent from the coordinator to the worker execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ContextCommand {
    /// Start a worker's execution context.
    InstallContext(ContextData),
    FireInstallEvent(WorkerId),
    FireActivateEvent(WorkerId),
    /// Stop a worker; completion is reported back as a termination event
    /// carrying the stopped context's generation.
    TerminateWorker(WorkerId),
}

/// Transport to the worker execution engine.
pub trait ContextTransport: Send {
    fn send(&mut self, command: ContextCommand);

    /// Stop a worker and return only once it is no longer running.
    fn sync_terminate_worker(&mut self, worker: WorkerId) -> Result<(), ServiceWorkerError>;
}

/// In-process engine transport over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelContext {
    tx: mpsc::UnboundedSender<ContextCommand>,
}

impl ChannelContext {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ContextCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ContextTransport for ChannelContext {
    fn send(&mut self, command: ContextCommand) {
        if self.tx.send(command).is_err() {
            trace!("Context channel closed, dropping command");
        }
    }

    // The channel is ordered and the engine drops a worker before reading
    // anything queued after its terminate command.
    fn sync_terminate_worker(&mut self, worker: WorkerId) -> Result<(), ServiceWorkerError> {
        self.tx
            .send(ContextCommand::TerminateWorker(worker))
            .map_err(|_| ServiceWorkerError::ConnectionClosed)
    }
}

// ==================== Coordinator-side connection ====================

/// A pending `navigator.serviceWorker.ready` request.
#[derive(Debug, Clone)]
pub struct RegistrationReadyRequest {
    pub top_origin: SecurityOriginData,
    pub client_url: Url,
    pub request_id: u64,
}

/// The coordinator's record of one client process.
pub(crate) struct Connection {
    id: ConnectionId,
    transport: Box<dyn ClientTransport>,
    clients: HashSet<ClientId>,
    ready_requests: Vec<RegistrationReadyRequest>,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, transport: Box<dyn ClientTransport>) -> Self {
        Self {
            id,
            transport,
            clients: HashSet::new(),
            ready_requests: Vec::new(),
        }
    }

    pub(crate) fn send(&mut self, message: ClientMessage) {
        trace!(connection = %self.id, ?message, "Sending to client");
        self.transport.send(message);
    }

    pub(crate) fn add_client(&mut self, client: ClientId) {
        self.clients.insert(client);
    }

    pub(crate) fn remove_client(&mut self, client: ClientId) -> bool {
        self.clients.remove(&client)
    }

    pub(crate) fn take_clients(&mut self) -> Vec<ClientId> {
        self.clients.drain().collect()
    }

    pub(crate) fn add_ready_request(&mut self, request: RegistrationReadyRequest) {
        self.ready_requests.push(request);
    }

    /// Remove and return the ready requests accepted by `matches`.
    pub(crate) fn take_ready_requests(
        &mut self,
        matches: impl Fn(&RegistrationReadyRequest) -> bool,
    ) -> Vec<RegistrationReadyRequest> {
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.ready_requests)
            .into_iter()
            .partition(|request| matches(request));
        self.ready_requests = kept;
        taken
    }

    pub(crate) fn ready_request_count(&self) -> usize {
        self.ready_requests.len()
    }
}
