//! Clients, claim, matchAll, ready requests and idle termination.

use super::{find_matching_registration, SwServer, TerminationMode};
use crate::connection::{ClientMessage, RegistrationReadyRequest};
use crate::error::ServiceWorkerError;
use crate::types::{
    ClientData, ClientId, ClientOrigin, ClientQueryOptions, ConnectionId, RegistrationId,
    SecurityOriginData, ServiceWorkerState, WorkerId,
};
use crate::worker::Worker;
use hashbrown::HashMap;
use std::time::Instant;
use tracing::{debug, info, trace, warn};
use url::Url;

impl SwServer {
    // ==================== Registry ====================

    pub fn register_service_worker_client(
        &mut self,
        connection: ConnectionId,
        top_origin: SecurityOriginData,
        client: ClientData,
        controller: Option<WorkerId>,
    ) {
        let Some(owner) = self.connections.get_mut(&connection) else {
            warn!(%connection, "Client registered on unknown connection");
            return;
        };
        owner.add_client(client.id);

        let controller = match controller {
            Some(worker) if !self.workers.contains_key(&worker) => {
                warn!(%worker, "Client registered with unknown controller");
                None
            }
            other => other,
        };
        let origin = ClientOrigin {
            top_origin,
            client_origin: SecurityOriginData::from_url(&client.url),
        };
        debug!(client = ?client.id, url = %client.url, controller = ?controller, "Client registered");
        self.clients.register(origin, client, controller);
    }

    pub fn unregister_service_worker_client(&mut self, connection: ConnectionId, client: ClientId) {
        let owned = self
            .connections
            .get_mut(&connection)
            .map_or(false, |owner| owner.remove_client(client));
        if !owned {
            warn!(%connection, client = ?client, "Unregistering a client the connection does not own");
            return;
        }
        self.remove_client(client);
    }

    /// Drop a client. The origin's idle timer is armed if it was the last one.
    pub(super) fn remove_client(&mut self, client: ClientId) {
        let deadline = Instant::now() + self.config.idle_termination_timeout();
        let Some(removed) = self.clients.unregister(client, deadline) else {
            return;
        };
        trace!(client = ?client, "Client unregistered");
        if let Some(controller) = removed.controller {
            self.controller_lost_client(controller);
        }
    }

    /// A worker stopped controlling a client. If it controls nothing else it
    /// no longer blocks activation or an unregistered registration.
    fn controller_lost_client(&mut self, worker_id: WorkerId) {
        if self.clients.has_clients_controlled_by(worker_id) {
            return;
        }
        let Some(registration_id) = self.workers.get(&worker_id).map(Worker::registration_id) else {
            return;
        };
        match self.registration_by_id(registration_id) {
            Some(registration) if registration.is_uninstalling() => {
                self.clear_uninstalling(registration_id, TerminationMode::Asynchronous)
            }
            Some(_) => self.try_activate(registration_id),
            None => {}
        }
    }

    // ==================== Claim / matchAll ====================

    /// Take control of every in-scope client whose best match is the
    /// worker's registration.
    pub fn claim(&mut self, worker_id: WorkerId) -> Result<(), ServiceWorkerError> {
        let worker = self
            .workers
            .get(&worker_id)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("worker {}", worker_id)))?;
        let registration_id = worker.registration_id();
        let registration = self
            .registration_by_id(registration_id)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("registration {}", registration_id)))?;
        let is_active = registration.active() == Some(worker_id)
            && matches!(
                worker.state(),
                ServiceWorkerState::Activating | ServiceWorkerState::Activated
            );
        if !is_active {
            return Err(ServiceWorkerError::StateError(
                "only the active worker can claim clients".into(),
            ));
        }

        let origin = registration.key().client_origin();
        let claimed: Vec<ClientId> = self
            .clients
            .clients_for_origin(&origin)
            .into_iter()
            .filter(|client| client.controller != Some(worker_id))
            .filter(|client| {
                find_matching_registration(&self.registrations, &origin.top_origin, &client.data.url)
                    == Some(registration_id)
            })
            .map(|client| client.data.id)
            .collect();

        let mut released = Vec::new();
        for client in &claimed {
            if let Some(previous) = self.clients.set_controller(*client, Some(worker_id)) {
                if !released.contains(&previous) {
                    released.push(previous);
                }
            }
        }
        info!(worker = %worker_id, clients = claimed.len(), "Clients claimed");
        self.notify_controller_change(&claimed, worker_id);

        for previous in released {
            self.controller_lost_client(previous);
        }
        Ok(())
    }

    /// Clients of the worker's origin filtered by `options`, in registration
    /// order.
    pub fn match_all(&self, worker_id: WorkerId, options: ClientQueryOptions) -> Vec<ClientData> {
        let Some(worker) = self.workers.get(&worker_id) else {
            return Vec::new();
        };
        let origin = worker.registration_key().client_origin();
        self.clients
            .clients_for_origin(&origin)
            .into_iter()
            .filter(|client| options.include_uncontrolled || client.controller == Some(worker_id))
            .filter(|client| options.accepts(client.data.client_type))
            .map(|client| client.data.clone())
            .collect()
    }

    /// Tell each owning connection that its clients have a new controller.
    pub(super) fn notify_controller_change(&mut self, clients: &[ClientId], worker_id: WorkerId) {
        if clients.is_empty() {
            return;
        }
        let Some(controller) = self.workers.get(&worker_id).map(Worker::data) else {
            return;
        };
        let mut by_connection: HashMap<ConnectionId, Vec<ClientId>> = HashMap::new();
        for client in clients {
            by_connection.entry(client.connection).or_default().push(*client);
        }
        for (connection, clients) in by_connection {
            self.send_to(
                connection,
                ClientMessage::NotifyClientsOfControllerChange {
                    clients,
                    controller: controller.clone(),
                },
            );
        }
    }

    // ==================== Ready requests ====================

    /// Answer once the client's matching registration has an active worker.
    pub fn when_registration_ready(
        &mut self,
        connection: ConnectionId,
        request_id: u64,
        top_origin: SecurityOriginData,
        client_url: Url,
    ) {
        let ready = self
            .match_registration(&top_origin, &client_url)
            .filter(|registration| registration.active.is_some());
        if let Some(registration) = ready {
            self.send_to(
                connection,
                ClientMessage::RegistrationReady {
                    request_id,
                    registration,
                },
            );
            return;
        }

        if let Some(owner) = self.connections.get_mut(&connection) {
            trace!(%connection, request_id, "Registration ready request pending");
            owner.add_ready_request(RegistrationReadyRequest {
                top_origin,
                client_url,
                request_id,
            });
        }
    }

    pub(super) fn resolve_registration_ready_requests(&mut self, registration_id: RegistrationId) {
        let Some(data) = self.registration_data(registration_id) else {
            return;
        };
        if data.active.is_none() {
            return;
        }
        let registrations = &self.registrations;
        for connection in self.connections.values_mut() {
            let ready = connection.take_ready_requests(|request| {
                find_matching_registration(registrations, &request.top_origin, &request.client_url)
                    == Some(registration_id)
            });
            for request in ready {
                connection.send(ClientMessage::RegistrationReady {
                    request_id: request.request_id,
                    registration: data.clone(),
                });
            }
        }
    }

    // ==================== Idle termination ====================

    /// Earliest armed idle deadline.
    pub fn next_idle_deadline(&self) -> Option<Instant> {
        self.clients.next_idle_deadline()
    }

    /// Stop the workers of every origin whose idle deadline has passed.
    /// Workers carrying an in-flight job are left alone.
    pub fn fire_due_idle_timers(&mut self, now: Instant) {
        for origin in self.clients.take_due_idle_origins(now) {
            let idle: Vec<WorkerId> = self
                .workers
                .values()
                .filter(|worker| worker.is_running())
                .filter(|worker| worker.registration_key().client_origin() == origin)
                .filter(|worker| {
                    self.job_queues
                        .get(worker.registration_key())
                        .and_then(|queue| queue.current_for_worker(worker.id()))
                        .is_none()
                })
                .map(Worker::id)
                .collect();
            info!(origin = %origin.client_origin, workers = idle.len(), "Idle timer fired");
            for worker in idle {
                if let Err(e) = self.terminate_worker_internal(worker, TerminationMode::Asynchronous) {
                    debug!(%worker, error = %e, "Idle termination failed");
                }
            }
        }
    }
}
