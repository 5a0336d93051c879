//! Worker lifecycle: start, install, activate, termination.

use super::{RunWorkerCallback, SwServer};
use crate::connection::{ClientMessage, ContextCommand};
use crate::error::ServiceWorkerError;
use crate::job::JobStep;
use crate::types::{
    ConnectionId, JobId, RegistrationId, RegistrationKey, RegistrationState, ServiceWorkerState,
    WorkerId,
};
use crate::worker::{Worker, WorkerRunState};
use tracing::{debug, info, trace, warn};

/// How a worker termination is awaited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationMode {
    /// Return once the worker is stopped. Used for clear and shutdown paths.
    Synchronous,
    /// Send the request and continue; completion arrives as an event.
    Asynchronous,
}

const SLOTS: [RegistrationState; 3] = [
    RegistrationState::Installing,
    RegistrationState::Waiting,
    RegistrationState::Active,
];

impl SwServer {
    // ==================== Slots and states ====================

    pub(super) fn update_registration_slot(
        &mut self,
        registration_id: RegistrationId,
        state: RegistrationState,
        worker: Option<WorkerId>,
    ) {
        self.replace_slot(registration_id, state, worker, TerminationMode::Asynchronous);
    }

    /// Fill or clear a slot and notify interested connections. A displaced
    /// worker that no other slot holds becomes redundant.
    fn replace_slot(
        &mut self,
        registration_id: RegistrationId,
        state: RegistrationState,
        worker: Option<WorkerId>,
        mode: TerminationMode,
    ) {
        let Some(registration) = self.registration_mut(registration_id) else {
            return;
        };
        let displaced = registration
            .set_slot(state, worker)
            .filter(|previous| !registration.holds_worker(*previous));

        let snapshot = worker.and_then(|id| self.workers.get(&id)).map(Worker::data);
        trace!(registration = %registration_id, ?state, worker = ?worker, "Registration slot updated");
        self.broadcast(
            registration_id,
            ClientMessage::UpdateRegistrationState {
                registration_id,
                state,
                worker: snapshot,
            },
        );

        if let Some(previous) = displaced {
            self.retire_worker(previous, mode);
        }
    }

    /// Advance a worker's lifecycle state and notify interested connections.
    pub(super) fn set_worker_state(&mut self, worker_id: WorkerId, state: ServiceWorkerState) -> bool {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return false;
        };
        if let Err(e) = worker.advance_to(state) {
            warn!(worker = %worker_id, error = %e, "Rejected worker state change");
            return false;
        }
        let registration_id = worker.registration_id();
        debug!(worker = %worker_id, %state, "Worker state changed");
        self.broadcast(
            registration_id,
            ClientMessage::UpdateWorkerState { worker_id, state },
        );
        true
    }

    /// Make a worker redundant and stop it. It is dropped once stopped.
    pub(super) fn retire_worker(&mut self, worker_id: WorkerId, mode: TerminationMode) {
        let Some(worker) = self.workers.get(&worker_id) else {
            return;
        };
        let run_state = worker.run_state();
        if !worker.is_redundant() {
            self.set_worker_state(worker_id, ServiceWorkerState::Redundant);
        }
        match run_state {
            WorkerRunState::NotRunning => self.remove_worker(worker_id),
            _ => {
                if let Err(e) = self.terminate_worker_internal(worker_id, mode) {
                    debug!(worker = %worker_id, error = %e, "Retired worker termination failed");
                }
            }
        }
    }

    /// Take a worker out of whichever slot holds it and retire it.
    pub(super) fn discard_worker(&mut self, worker_id: WorkerId, mode: TerminationMode) {
        let Some(registration_id) = self.workers.get(&worker_id).map(Worker::registration_id) else {
            return;
        };
        let slot = self.registration_by_id(registration_id).and_then(|registration| {
            SLOTS
                .into_iter()
                .find(|state| registration.slot(*state) == Some(worker_id))
        });
        match slot {
            Some(state) => self.replace_slot(registration_id, state, None, mode),
            None => self.retire_worker(worker_id, mode),
        }
    }

    fn remove_worker(&mut self, worker_id: WorkerId) {
        self.workers.remove(&worker_id);
        for callback in self.run_requests.remove(&worker_id).unwrap_or_default() {
            callback(false);
        }
        trace!(worker = %worker_id, "Worker dropped");
    }

    /// Empty every slot of a registration, retiring its workers. Clients it
    /// controlled lose their controller.
    pub(super) fn clear_registration(&mut self, registration_id: RegistrationId, mode: TerminationMode) {
        let Some(registration) = self.registration_by_id(registration_id) else {
            return;
        };
        let occupied: Vec<RegistrationState> = SLOTS
            .into_iter()
            .filter(|state| registration.slot(*state).is_some())
            .collect();
        if let Some(active) = registration.active() {
            for client in self.clients.controlled_by(active) {
                self.clients.set_controller(client, None);
            }
        }
        debug!(registration = %registration_id, "Clearing registration");
        for state in occupied {
            self.replace_slot(registration_id, state, None, mode);
        }
    }

    /// Clear an unregistered registration and forget it.
    pub(super) fn clear_uninstalling(&mut self, registration_id: RegistrationId, mode: TerminationMode) {
        self.clear_registration(registration_id, mode);
        if self.uninstalling.remove(&registration_id).is_some() {
            debug!(registration = %registration_id, "Unregistered registration cleared");
        }
    }

    // ==================== Running ====================

    pub(super) fn start_worker(&mut self, worker_id: WorkerId, job_id: Option<JobId>) {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return;
        };
        let generation = worker.begin_start();
        let data = worker.context_data(job_id);
        debug!(worker = %worker_id, generation, script = %data.script_url, "Starting worker context");
        self.context.send(ContextCommand::InstallContext(data));
    }

    /// Make sure a worker is running, then call `callback` with the outcome.
    ///
    /// A running worker answers immediately. A starting worker queues the
    /// callback; a terminating one is restarted once it has stopped.
    pub fn run_service_worker_if_necessary(&mut self, worker_id: WorkerId, callback: RunWorkerCallback) {
        let Some(worker) = self.workers.get(&worker_id) else {
            callback(false);
            return;
        };
        match worker.run_state() {
            WorkerRunState::Running => callback(true),
            WorkerRunState::Starting | WorkerRunState::Terminating => {
                self.run_requests.entry(worker_id).or_default().push(callback);
            }
            WorkerRunState::NotRunning => {
                if worker.is_redundant() {
                    callback(false);
                    return;
                }
                self.run_requests.entry(worker_id).or_default().push(callback);
                self.start_worker(worker_id, None);
            }
        }
    }

    /// The step of the job suspended on `worker_id`, if `job_id` matches it.
    fn job_step_for(
        &self,
        key: &RegistrationKey,
        worker_id: WorkerId,
        job_id: Option<JobId>,
    ) -> Option<JobStep> {
        self.job_queues
            .get(key)
            .and_then(|queue| queue.current_for_worker(worker_id))
            .filter(|(job, _)| job_id.map_or(true, |id| id == job.id))
            .map(|(_, step)| step)
    }

    pub fn script_context_started(&mut self, job_id: Option<JobId>, worker_id: WorkerId) {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            debug!(worker = %worker_id, "Context started for unknown worker");
            return;
        };
        if worker.run_state() != WorkerRunState::Starting {
            debug!(worker = %worker_id, run_state = ?worker.run_state(), "Ignoring stale context start");
            return;
        }
        worker.set_run_state(WorkerRunState::Running);
        let key = worker.registration_key().clone();
        let activating = worker.state() == ServiceWorkerState::Activating;
        debug!(worker = %worker_id, "Worker context started");

        for callback in self.run_requests.remove(&worker_id).unwrap_or_default() {
            callback(true);
        }

        if self.job_step_for(&key, worker_id, job_id) == Some(JobStep::StartingWorker(worker_id)) {
            self.install(&key, worker_id);
        } else if activating {
            self.context.send(ContextCommand::FireActivateEvent(worker_id));
        }
    }

    pub fn script_context_failed_to_start(
        &mut self,
        job_id: Option<JobId>,
        worker_id: WorkerId,
        message: &str,
    ) {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return;
        };
        worker.set_run_state(WorkerRunState::NotRunning);
        let key = worker.registration_key().clone();
        let activating = worker.state() == ServiceWorkerState::Activating;
        warn!(worker = %worker_id, %message, "Worker context failed to start");

        for callback in self.run_requests.remove(&worker_id).unwrap_or_default() {
            callback(false);
        }

        if self.job_step_for(&key, worker_id, job_id) == Some(JobStep::StartingWorker(worker_id)) {
            self.fail_current_job(&key, ServiceWorkerError::ScriptError(message.to_string()));
        } else if activating {
            self.did_finish_activation(worker_id);
        } else if self.workers.get(&worker_id).map_or(false, Worker::is_redundant) {
            self.remove_worker(worker_id);
        }
    }

    // ==================== Install ====================

    /// Put a started worker in the installing slot and resolve its job.
    fn install(&mut self, key: &RegistrationKey, worker_id: WorkerId) {
        let Some(job) = self.job_queues.get(key).and_then(|queue| queue.head()).cloned() else {
            return;
        };
        let Some(registration) = self.registrations.get(key) else {
            self.fail_current_job(
                key,
                ServiceWorkerError::StateError("registration removed during update".into()),
            );
            return;
        };
        let registration_id = registration.id();

        self.update_registration_slot(registration_id, RegistrationState::Installing, Some(worker_id));
        self.set_worker_state(worker_id, ServiceWorkerState::Installing);
        if let Some(queue) = self.job_queues.get_mut(key) {
            queue.set_step(JobStep::AwaitingPromiseResolution(worker_id));
        }

        let connected = self.connections.contains_key(&job.connection());
        if let Some(data) = self.registration_data(registration_id) {
            self.resolve_registration_job(&job, data, true);
        }
        if !connected {
            self.begin_install_event(key, worker_id);
        }
    }

    /// The submitting client has seen the resolved registration.
    pub fn did_resolve_registration_promise(
        &mut self,
        connection: ConnectionId,
        key: &RegistrationKey,
    ) {
        let worker = match self.job_queues.get(key) {
            Some(queue) => match (queue.head(), queue.step()) {
                (Some(job), Some(JobStep::AwaitingPromiseResolution(worker)))
                    if job.connection() == connection =>
                {
                    worker
                }
                _ => {
                    debug!(scope = %key.scope, "No job awaiting promise resolution");
                    return;
                }
            },
            None => return,
        };
        self.begin_install_event(key, worker);
    }

    pub(super) fn begin_install_event(&mut self, key: &RegistrationKey, worker_id: WorkerId) {
        if let Some(queue) = self.job_queues.get_mut(key) {
            queue.set_step(JobStep::Installing(worker_id));
        }
        let Some(registration_id) = self.workers.get(&worker_id).map(Worker::registration_id) else {
            return;
        };
        debug!(worker = %worker_id, "Dispatching install event");
        self.broadcast(
            registration_id,
            ClientMessage::FireUpdateFound { registration_id },
        );
        self.context.send(ContextCommand::FireInstallEvent(worker_id));
    }

    pub fn did_finish_install(&mut self, job_id: Option<JobId>, worker_id: WorkerId, success: bool) {
        let Some(worker) = self.workers.get(&worker_id) else {
            return;
        };
        let key = worker.registration_key().clone();
        let registration_id = worker.registration_id();
        if self.job_step_for(&key, worker_id, job_id) != Some(JobStep::Installing(worker_id)) {
            debug!(worker = %worker_id, "Ignoring stale install completion");
            return;
        }

        if !success {
            self.fail_current_job(
                &key,
                ServiceWorkerError::InstallFailed("install event handler failed".into()),
            );
            return;
        }

        self.update_registration_slot(registration_id, RegistrationState::Waiting, Some(worker_id));
        self.update_registration_slot(registration_id, RegistrationState::Installing, None);
        self.set_worker_state(worker_id, ServiceWorkerState::Installed);
        info!(worker = %worker_id, registration = %registration_id, "Worker installed");

        self.try_activate(registration_id);
        self.finish_current_job(&key);
    }

    // ==================== Activate ====================

    /// Activate the waiting worker unless the active one is still in use.
    pub(super) fn try_activate(&mut self, registration_id: RegistrationId) {
        let Some(registration) = self.registration_by_id(registration_id) else {
            return;
        };
        if registration.is_uninstalling() {
            return;
        }
        let Some(waiting) = registration.waiting() else {
            return;
        };
        if let Some(active) = registration.active().and_then(|id| self.workers.get(&id)) {
            if active.state() == ServiceWorkerState::Activating {
                return;
            }
            let skip_waiting = self.workers.get(&waiting).map_or(false, Worker::skip_waiting);
            if !skip_waiting && self.clients.has_clients_controlled_by(active.id()) {
                trace!(registration = %registration_id, "Active worker in use, waiting");
                return;
            }
        }
        self.activate(registration_id);
    }

    fn activate(&mut self, registration_id: RegistrationId) {
        let Some(registration) = self.registration_by_id(registration_id) else {
            return;
        };
        let Some(incoming) = registration.waiting() else {
            return;
        };
        let previous = registration.active();

        self.update_registration_slot(registration_id, RegistrationState::Active, Some(incoming));
        self.update_registration_slot(registration_id, RegistrationState::Waiting, None);
        self.set_worker_state(incoming, ServiceWorkerState::Activating);
        info!(worker = %incoming, registration = %registration_id, "Activating worker");

        if let Some(previous) = previous {
            let moved = self.clients.controlled_by(previous);
            for client in &moved {
                self.clients.set_controller(*client, Some(incoming));
            }
            self.notify_controller_change(&moved, incoming);
        }
        self.resolve_registration_ready_requests(registration_id);

        let run_state = self
            .workers
            .get(&incoming)
            .map_or(WorkerRunState::NotRunning, Worker::run_state);
        match run_state {
            WorkerRunState::Running => self.context.send(ContextCommand::FireActivateEvent(incoming)),
            WorkerRunState::NotRunning => self.start_worker(incoming, None),
            // Start or termination completion finishes the activation.
            WorkerRunState::Starting | WorkerRunState::Terminating => {}
        }
    }

    pub fn did_finish_activation(&mut self, worker_id: WorkerId) {
        let Some(worker) = self.workers.get(&worker_id) else {
            return;
        };
        if worker.state() != ServiceWorkerState::Activating {
            debug!(worker = %worker_id, state = %worker.state(), "Ignoring stale activation completion");
            return;
        }
        let registration_id = worker.registration_id();
        self.set_worker_state(worker_id, ServiceWorkerState::Activated);
        info!(worker = %worker_id, registration = %registration_id, "Worker activated");

        self.persist_registration(registration_id);
        self.try_activate(registration_id);
    }

    pub fn skip_waiting(&mut self, worker_id: WorkerId) {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return;
        };
        worker.set_skip_waiting();
        let registration_id = worker.registration_id();
        debug!(worker = %worker_id, "Skip waiting requested");

        let is_waiting = self
            .registration_by_id(registration_id)
            .map_or(false, |registration| registration.waiting() == Some(worker_id));
        if is_waiting {
            self.try_activate(registration_id);
        }
    }

    // ==================== Termination ====================

    /// Ask the engine to stop a worker.
    pub fn terminate_worker(&mut self, worker_id: WorkerId) -> Result<(), ServiceWorkerError> {
        self.terminate_worker_internal(worker_id, TerminationMode::Asynchronous)
    }

    /// Stop a worker and process its termination before returning.
    pub fn sync_terminate_worker(&mut self, worker_id: WorkerId) -> Result<(), ServiceWorkerError> {
        self.terminate_worker_internal(worker_id, TerminationMode::Synchronous)
    }

    pub(super) fn terminate_worker_internal(
        &mut self,
        worker_id: WorkerId,
        mode: TerminationMode,
    ) -> Result<(), ServiceWorkerError> {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return Err(ServiceWorkerError::NotFound(format!("worker {}", worker_id)));
        };
        match (worker.run_state(), mode) {
            (WorkerRunState::NotRunning, _) => return Ok(()),
            (WorkerRunState::Terminating, TerminationMode::Asynchronous) => return Ok(()),
            _ => {}
        }
        worker.set_run_state(WorkerRunState::Terminating);
        debug!(worker = %worker_id, ?mode, "Terminating worker");

        match mode {
            TerminationMode::Asynchronous => {
                self.context.send(ContextCommand::TerminateWorker(worker_id));
                Ok(())
            }
            TerminationMode::Synchronous => {
                let result = self.context.sync_terminate_worker(worker_id);
                self.worker_context_terminated(worker_id);
                result
            }
        }
    }

    /// The engine reports that the context started as `generation` is gone.
    ///
    /// Reports about an earlier context are dropped: that context's
    /// termination was already processed when the worker was restarted.
    pub fn context_terminated(&mut self, worker_id: WorkerId, generation: u64) {
        let current = self.workers.get(&worker_id).map(Worker::context_generation);
        if current.map_or(false, |current| current != generation) {
            debug!(worker = %worker_id, generation, ?current, "Ignoring termination of an earlier context");
            return;
        }
        self.worker_context_terminated(worker_id);
    }

    /// A worker's current context is gone.
    ///
    /// A job suspended on the worker fails with `ContextTerminated`. Pending
    /// run requests restart the worker.
    pub fn worker_context_terminated(&mut self, worker_id: WorkerId) {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            trace!(worker = %worker_id, "Termination of unknown worker");
            return;
        };
        if worker.run_state() == WorkerRunState::NotRunning {
            return;
        }
        worker.set_run_state(WorkerRunState::NotRunning);
        let key = worker.registration_key().clone();
        let state = worker.state();
        info!(worker = %worker_id, %state, "Worker context terminated");

        if self.job_step_for(&key, worker_id, None).is_some() {
            self.fail_current_job(&key, ServiceWorkerError::ContextTerminated);
        } else if state == ServiceWorkerState::Activating {
            self.did_finish_activation(worker_id);
        }

        let Some(worker) = self.workers.get(&worker_id) else {
            return;
        };
        if worker.is_redundant() {
            self.remove_worker(worker_id);
        } else if self
            .run_requests
            .get(&worker_id)
            .map_or(false, |pending| !pending.is_empty())
        {
            self.start_worker(worker_id, None);
        }
    }

    /// Treat every running worker as terminated, after losing the engine.
    pub fn mark_all_workers_as_terminated(&mut self) {
        let running: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|worker| worker.run_state() != WorkerRunState::NotRunning)
            .map(Worker::id)
            .collect();
        warn!(workers = running.len(), "Marking all workers as terminated");
        for worker in running {
            self.worker_context_terminated(worker);
        }
    }
}
