//! Service worker instances tracked by the coordinator.

use crate::error::ServiceWorkerError;
use crate::types::{
    ContextData, JobId, RegistrationId, RegistrationKey, ResponsePolicyHeaders,
    ServiceWorkerState, WorkerData, WorkerId, WorkerType,
};
use url::Url;

/// Whether the worker's execution context is alive.
///
/// This is independent of [`ServiceWorkerState`]: an activated worker may be
/// stopped, and a worker may be terminated in the middle of its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerRunState {
    #[default]
    NotRunning,
    Starting,
    Running,
    Terminating,
}

/// One service worker instance.
#[derive(Debug, Clone)]
pub struct Worker {
    id: WorkerId,
    registration_id: RegistrationId,
    registration_key: RegistrationKey,
    script_url: Url,
    script: String,
    policy: ResponsePolicyHeaders,
    worker_type: WorkerType,
    state: ServiceWorkerState,
    run_state: WorkerRunState,
    /// Bumped on every start; tags the execution context the engine runs.
    context_generation: u64,
    skip_waiting: bool,
}

impl Worker {
    /// Create a freshly parsed worker.
    pub(crate) fn new(
        registration_id: RegistrationId,
        registration_key: RegistrationKey,
        script_url: Url,
        script: String,
        policy: ResponsePolicyHeaders,
        worker_type: WorkerType,
    ) -> Self {
        Self {
            id: WorkerId::new(),
            registration_id,
            registration_key,
            script_url,
            script,
            policy,
            worker_type,
            state: ServiceWorkerState::Parsed,
            run_state: WorkerRunState::NotRunning,
            context_generation: 0,
            skip_waiting: false,
        }
    }

    /// Recreate a worker that was already active when it was persisted.
    pub(crate) fn restored(
        registration_id: RegistrationId,
        registration_key: RegistrationKey,
        script_url: Url,
        script: String,
        policy: ResponsePolicyHeaders,
        worker_type: WorkerType,
    ) -> Self {
        let mut worker = Self::new(
            registration_id,
            registration_key,
            script_url,
            script,
            policy,
            worker_type,
        );
        worker.state = ServiceWorkerState::Activated;
        worker
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn registration_id(&self) -> RegistrationId {
        self.registration_id
    }

    pub fn registration_key(&self) -> &RegistrationKey {
        &self.registration_key
    }

    pub fn script_url(&self) -> &Url {
        &self.script_url
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn policy(&self) -> &ResponsePolicyHeaders {
        &self.policy
    }

    pub fn worker_type(&self) -> WorkerType {
        self.worker_type
    }

    pub fn state(&self) -> ServiceWorkerState {
        self.state
    }

    pub fn run_state(&self) -> WorkerRunState {
        self.run_state
    }

    /// Running or about to run; a terminating worker no longer counts.
    pub fn is_running(&self) -> bool {
        matches!(
            self.run_state,
            WorkerRunState::Starting | WorkerRunState::Running
        )
    }

    /// Generation of the most recently started execution context.
    pub fn context_generation(&self) -> u64 {
        self.context_generation
    }

    pub fn is_redundant(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn skip_waiting(&self) -> bool {
        self.skip_waiting
    }

    /// Move to `state`.
    ///
    /// Only the next lifecycle step is accepted, except `Redundant`, which is
    /// reachable from every non-terminal state.
    pub(crate) fn advance_to(&mut self, state: ServiceWorkerState) -> Result<(), ServiceWorkerError> {
        let allowed = match state {
            ServiceWorkerState::Redundant => !self.state.is_terminal(),
            next => self.state.next() == Some(next),
        };
        if !allowed {
            return Err(ServiceWorkerError::StateError(format!(
                "worker {} cannot move from {} to {}",
                self.id, self.state, state
            )));
        }
        self.state = state;
        Ok(())
    }

    pub(crate) fn set_run_state(&mut self, run_state: WorkerRunState) {
        self.run_state = run_state;
    }

    /// Enter `Starting` with a new context generation.
    pub(crate) fn begin_start(&mut self) -> u64 {
        self.run_state = WorkerRunState::Starting;
        self.context_generation += 1;
        self.context_generation
    }

    pub(crate) fn set_skip_waiting(&mut self) {
        self.skip_waiting = true;
    }

    pub fn data(&self) -> WorkerData {
        WorkerData {
            id: self.id,
            registration_id: self.registration_id,
            script_url: self.script_url.clone(),
            state: self.state,
            worker_type: self.worker_type,
        }
    }

    pub fn context_data(&self, job_id: Option<JobId>) -> ContextData {
        ContextData {
            job_id,
            registration_id: self.registration_id,
            registration_key: self.registration_key.clone(),
            worker_id: self.id,
            generation: self.context_generation,
            script_url: self.script_url.clone(),
            script: self.script.clone(),
            policy: self.policy.clone(),
            worker_type: self.worker_type,
        }
    }
}
