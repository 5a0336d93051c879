//! Register/update/unregister jobs and the per-scope FIFO that serializes them.

use crate::types::{
    ConnectionId, JobId, RegistrationKey, SecurityOriginData, UpdateViaCache, WorkerId, WorkerType,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use url::Url;

/// Job type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobType {
    Register,
    Update,
    Unregister,
}

/// A job as submitted by a client process. Immutable once queued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobData {
    pub id: JobId,
    pub job_type: JobType,
    pub top_origin: SecurityOriginData,
    /// URL of the client that issued the job.
    pub client_creation_url: Url,
    pub script_url: Url,
    pub scope_url: Url,
    pub update_via_cache: UpdateViaCache,
    pub worker_type: WorkerType,
}

impl JobData {
    pub fn register(
        id: JobId,
        top_origin: SecurityOriginData,
        client_creation_url: Url,
        script_url: Url,
        scope_url: Url,
    ) -> Self {
        Self {
            id,
            job_type: JobType::Register,
            top_origin,
            client_creation_url,
            script_url,
            scope_url,
            update_via_cache: UpdateViaCache::default(),
            worker_type: WorkerType::default(),
        }
    }

    pub fn update(
        id: JobId,
        top_origin: SecurityOriginData,
        client_creation_url: Url,
        script_url: Url,
        scope_url: Url,
    ) -> Self {
        Self {
            job_type: JobType::Update,
            ..Self::register(id, top_origin, client_creation_url, script_url, scope_url)
        }
    }

    pub fn unregister(
        id: JobId,
        top_origin: SecurityOriginData,
        client_creation_url: Url,
        scope_url: Url,
    ) -> Self {
        Self {
            job_type: JobType::Unregister,
            ..Self::register(
                id,
                top_origin,
                client_creation_url,
                scope_url.clone(),
                scope_url,
            )
        }
    }

    pub fn with_update_via_cache(mut self, update_via_cache: UpdateViaCache) -> Self {
        self.update_via_cache = update_via_cache;
        self
    }

    pub fn with_worker_type(mut self, worker_type: WorkerType) -> Self {
        self.worker_type = worker_type;
        self
    }

    pub fn registration_key(&self) -> RegistrationKey {
        RegistrationKey::new(self.top_origin.clone(), self.scope_url.clone())
    }

    pub fn connection(&self) -> ConnectionId {
        self.id.connection
    }
}

/// Where the job at the head of a queue is suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStep {
    /// Waiting for the client process to fetch the script.
    FetchingScript,
    /// Waiting for the worker's execution context to start.
    StartingWorker(WorkerId),
    /// Registration job resolved; waiting for the client to acknowledge.
    AwaitingPromiseResolution(WorkerId),
    /// Install event dispatched.
    Installing(WorkerId),
}

impl JobStep {
    pub fn worker(&self) -> Option<WorkerId> {
        match *self {
            JobStep::FetchingScript => None,
            JobStep::StartingWorker(worker)
            | JobStep::AwaitingPromiseResolution(worker)
            | JobStep::Installing(worker) => Some(worker),
        }
    }

    /// The job has already been answered with a resolved registration.
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            JobStep::AwaitingPromiseResolution(_) | JobStep::Installing(_)
        )
    }
}

/// FIFO of jobs for one registration key.
///
/// The head job is the one being processed; it stays at the head until it
/// finishes. Everything behind it has not started.
#[derive(Debug)]
pub struct JobQueue {
    key: RegistrationKey,
    jobs: VecDeque<JobData>,
    head_started: bool,
    step: Option<JobStep>,
}

impl JobQueue {
    pub fn new(key: RegistrationKey) -> Self {
        Self {
            key,
            jobs: VecDeque::new(),
            head_started: false,
            step: None,
        }
    }

    pub fn key(&self) -> &RegistrationKey {
        &self.key
    }

    /// Append a job. Returns true if the queue was empty.
    pub fn enqueue(&mut self, job: JobData) -> bool {
        let was_empty = self.jobs.is_empty();
        self.jobs.push_back(job);
        was_empty
    }

    pub fn head(&self) -> Option<&JobData> {
        self.jobs.front()
    }

    pub fn step(&self) -> Option<JobStep> {
        self.step
    }

    /// The head job has started and not yet finished.
    pub fn is_processing(&self) -> bool {
        self.head_started
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// The suspended head job, if it is `job_id`.
    pub fn current(&self, job_id: JobId) -> Option<(&JobData, JobStep)> {
        match (self.jobs.front(), self.step) {
            (Some(job), Some(step)) if job.id == job_id => Some((job, step)),
            _ => None,
        }
    }

    /// The suspended head job, if its step involves `worker`.
    pub fn current_for_worker(&self, worker: WorkerId) -> Option<(&JobData, JobStep)> {
        match (self.jobs.front(), self.step) {
            (Some(job), Some(step)) if step.worker() == Some(worker) => Some((job, step)),
            _ => None,
        }
    }

    /// Mark the head job as started and return it.
    pub(crate) fn begin_head(&mut self) -> Option<JobData> {
        let job = self.jobs.front().cloned()?;
        self.head_started = true;
        self.step = None;
        Some(job)
    }

    pub(crate) fn set_step(&mut self, step: JobStep) {
        self.step = Some(step);
    }

    /// Remove the head job once it has been answered.
    pub(crate) fn finish_head(&mut self) -> Option<JobData> {
        if !self.head_started {
            return None;
        }
        self.head_started = false;
        self.step = None;
        self.jobs.pop_front()
    }

    /// Remove not-yet-started jobs matching `predicate`, in queue order.
    pub(crate) fn cancel_pending(&mut self, predicate: impl Fn(&JobData) -> bool) -> Vec<JobData> {
        let skip = usize::from(self.head_started);
        let mut kept = VecDeque::with_capacity(self.jobs.len());
        let mut cancelled = Vec::new();
        for (index, job) in self.jobs.drain(..).enumerate() {
            if index >= skip && predicate(&job) {
                cancelled.push(job);
            } else {
                kept.push_back(job);
            }
        }
        self.jobs = kept;
        cancelled
    }
}
