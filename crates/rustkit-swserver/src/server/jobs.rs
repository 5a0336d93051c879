//! Job scheduling and execution.
//!
//! Each registration key has one FIFO. The head job runs until it suspends
//! on a round trip (script fetch, worker start, install event) and is resumed
//! by the matching completion. Every job is answered exactly once.

use super::{SwServer, TerminationMode};
use crate::connection::ClientMessage;
use crate::error::ServiceWorkerError;
use crate::job::{JobData, JobQueue, JobStep, JobType};
use crate::registration::Registration;
use crate::types::{
    ConnectionId, FetchCacheMode, FetchResult, RegistrationData, RegistrationKey,
    SecurityOriginData, UpdateViaCache,
};
use crate::worker::Worker;
use std::time::SystemTime;
use tracing::{debug, info, trace, warn};

impl SwServer {
    /// Queue a job behind earlier jobs for the same scope.
    ///
    /// Jobs arriving before the registration import completes are held and
    /// scheduled in arrival order once it does.
    pub fn schedule_job(&mut self, job: JobData) {
        if !self.is_import_completed() {
            debug!(job = %job.id, "Import in progress, holding job");
            self.pending_jobs.push(job);
            return;
        }

        let key = job.registration_key();
        debug!(job = %job.id, job_type = ?job.job_type, scope = %key.scope, "Scheduling job");
        let queue = self
            .job_queues
            .entry(key.clone())
            .or_insert_with(|| JobQueue::new(key.clone()));
        if queue.enqueue(job) {
            self.run_job_queue(&key);
        }
    }

    /// Start queued jobs until one suspends or the queue drains.
    pub(super) fn run_job_queue(&mut self, key: &RegistrationKey) {
        loop {
            let job = match self.job_queues.get_mut(key) {
                Some(queue) if !queue.is_processing() => queue.begin_head(),
                _ => return,
            };
            let Some(job) = job else {
                self.drop_queue_if_idle(key);
                return;
            };

            trace!(job = %job.id, "Running job");
            let step = match job.job_type {
                JobType::Register => self.run_register_job(&job),
                JobType::Update => self.run_update_job(&job),
                JobType::Unregister => {
                    self.run_unregister_job(&job);
                    None
                }
            };

            match (step, self.job_queues.get_mut(key)) {
                (Some(step), Some(queue)) => {
                    queue.set_step(step);
                    return;
                }
                (None, Some(queue)) => {
                    queue.finish_head();
                }
                (_, None) => return,
            }
        }
    }

    fn run_register_job(&mut self, job: &JobData) -> Option<JobStep> {
        if let Err(e) = validate_job_urls(job) {
            self.reject_job(job, e);
            return None;
        }

        let key = job.registration_key();
        match self.registrations.get(&key) {
            Some(registration) => {
                let same_script = registration
                    .newest_worker()
                    .and_then(|id| self.workers.get(&id))
                    .map_or(false, |worker| *worker.script_url() == job.script_url);
                if same_script && registration.update_via_cache() == job.update_via_cache {
                    debug!(job = %job.id, "Registration unchanged, resolving");
                    let data = registration.data(&self.workers);
                    self.resolve_registration_job(job, data, false);
                    return None;
                }
                self.set_update_via_cache(&key, job.update_via_cache);
            }
            None => {
                let registration = Registration::new(key.clone(), job.update_via_cache);
                debug!(registration = %registration.id(), scope = %key.scope, "Registration created");
                self.registrations_by_id
                    .insert(registration.id(), key.clone());
                self.registrations.insert(key, registration);
            }
        }

        self.start_update(job)
    }

    fn run_update_job(&mut self, job: &JobData) -> Option<JobStep> {
        if let Err(e) = validate_job_urls(job) {
            self.reject_job(job, e);
            return None;
        }

        let key = job.registration_key();
        let newest_script = self.registrations.get(&key).map(|registration| {
            registration
                .newest_worker()
                .and_then(|id| self.workers.get(&id))
                .map(|worker| worker.script_url().clone())
        });
        match newest_script {
            None => {
                let error = format!("no registration for scope '{}'", key.scope);
                self.reject_job(job, ServiceWorkerError::TypeError(error));
                None
            }
            Some(Some(script_url)) if script_url != job.script_url => {
                let error = format!("script '{}' is not the newest worker's script", job.script_url);
                self.reject_job(job, ServiceWorkerError::TypeError(error));
                None
            }
            Some(_) => self.start_update(job),
        }
    }

    fn set_update_via_cache(&mut self, key: &RegistrationKey, update_via_cache: UpdateViaCache) {
        let Some(registration) = self.registrations.get_mut(key) else {
            return;
        };
        if registration.update_via_cache() == update_via_cache {
            return;
        }
        registration.set_update_via_cache(update_via_cache);
        let registration_id = registration.id();
        debug!(registration = %registration_id, ?update_via_cache, "Update via cache changed");
        self.broadcast(
            registration_id,
            ClientMessage::SetRegistrationUpdateViaCache {
                registration_id,
                update_via_cache,
            },
        );
    }

    /// Ask the submitting client to fetch the script.
    fn start_update(&mut self, job: &JobData) -> Option<JobStep> {
        let key = job.registration_key();
        let Some(registration) = self.registrations.get(&key) else {
            self.reject_job(job, missing_registration(&key));
            return None;
        };
        let cache_mode = if registration
            .should_bypass_cache(SystemTime::now(), self.config.update_bypass_cache_after())
        {
            FetchCacheMode::NoCache
        } else {
            FetchCacheMode::Default
        };

        if !self.connections.contains_key(&job.connection()) {
            self.reject_job(job, ServiceWorkerError::ConnectionClosed);
            self.revert_empty_registration(&key, TerminationMode::Asynchronous);
            return None;
        }

        debug!(job = %job.id, ?cache_mode, "Requesting script fetch");
        self.send_to(
            job.connection(),
            ClientMessage::StartScriptFetch {
                job_id: job.id,
                key,
                cache_mode,
            },
        );
        Some(JobStep::FetchingScript)
    }

    fn run_unregister_job(&mut self, job: &JobData) {
        let key = job.registration_key();
        if !SecurityOriginData::from_url(&job.client_creation_url).contains(&job.scope_url) {
            let error = format!("cannot unregister '{}' from another origin", job.scope_url);
            self.reject_job(job, ServiceWorkerError::SecurityError(error));
            return;
        }

        let Some(registration_id) = self.registrations.get(&key).map(Registration::id) else {
            self.resolve_unregistration_job(job, key, false);
            return;
        };

        // Updates queued behind this job target the registration being removed.
        let aborted = match self.job_queues.get_mut(&key) {
            Some(queue) => queue.cancel_pending(|queued| queued.job_type == JobType::Update),
            None => Vec::new(),
        };
        for queued in aborted {
            self.reject_job(
                &queued,
                ServiceWorkerError::Aborted("registration was unregistered".into()),
            );
        }

        if let Some(mut registration) = self.registrations.remove(&key) {
            self.registrations_by_id.remove(&registration_id);
            registration.set_uninstalling();
            self.uninstalling.insert(registration_id, registration);
        }
        self.forget_registration_record(&key);
        info!(registration = %registration_id, scope = %key.scope, "Registration unregistered");
        self.resolve_unregistration_job(job, key, true);

        let in_use = self
            .uninstalling
            .get(&registration_id)
            .and_then(Registration::active)
            .map_or(false, |active| self.clients.has_clients_controlled_by(active));
        if !in_use {
            self.clear_uninstalling(registration_id, TerminationMode::Asynchronous);
        }
    }

    /// Resume a job whose script fetch completed.
    pub fn finish_fetching_script(&mut self, connection: ConnectionId, result: FetchResult) {
        let key = result.registration_key.clone();
        let job = match self
            .job_queues
            .get(&key)
            .and_then(|queue| queue.current(result.job_id))
        {
            Some((job, JobStep::FetchingScript)) if job.connection() == connection => job.clone(),
            _ => {
                warn!(job = %result.job_id, "Script fetch result for a job that is not fetching");
                return;
            }
        };

        if let Some(error) = result.error {
            self.fail_current_job(&key, ServiceWorkerError::NetworkError(error));
            return;
        }

        let now = SystemTime::now();
        let Some(registration) = self.registrations.get_mut(&key) else {
            self.fail_current_job(&key, missing_registration(&key));
            return;
        };
        registration.set_last_update_time(now);
        let registration_id = registration.id();
        let newest = registration.newest_worker();
        self.broadcast(
            registration_id,
            ClientMessage::SetRegistrationLastUpdateTime {
                registration_id,
                time: now,
            },
        );

        let unchanged = newest
            .and_then(|id| self.workers.get(&id))
            .map_or(false, |worker| {
                *worker.script_url() == job.script_url && worker.script() == result.script
            });
        if unchanged {
            debug!(job = %job.id, "Script unchanged, keeping current worker");
            if let Some(data) = self.registration_data(registration_id) {
                self.resolve_registration_job(&job, data, false);
            }
            self.finish_current_job(&key);
            return;
        }

        let worker = Worker::new(
            registration_id,
            key.clone(),
            job.script_url.clone(),
            result.script,
            result.policy,
            job.worker_type,
        );
        let worker_id = worker.id();
        debug!(job = %job.id, worker = %worker_id, "Script fetched");
        self.workers.insert(worker_id, worker);
        if let Some(queue) = self.job_queues.get_mut(&key) {
            queue.set_step(JobStep::StartingWorker(worker_id));
        }
        self.start_worker(worker_id, Some(job.id));
    }

    // ==================== Replies ====================

    pub(super) fn reject_job(&mut self, job: &JobData, error: ServiceWorkerError) {
        warn!(job = %job.id, category = error.category(), %error, "Rejecting job");
        self.send_to(
            job.connection(),
            ClientMessage::RejectJob {
                job_id: job.id,
                error,
            },
        );
    }

    pub(super) fn resolve_registration_job(
        &mut self,
        job: &JobData,
        registration: RegistrationData,
        notify_when_resolved: bool,
    ) {
        debug!(job = %job.id, registration = %registration.id, "Resolving registration job");
        self.send_to(
            job.connection(),
            ClientMessage::ResolveRegistrationJob {
                job_id: job.id,
                registration,
                notify_when_resolved,
            },
        );
    }

    fn resolve_unregistration_job(&mut self, job: &JobData, key: RegistrationKey, unregistered: bool) {
        debug!(job = %job.id, unregistered, "Resolving unregistration job");
        self.send_to(
            job.connection(),
            ClientMessage::ResolveUnregistrationJob {
                job_id: job.id,
                key,
                unregistered,
            },
        );
    }

    // ==================== Completion ====================

    /// Finish the suspended head job and start the next one.
    pub(super) fn finish_current_job(&mut self, key: &RegistrationKey) {
        if let Some(queue) = self.job_queues.get_mut(key) {
            queue.finish_head();
        }
        self.run_job_queue(key);
    }

    pub(super) fn fail_current_job(&mut self, key: &RegistrationKey, error: ServiceWorkerError) {
        self.fail_current_job_with(key, error, TerminationMode::Asynchronous);
    }

    /// Fail the suspended head job and revert what it did.
    ///
    /// A job that was already resolved is not answered again; its worker is
    /// retired and the registration reverts.
    fn fail_current_job_with(
        &mut self,
        key: &RegistrationKey,
        error: ServiceWorkerError,
        mode: TerminationMode,
    ) {
        let Some(queue) = self.job_queues.get_mut(key) else {
            return;
        };
        let step = queue.step();
        let Some(job) = queue.finish_head() else {
            return;
        };

        match step {
            Some(step) if step.is_resolved() => {
                warn!(job = %job.id, category = error.category(), %error, "Job failed after resolving");
            }
            _ => self.reject_job(&job, error),
        }

        if let Some(worker) = step.and_then(|step| step.worker()) {
            self.discard_worker(worker, mode);
        }
        self.revert_empty_registration(key, mode);
        self.run_job_queue(key);
    }

    /// Reject everything queued for `key` and fail its in-flight job.
    pub(super) fn abort_jobs(&mut self, key: &RegistrationKey, reason: &str) {
        let Some(queue) = self.job_queues.get_mut(key) else {
            return;
        };
        let cancelled = queue.cancel_pending(|_| true);
        let in_flight = queue.is_processing();
        for job in cancelled {
            self.reject_job(&job, ServiceWorkerError::Aborted(reason.into()));
        }
        if in_flight {
            self.fail_current_job_with(
                key,
                ServiceWorkerError::Aborted(reason.into()),
                TerminationMode::Synchronous,
            );
        }
    }

    /// Handle a connection closing for one queue.
    pub(super) fn connection_closed_for_queue(&mut self, key: &RegistrationKey, connection: ConnectionId) {
        let cancelled = match self.job_queues.get_mut(key) {
            Some(queue) => queue.cancel_pending(|job| job.connection() == connection),
            None => return,
        };
        for job in cancelled {
            self.reject_job(&job, ServiceWorkerError::ConnectionClosed);
        }

        let step = self.job_queues.get(key).and_then(|queue| match queue.head() {
            Some(head) if head.connection() == connection => queue.step(),
            _ => None,
        });
        match step {
            Some(JobStep::FetchingScript) => {
                self.fail_current_job(key, ServiceWorkerError::ConnectionClosed)
            }
            Some(JobStep::AwaitingPromiseResolution(worker)) => self.begin_install_event(key, worker),
            _ => {}
        }
    }

    // ==================== Table maintenance ====================

    /// Remove a live registration that has no worker left.
    pub(super) fn revert_empty_registration(&mut self, key: &RegistrationKey, mode: TerminationMode) {
        let empty = self
            .registrations
            .get(key)
            .map_or(false, |registration| registration.newest_worker().is_none());
        if empty {
            self.remove_registration(key, mode);
        }
    }

    pub(super) fn remove_registration(&mut self, key: &RegistrationKey, mode: TerminationMode) {
        let Some(id) = self.registrations.get(key).map(Registration::id) else {
            return;
        };
        debug!(registration = %id, scope = %key.scope, "Removing registration");
        self.clear_registration(id, mode);
        self.registrations.remove(key);
        self.registrations_by_id.remove(&id);
        self.forget_registration_record(key);
        self.drop_queue_if_idle(key);
    }

    /// Drop a drained queue whose key has no registration.
    pub(super) fn drop_queue_if_idle(&mut self, key: &RegistrationKey) {
        let drained = self
            .job_queues
            .get(key)
            .map_or(false, |queue| queue.is_empty());
        if drained && !self.registrations.contains_key(key) {
            trace!(scope = %key.scope, "Job queue dropped");
            self.job_queues.remove(key);
        }
    }
}

fn missing_registration(key: &RegistrationKey) -> ServiceWorkerError {
    ServiceWorkerError::StateError(format!("registration for '{}' no longer exists", key.scope))
}

/// Scheme, origin and scope checks for register and update jobs.
fn validate_job_urls(job: &JobData) -> Result<(), ServiceWorkerError> {
    for url in [&job.script_url, &job.scope_url] {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ServiceWorkerError::TypeError(format!(
                "'{}' must use http or https",
                url
            )));
        }
    }

    let client_origin = SecurityOriginData::from_url(&job.client_creation_url);
    if !client_origin.contains(&job.script_url) {
        return Err(ServiceWorkerError::SecurityError(format!(
            "script '{}' is not same-origin with {}",
            job.script_url, client_origin
        )));
    }
    if !client_origin.contains(&job.scope_url) {
        return Err(ServiceWorkerError::SecurityError(format!(
            "scope '{}' is not same-origin with {}",
            job.scope_url, client_origin
        )));
    }

    let max_scope = job
        .script_url
        .join("./")
        .map_err(|e| ServiceWorkerError::TypeError(e.to_string()))?;
    if !job.scope_url.as_str().starts_with(max_scope.as_str()) {
        return Err(ServiceWorkerError::SecurityError(format!(
            "scope '{}' is outside the maximum scope '{}'",
            job.scope_url, max_scope
        )));
    }
    Ok(())
}
