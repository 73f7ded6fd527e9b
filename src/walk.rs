//! Fingerprint-memoized driver executing a DAG of actions.
//!
//! The walker sits between the scheduler and the caller's [`WalkHooks`]
//! implementation. Per ready vertex it decides whether to materialize a real
//! job, a skip job (fingerprints show the action is up to date), or a
//! force-fail job (a predecessor failed), and after each completion it
//! persists the definitive fingerprint and records the final status.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::mpsc::Sender;
use std::time::Duration;

use tracing::{debug, info};

use crate::dag::Dag;
use crate::fingerprint::Fingerprint;
use crate::job::Job;
use crate::scheduler::{
    DEFAULT_JOB_MAX_DURATION, JobSource, RunReport, Scheduler, SchedulerError,
};
use crate::status::JobStatus;

/// Queue layout and job timeout used when the walker builds its scheduler.
#[derive(Debug, Clone)]
pub struct SchedulingParams {
    pub queues: BTreeMap<String, usize>,
    pub job_timeout: Option<Duration>,
}

impl Default for SchedulingParams {
    fn default() -> Self {
        Self {
            queues: BTreeMap::from([("default".to_string(), 1)]),
            job_timeout: Some(DEFAULT_JOB_MAX_DURATION),
        }
    }
}

/// Caller hooks driving a [`Walker`].
///
/// Only `create_job` is mandatory. The fingerprint hooks default to "no
/// memoization", which makes every action run on every walk.
pub trait WalkHooks<D: Clone> {
    /// Materialize the real job for an action that must run.
    fn create_job(
        &mut self,
        uid: &str,
        data: Option<&D>,
        predecessors: &BTreeSet<String>,
        notify_end: &Sender<String>,
    ) -> Job<D>;

    /// Job used when the action must not run. The default returns an empty
    /// job carrying `status`.
    fn create_skipped_job(
        &mut self,
        uid: &str,
        data: Option<&D>,
        _predecessors: &BTreeSet<String>,
        _reason: &str,
        notify_end: &Sender<String>,
        status: JobStatus,
    ) -> Job<D> {
        Job::empty(uid, data.cloned(), notify_end.clone(), status)
    }

    /// Fingerprint of the action's own inputs.
    ///
    /// The walker extends the returned fingerprint with the checksum of
    /// every predecessor fingerprint before comparing, so hooks only cover
    /// what the action itself consumes. Return `None` when the fingerprint
    /// cannot be known at this point; with `is_prediction` set that means
    /// "always run, the fingerprint is determined after the fact".
    fn compute_fingerprint(
        &mut self,
        _uid: &str,
        _data: Option<&D>,
        _is_prediction: bool,
    ) -> Option<Fingerprint> {
        None
    }

    /// Fingerprint persisted by a previous walk, or `None`.
    fn load_previous_fingerprint(&mut self, _uid: &str) -> Option<Fingerprint> {
        None
    }

    /// Persist a fingerprint; `None` deletes the stored entry.
    fn save_fingerprint(&mut self, _uid: &str, _fingerprint: Option<&Fingerprint>) {}

    /// Whether the action must run given its previous and predicted
    /// fingerprints. `predecessors_predicted` is false when any predecessor
    /// could not predict its own fingerprint, in which case "unchanged"
    /// cannot be assumed.
    fn should_execute_action(
        &mut self,
        _uid: &str,
        previous: Option<&Fingerprint>,
        new: Option<&Fingerprint>,
        predecessors_predicted: bool,
    ) -> bool {
        match (previous, new) {
            (Some(previous), Some(new)) if predecessors_predicted => previous != new,
            _ => true,
        }
    }

    /// Whether a `notready` job should be requeued. Called once per
    /// `notready` completion; the default never requeues.
    fn request_requeue(&mut self, _job: &Job<D>) -> bool {
        false
    }

    /// Scheduler layout for this walk: one `default` queue of one token and
    /// a 24-hour job timeout unless overridden.
    fn scheduling_params(&self) -> SchedulingParams {
        SchedulingParams::default()
    }
}

/// Drives a [`Dag`] of actions through a [`Scheduler`] with fingerprint
/// memoization and failure propagation.
pub struct Walker<'a, D: Clone, H: WalkHooks<D>> {
    actions: &'a Dag<D>,
    hooks: H,
    /// Predicted (then definitive) fingerprints of this walk, by uid.
    new_fingerprints: HashMap<String, Option<Fingerprint>>,
    job_status: HashMap<String, JobStatus>,
    /// For force-failed vertices, the root failures that caused it.
    failure_source: HashMap<String, BTreeSet<String>>,
}

impl<'a, D: Clone, H: WalkHooks<D>> Walker<'a, D, H> {
    pub fn new(actions: &'a Dag<D>, hooks: H) -> Self {
        Self {
            actions,
            hooks,
            new_fingerprints: HashMap::new(),
            job_status: HashMap::new(),
            failure_source: HashMap::new(),
        }
    }

    /// Walk the whole graph with a scheduler built from
    /// [`WalkHooks::scheduling_params`].
    pub fn run(&mut self) -> Result<RunReport, SchedulerError> {
        let params = self.hooks.scheduling_params();
        let mut scheduler = Scheduler::with_queues(params.queues, params.job_timeout);
        self.run_with(&mut scheduler)
    }

    /// Walk the graph with a caller-built scheduler, e.g. one carrying a
    /// run log or an installed interrupt handler.
    pub fn run_with(&mut self, scheduler: &mut Scheduler<D>) -> Result<RunReport, SchedulerError> {
        let actions = self.actions;
        scheduler.run(actions, self)
    }

    /// Final status of every collected vertex.
    pub fn job_status(&self) -> &HashMap<String, JobStatus> {
        &self.job_status
    }

    pub fn status_of(&self, uid: &str) -> Option<JobStatus> {
        self.job_status.get(uid).copied()
    }

    /// Root failures that force-failed `uid`, when it was force-failed.
    pub fn failure_origin(&self, uid: &str) -> Option<&BTreeSet<String>> {
        self.failure_source.get(uid)
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    pub fn into_hooks(self) -> H {
        self.hooks
    }

    /// Hook fingerprint extended with every predecessor's fingerprint, so
    /// an upstream change re-executes the whole downstream cone.
    fn fingerprint_with_dependencies(
        &mut self,
        uid: &str,
        data: Option<&D>,
        is_prediction: bool,
    ) -> Option<Fingerprint> {
        let mut fingerprint = self.hooks.compute_fingerprint(uid, data, is_prediction)?;
        if let Ok(predecessors) = self.actions.get_predecessors(uid) {
            for pred in predecessors {
                if let Some(Some(pred_fingerprint)) = self.new_fingerprints.get(pred.as_str()) {
                    fingerprint.add(&format!("dep:{pred}"), &pred_fingerprint.checksum());
                }
            }
        }
        Some(fingerprint)
    }
}

impl<D: Clone, H: WalkHooks<D>> JobSource<D> for Walker<'_, D, H> {
    fn get_job(
        &mut self,
        uid: &str,
        data: Option<&D>,
        predecessors: &BTreeSet<String>,
        notify_end: &Sender<String>,
    ) -> Job<D> {
        let previous = self.hooks.load_previous_fingerprint(uid);
        // Erase the stored fingerprint before anything runs: an aborted walk
        // must never leave a stale positive behind.
        self.hooks.save_fingerprint(uid, None);

        let predicted = self.fingerprint_with_dependencies(uid, data, true);
        self.new_fingerprints
            .insert(uid.to_string(), predicted.clone());

        let failed: Vec<String> = predecessors
            .iter()
            .filter(|p| {
                !self
                    .job_status
                    .get(p.as_str())
                    .is_some_and(|status| status.is_predecessor_ok())
            })
            .cloned()
            .collect();
        if !failed.is_empty() {
            // The origin set is transitive: force-failed predecessors pass
            // their own origins along, real failures contribute themselves.
            let mut origins = BTreeSet::new();
            for pred in &failed {
                match self.failure_source.get(pred) {
                    Some(source) => origins.extend(source.iter().cloned()),
                    None => {
                        origins.insert(pred.clone());
                    }
                }
            }
            let reason = format!(
                "aborted because of prerequisite failure (origin: {})",
                origins.iter().cloned().collect::<Vec<_>>().join(", ")
            );
            debug!(uid = %uid, origins = ?origins, "force-failing job");
            self.failure_source.insert(uid.to_string(), origins);
            return self.hooks.create_skipped_job(
                uid,
                data,
                predecessors,
                &reason,
                notify_end,
                JobStatus::ForceFail,
            );
        }

        let predecessors_predicted = predecessors.iter().all(|p| {
            self.new_fingerprints
                .get(p.as_str())
                .is_some_and(Option::is_some)
        });
        if self.hooks.should_execute_action(
            uid,
            previous.as_ref(),
            predicted.as_ref(),
            predecessors_predicted,
        ) {
            self.hooks.create_job(uid, data, predecessors, notify_end)
        } else {
            self.hooks.create_skipped_job(
                uid,
                data,
                predecessors,
                "up to date",
                notify_end,
                JobStatus::Skip,
            )
        }
    }

    fn collect(&mut self, job: &mut Job<D>) -> bool {
        let status = job.status();
        if status.is_predecessor_ok() {
            // Every effect is observable now: compute the definitive
            // fingerprint and persist it. Leaving nothing stored on failure
            // means the action runs again next walk.
            let fingerprint = self.fingerprint_with_dependencies(job.uid(), job.data(), false);
            self.hooks.save_fingerprint(job.uid(), fingerprint.as_ref());
            self.new_fingerprints
                .insert(job.uid().to_string(), fingerprint);
        }
        self.job_status.insert(job.uid().to_string(), status);

        if job.should_skip() {
            if matches!(status, JobStatus::ForceFail | JobStatus::ForceSkip) {
                debug!("[{:<10} {:<10} {:>4}s] {}", job.queue_name, status, 0, job.uid());
            } else {
                info!("[{:<10} {:<10} {:>4}s] {}", job.queue_name, status, 0, job.uid());
            }
            return false;
        }

        let elapsed = job.timing_info().duration.as_secs();
        info!(
            "[{:<10} {:<10} {:>4}s] {}",
            job.queue_name,
            status,
            elapsed,
            job.uid()
        );
        if status == JobStatus::NotReady {
            self.hooks.request_requeue(job)
        } else {
            false
        }
    }
}
