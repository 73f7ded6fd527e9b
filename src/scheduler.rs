//! Token-budgeted parallel scheduler for DAGs of jobs.
//!
//! The scheduler drives a [`DagIterator`] in busy-state mode on a single
//! control thread:
//! - ready vertices are turned into jobs by a [`JobSource`] and pushed on
//!   their queue's priority heap,
//! - queues launch jobs while tokens remain, each active job holding a slot
//!   number unique among running jobs,
//! - the driver blocks only on the completion channel, sized to the oldest
//!   active job's remaining time budget, and interrupts that job when the
//!   budget expires.
//!
//! Job bodies are the only code running concurrently; queue bookkeeping,
//! iterator advancement, and `collect` all happen on the driver thread.

use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dag::{Dag, DagIterator, NextVertex};
use crate::job::Job;
use crate::log::{LogEvent, RunLog};

/// Default maximum duration for a job (24 hours).
pub const DEFAULT_JOB_MAX_DURATION: Duration = Duration::from_secs(3600 * 24);

/// Completion-channel wait floor, so interruption keeps propagating even
/// once a job has exceeded its deadline.
const MIN_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job {uid} was pushed on unknown queue {queue}")]
    UnknownQueue { uid: String, queue: String },
    #[error("job {uid} requests {tokens} tokens but queue {queue} caps at {capacity}")]
    NotSchedulable {
        uid: String,
        queue: String,
        tokens: usize,
        capacity: usize,
    },
    #[error("no job is ready, queued, or active but the graph is not exhausted (dependency cycle?)")]
    Deadlocked,
    #[error("run was interrupted")]
    Interrupted,
    #[error("completion channel closed while {0} jobs were active")]
    ChannelClosed(usize),
}

/// Produces and collects the jobs of a scheduler run.
///
/// `get_job` is called once per ready vertex (the returned job must reuse
/// the vertex id as its uid); `collect` is called exactly once per completed
/// job execution and requeues the job by returning true.
pub trait JobSource<D> {
    fn get_job(
        &mut self,
        uid: &str,
        data: Option<&D>,
        predecessors: &BTreeSet<String>,
        notify_end: &Sender<String>,
    ) -> Job<D>;

    fn collect(&mut self, job: &mut Job<D>) -> bool;
}

/// [`JobSource`] adapter over a pair of closures.
pub struct FnJobSource<P, C> {
    pub provider: P,
    pub collect: C,
}

impl<D, P, C> JobSource<D> for FnJobSource<P, C>
where
    P: FnMut(&str, Option<&D>, &BTreeSet<String>, &Sender<String>) -> Job<D>,
    C: FnMut(&mut Job<D>) -> bool,
{
    fn get_job(
        &mut self,
        uid: &str,
        data: Option<&D>,
        predecessors: &BTreeSet<String>,
        notify_end: &Sender<String>,
    ) -> Job<D> {
        (self.provider)(uid, data, predecessors, notify_end)
    }

    fn collect(&mut self, job: &mut Job<D>) -> bool {
        (self.collect)(job)
    }
}

/// A panicking provider yields a failed pre-resolved job for the affected
/// vertex instead of aborting the run; descendants observe the failure
/// through their predecessor statuses.
fn safe_get_job<D, S: JobSource<D>>(
    source: &mut S,
    uid: &str,
    data: Option<&D>,
    predecessors: &BTreeSet<String>,
    notify_end: &Sender<String>,
) -> Job<D> {
    panic::catch_unwind(AssertUnwindSafe(|| {
        source.get_job(uid, data, predecessors, notify_end)
    }))
    .unwrap_or_else(|_| {
        warn!(uid = %uid, "job provider panicked, failing the vertex");
        Job::empty(uid, None, notify_end.clone(), crate::status::JobStatus::Failure)
    })
}

/// A panicking collect counts as "do not requeue"; the vertex keeps the
/// status its job produced.
fn safe_collect<D, S: JobSource<D>>(source: &mut S, job: &mut Job<D>) -> bool {
    panic::catch_unwind(AssertUnwindSafe(|| source.collect(job))).unwrap_or_else(|_| {
        warn!(uid = %job.uid(), "collect panicked, not requeueing");
        false
    })
}

/// Heap entry ordering: highest priority first, then earliest insertion.
struct QueuedJob<D>(Job<D>);

impl<D> PartialEq for QueuedJob<D> {
    fn eq(&self, other: &Self) -> bool {
        self.0.index() == other.0.index()
    }
}

impl<D> Eq for QueuedJob<D> {}

impl<D> PartialOrd for QueuedJob<D> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<D> Ord for QueuedJob<D> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.index().cmp(&self.0.index()))
    }
}

struct QueueState<D> {
    capacity: usize,
    /// Tokens not currently held by active jobs.
    tokens: usize,
    ready: BinaryHeap<QueuedJob<D>>,
}

/// Summary of one completed scheduler run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
    pub duration_secs: f64,
    /// High-water mark of concurrently active jobs.
    pub max_active_jobs: usize,
}

/// Parallel executor for one [`Dag`] of jobs.
pub struct Scheduler<D> {
    queues: BTreeMap<String, QueueState<D>>,
    job_timeout: Option<Duration>,
    slots: Vec<usize>,
    active: Vec<Job<D>>,
    queued_jobs: usize,
    all_jobs_queued: bool,
    max_active_jobs: usize,
    cancel: Arc<AtomicBool>,
    run_log: Option<RunLog>,
}

impl<D> Scheduler<D> {
    /// Scheduler with a single `default` queue of `tokens` capacity.
    ///
    /// A `job_timeout` of `None` disables per-job deadlines, but also makes
    /// the completion wait non-interruptible.
    pub fn new(tokens: usize, job_timeout: Option<Duration>) -> Self {
        Self::with_queues(
            BTreeMap::from([("default".to_string(), tokens)]),
            job_timeout,
        )
    }

    /// Scheduler with named queues, each with its own token capacity.
    pub fn with_queues(queues: BTreeMap<String, usize>, job_timeout: Option<Duration>) -> Self {
        let total_tokens: usize = queues.values().sum();
        Self {
            queues: queues
                .into_iter()
                .map(|(name, capacity)| {
                    (
                        name,
                        QueueState {
                            capacity,
                            tokens: capacity,
                            ready: BinaryHeap::new(),
                        },
                    )
                })
                .collect(),
            job_timeout,
            slots: (0..total_tokens).rev().collect(),
            active: Vec::new(),
            queued_jobs: 0,
            all_jobs_queued: false,
            max_active_jobs: 0,
            cancel: Arc::new(AtomicBool::new(false)),
            run_log: None,
        }
    }

    /// Shared cancellation flag; setting it aborts the run at the next
    /// driver iteration.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Route Ctrl-C to the cancellation flag. Can only be installed once
    /// per process.
    pub fn install_interrupt_handler(&self) -> Result<(), ctrlc::Error> {
        let cancel = self.cancel_flag();
        ctrlc::set_handler(move || cancel.store(true, Ordering::SeqCst))
    }

    /// Attach a structured JSONL run log.
    pub fn set_run_log(&mut self, run_log: RunLog) {
        self.run_log = Some(run_log);
    }

    pub fn max_active_jobs(&self) -> usize {
        self.max_active_jobs
    }

    fn record(&self, event: LogEvent) {
        if let Some(run_log) = &self.run_log
            && let Err(error) = run_log.record(event)
        {
            warn!(%error, "failed to write run log entry");
        }
    }

    fn reset(&mut self) {
        let mut total_tokens = 0;
        for queue in self.queues.values_mut() {
            queue.tokens = queue.capacity;
            queue.ready.clear();
            total_tokens += queue.capacity;
        }
        self.slots = (0..total_tokens).rev().collect();
        self.active.clear();
        self.queued_jobs = 0;
        self.all_jobs_queued = false;
        self.max_active_jobs = 0;
    }

    fn is_finished(&self) -> bool {
        self.all_jobs_queued && self.queued_jobs == 0 && self.active.is_empty()
    }

    /// Execute every job of `dag` and return the run summary.
    ///
    /// The graph must stay frozen for the duration of the call. Jobs come
    /// from `source.get_job`; every completed execution goes back through
    /// `source.collect`, which may requeue it.
    pub fn run<S: JobSource<D>>(
        &mut self,
        dag: &Dag<D>,
        source: &mut S,
    ) -> Result<RunReport, SchedulerError> {
        self.reset();
        let (tx, rx) = channel();
        let mut iterator = DagIterator::new(dag, true);
        let start_time = Utc::now();
        let started = Instant::now();
        self.record(LogEvent::RunStarted { vertices: dag.len() });

        while !self.is_finished() {
            if self.cancel.load(Ordering::SeqCst) {
                self.abort(source);
                return Err(SchedulerError::Interrupted);
            }
            self.enqueue(&mut iterator, source, &tx)?;
            self.launch();
            self.max_active_jobs = self.max_active_jobs.max(self.active.len());
            debug!(
                exhausted = self.all_jobs_queued,
                queued = self.queued_jobs,
                active = self.active.len(),
                "scheduler state"
            );
            if !self.all_jobs_queued && self.queued_jobs == 0 && self.active.is_empty() {
                return Err(SchedulerError::Deadlocked);
            }
            self.wait(&mut iterator, source, &rx)?;
        }

        let stop_time = Utc::now();
        let report = RunReport {
            start_time,
            stop_time,
            duration_secs: started.elapsed().as_secs_f64(),
            max_active_jobs: self.max_active_jobs,
        };
        self.record(LogEvent::RunFinished {
            max_active_jobs: self.max_active_jobs,
            duration_secs: report.duration_secs,
        });
        Ok(report)
    }

    /// Pull every currently ready vertex and queue its job. Pre-resolved
    /// jobs are collected on the spot and never hit a queue.
    fn enqueue<S: JobSource<D>>(
        &mut self,
        iterator: &mut DagIterator<'_, D>,
        source: &mut S,
        tx: &Sender<String>,
    ) -> Result<(), SchedulerError> {
        if self.all_jobs_queued {
            return Ok(());
        }
        loop {
            match iterator.next_element() {
                NextVertex::Exhausted => {
                    self.all_jobs_queued = true;
                    return Ok(());
                }
                NextVertex::Stalled => return Ok(()),
                NextVertex::Ready {
                    id,
                    data,
                    predecessors,
                } => {
                    let mut job = safe_get_job(source, id, data, predecessors, tx);
                    if job.should_skip() {
                        let _ = safe_collect(source, &mut job);
                        self.record(LogEvent::JobSkipped {
                            uid: id.to_string(),
                            status: job.status(),
                        });
                        iterator.leave(id);
                    } else {
                        self.push(job)?;
                    }
                }
            }
        }
    }

    fn push(&mut self, job: Job<D>) -> Result<(), SchedulerError> {
        let Some(queue) = self.queues.get(&job.queue_name) else {
            return Err(SchedulerError::UnknownQueue {
                uid: job.uid().to_string(),
                queue: job.queue_name.clone(),
            });
        };
        if job.tokens > queue.capacity {
            return Err(SchedulerError::NotSchedulable {
                uid: job.uid().to_string(),
                queue: job.queue_name.clone(),
                tokens: job.tokens,
                capacity: queue.capacity,
            });
        }
        self.record(LogEvent::JobQueued {
            uid: job.uid().to_string(),
            queue: job.queue_name.clone(),
            priority: job.priority,
        });
        if let Some(queue) = self.queues.get_mut(&job.queue_name) {
            queue.ready.push(QueuedJob(job));
            self.queued_jobs += 1;
        }
        Ok(())
    }

    /// Start queued jobs while their queue has tokens left.
    fn launch(&mut self) {
        if self.queued_jobs == 0 {
            return;
        }
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            loop {
                let mut job = {
                    let Some(queue) = self.queues.get_mut(&name) else {
                        break;
                    };
                    let launchable = queue
                        .ready
                        .peek()
                        .is_some_and(|next| next.0.tokens <= queue.tokens);
                    if !launchable {
                        break;
                    }
                    let Some(QueuedJob(job)) = queue.ready.pop() else {
                        break;
                    };
                    queue.tokens -= job.tokens;
                    job
                };
                self.queued_jobs -= 1;
                let slot = self.slots.pop().expect("slot reserve exhausted");
                job.start(slot);
                self.record(LogEvent::JobStarted {
                    uid: job.uid().to_string(),
                    queue: name.clone(),
                    slot,
                    tokens: job.tokens,
                });
                self.active.push(job);
            }
        }
    }

    /// Block until one active job completes, interrupting the oldest active
    /// job whenever it exceeds the configured timeout.
    fn wait<S: JobSource<D>>(
        &mut self,
        iterator: &mut DagIterator<'_, D>,
        source: &mut S,
        rx: &Receiver<String>,
    ) -> Result<(), SchedulerError> {
        if self.active.is_empty() {
            return Ok(());
        }
        loop {
            let received = match self.job_timeout {
                None => rx
                    .recv()
                    .map_err(|_| SchedulerError::ChannelClosed(self.active.len())),
                Some(limit) => {
                    // The first active job is the oldest; size the wait to
                    // its remaining budget.
                    let elapsed = self.active[0].timing_info().duration;
                    let wait = limit.saturating_sub(elapsed).max(MIN_WAIT);
                    match rx.recv_timeout(wait) {
                        Ok(uid) => Ok(uid),
                        Err(RecvTimeoutError::Timeout) => {
                            debug!(uid = %self.active[0].uid(), "job deadline reached, interrupting");
                            self.active[0].interrupt();
                            std::thread::sleep(MIN_WAIT);
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            Err(SchedulerError::ChannelClosed(self.active.len()))
                        }
                    }
                }
            };
            let uid = received?;

            let Some(position) = self.active.iter().position(|job| job.uid() == uid) else {
                debug!(uid = %uid, "completion notification for unknown job");
                continue;
            };
            let mut job = self.active.remove(position);
            // Reap the worker before collect so the job state is final.
            if let Some(handle) = job.take_handle() {
                let _ = handle.join();
            }
            let timing = job.timing_info();
            debug!(
                uid = %uid,
                interrupted = job.interrupted(),
                duration_secs = timing.duration.as_secs_f64(),
                "job finished"
            );

            if let Some(slot) = job.slot() {
                self.slots.push(slot);
            }
            if let Some(queue) = self.queues.get_mut(&job.queue_name) {
                queue.tokens += job.tokens;
            }

            let requeued = safe_collect(source, &mut job);
            self.record(LogEvent::JobFinished {
                uid: uid.clone(),
                status: job.status(),
                interrupted: job.interrupted(),
                duration_secs: timing.duration.as_secs_f64(),
                requeued,
            });
            if requeued {
                self.push(job)?;
            } else {
                iterator.leave(&uid);
            }
            return Ok(());
        }
    }

    /// Interrupt and collect every active job, then give up on the run.
    fn abort<S: JobSource<D>>(&mut self, source: &mut S) {
        info!(active = self.active.len(), "interrupting active jobs");
        let jobs = std::mem::take(&mut self.active);
        for job in &jobs {
            job.interrupt();
        }
        for mut job in jobs {
            let _ = safe_collect(source, &mut job);
            self.record(LogEvent::JobFinished {
                uid: job.uid().to_string(),
                status: job.status(),
                interrupted: true,
                duration_secs: job.timing_info().duration.as_secs_f64(),
                requeued: false,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobSignals;
    use crate::status::JobStatus;
    use serial_test::serial;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};

    type Statuses = Arc<Mutex<BTreeMap<String, JobStatus>>>;

    /// Honor `RUST_LOG` when debugging a test run; repeat registration from
    /// parallel tests is fine.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn diamond() -> Dag<()> {
        let mut dag: Dag<()> = Dag::new();
        dag.add_vertex("a", None, &[]).unwrap();
        dag.add_vertex("b", None, &["a"]).unwrap();
        dag.add_vertex("c", None, &["a"]).unwrap();
        dag.add_vertex("d", None, &["b", "c"]).unwrap();
        dag
    }

    /// Source whose jobs record their execution order and succeed.
    fn recording_source(
        order: Arc<Mutex<Vec<String>>>,
        statuses: Statuses,
    ) -> FnJobSource<
        impl FnMut(&str, Option<&()>, &BTreeSet<String>, &Sender<String>) -> Job<()>,
        impl FnMut(&mut Job<()>) -> bool,
    > {
        FnJobSource {
            provider: move |uid: &str,
                            _data: Option<&()>,
                            _preds: &BTreeSet<String>,
                            notify: &Sender<String>| {
                let order = Arc::clone(&order);
                let uid_owned = uid.to_string();
                Job::new(uid, None, notify.clone(), move |_| {
                    order.lock().unwrap().push(uid_owned.clone());
                    JobStatus::Success
                })
            },
            collect: move |job: &mut Job<()>| {
                statuses
                    .lock()
                    .unwrap()
                    .insert(job.uid().to_string(), job.status());
                false
            },
        }
    }

    fn position(order: &[String], uid: &str) -> usize {
        order
            .iter()
            .position(|entry| entry == uid)
            .unwrap_or_else(|| panic!("{uid} never ran, order={order:?}"))
    }

    #[test]
    fn diamond_respects_dependencies_with_two_tokens() {
        init_tracing();
        let dag = diamond();
        let order = Arc::new(Mutex::new(Vec::new()));
        let statuses: Statuses = Arc::new(Mutex::new(BTreeMap::new()));
        let mut source = recording_source(Arc::clone(&order), Arc::clone(&statuses));

        let mut scheduler = Scheduler::new(2, Some(Duration::from_secs(60)));
        let report = scheduler.run(&dag, &mut source).unwrap();

        let order = order.lock().unwrap();
        assert_eq!(order.len(), 4);
        assert!(position(&order, "a") < position(&order, "b"));
        assert!(position(&order, "a") < position(&order, "c"));
        assert!(position(&order, "b") < position(&order, "d"));
        assert!(position(&order, "c") < position(&order, "d"));

        let statuses = statuses.lock().unwrap();
        assert!(statuses.values().all(|s| *s == JobStatus::Success));
        assert_eq!(statuses.len(), 4);

        // b and c become ready together once a leaves, so both run at once.
        assert_eq!(report.max_active_jobs, 2);
        assert!(report.start_time <= report.stop_time);
        assert!(report.duration_secs >= 0.0);
    }

    #[test]
    fn diamond_serializes_with_one_token() {
        let dag = diamond();
        let order = Arc::new(Mutex::new(Vec::new()));
        let statuses: Statuses = Arc::new(Mutex::new(BTreeMap::new()));
        let mut source = recording_source(Arc::clone(&order), statuses);

        let mut scheduler = Scheduler::new(1, Some(Duration::from_secs(60)));
        let report = scheduler.run(&dag, &mut source).unwrap();

        assert_eq!(order.lock().unwrap().len(), 4);
        assert_eq!(report.max_active_jobs, 1);
    }

    #[test]
    fn empty_dag_completes_without_callbacks() {
        let dag: Dag<()> = Dag::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let provider_calls = Arc::clone(&calls);
        let collect_calls = Arc::clone(&calls);
        let mut source = FnJobSource {
            provider: move |uid: &str,
                            _: Option<&()>,
                            _: &BTreeSet<String>,
                            notify: &Sender<String>| {
                provider_calls.fetch_add(1, Ordering::SeqCst);
                Job::new(uid, None, notify.clone(), |_| JobStatus::Success)
            },
            collect: move |_: &mut Job<()>| {
                collect_calls.fetch_add(1, Ordering::SeqCst);
                false
            },
        };
        let mut scheduler = Scheduler::new(1, Some(Duration::from_secs(5)));
        let report = scheduler.run(&dag, &mut source).unwrap();
        assert_eq!(report.max_active_jobs, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_provider_fails_only_its_vertex() {
        let mut dag: Dag<()> = Dag::new();
        dag.add_vertex("bad", None, &[]).unwrap();
        dag.add_vertex("good", None, &[]).unwrap();

        let statuses: Statuses = Arc::new(Mutex::new(BTreeMap::new()));
        let statuses_in = Arc::clone(&statuses);
        let mut source = FnJobSource {
            provider: |uid: &str, _: Option<&()>, _: &BTreeSet<String>, notify: &Sender<String>| {
                if uid == "bad" {
                    panic!("provider rejected {uid}");
                }
                Job::new(uid, None, notify.clone(), |_| JobStatus::Success)
            },
            collect: move |job: &mut Job<()>| {
                statuses_in
                    .lock()
                    .unwrap()
                    .insert(job.uid().to_string(), job.status());
                false
            },
        };

        let mut scheduler = Scheduler::new(1, Some(Duration::from_secs(5)));
        scheduler.run(&dag, &mut source).unwrap();

        let statuses = statuses.lock().unwrap();
        assert_eq!(statuses["bad"], JobStatus::Failure);
        assert_eq!(statuses["good"], JobStatus::Success);
    }

    #[test]
    fn disabled_timeout_never_interrupts() {
        let mut dag: Dag<()> = Dag::new();
        dag.add_vertex("slowish", None, &[]).unwrap();

        let outcome = Arc::new(Mutex::new((JobStatus::Unknown, false)));
        let outcome_in = Arc::clone(&outcome);
        let mut source = FnJobSource {
            provider: |uid: &str, _: Option<&()>, _: &BTreeSet<String>, notify: &Sender<String>| {
                Job::new(uid, None, notify.clone(), |_| {
                    std::thread::sleep(Duration::from_millis(300));
                    JobStatus::Success
                })
            },
            collect: move |job: &mut Job<()>| {
                *outcome_in.lock().unwrap() = (job.status(), job.interrupted());
                false
            },
        };

        let mut scheduler = Scheduler::new(1, None);
        scheduler.run(&dag, &mut source).unwrap();
        let (status, interrupted) = *outcome.lock().unwrap();
        assert_eq!(status, JobStatus::Success);
        assert!(!interrupted);
    }

    #[test]
    fn single_vertex_runs_exactly_once() {
        let mut dag: Dag<()> = Dag::new();
        dag.add_vertex("only", None, &[]).unwrap();

        let provided = Arc::new(AtomicUsize::new(0));
        let collected = Arc::new(AtomicUsize::new(0));
        let provided_in = Arc::clone(&provided);
        let collected_in = Arc::clone(&collected);

        let mut source = FnJobSource {
            provider: move |uid: &str,
                            _: Option<&()>,
                            _: &BTreeSet<String>,
                            notify: &Sender<String>| {
                provided_in.fetch_add(1, Ordering::SeqCst);
                Job::new(uid, None, notify.clone(), |_| JobStatus::Success)
            },
            collect: move |_: &mut Job<()>| {
                collected_in.fetch_add(1, Ordering::SeqCst);
                false
            },
        };

        let mut scheduler = Scheduler::new(4, Some(Duration::from_secs(5)));
        scheduler.run(&dag, &mut source).unwrap();
        assert_eq!(provided.load(Ordering::SeqCst), 1);
        assert_eq!(collected.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn priorities_order_a_single_token_queue() {
        let mut dag: Dag<()> = Dag::new();
        dag.add_vertex("x0", None, &[]).unwrap();
        dag.add_vertex("x1", None, &[]).unwrap();
        dag.add_vertex("x2", None, &[]).unwrap();
        let priorities = BTreeMap::from([("x0", 0), ("x1", 10), ("x2", 5)]);

        let order = Arc::new(Mutex::new(Vec::new()));
        let order_in = Arc::clone(&order);
        let mut source = FnJobSource {
            provider: move |uid: &str,
                            _: Option<&()>,
                            _: &BTreeSet<String>,
                            notify: &Sender<String>| {
                let order = Arc::clone(&order_in);
                let uid_owned = uid.to_string();
                let mut job = Job::new(uid, None, notify.clone(), move |_| {
                    order.lock().unwrap().push(uid_owned.clone());
                    JobStatus::Success
                });
                job.priority = priorities[uid];
                job
            },
            collect: |_: &mut Job<()>| false,
        };

        let mut scheduler = Scheduler::new(1, Some(Duration::from_secs(5)));
        scheduler.run(&dag, &mut source).unwrap();
        assert_eq!(
            *order.lock().unwrap(),
            vec!["x1".to_string(), "x2".to_string(), "x0".to_string()]
        );
    }

    #[test]
    fn equal_priorities_fall_back_to_insertion_order() {
        let mut dag: Dag<()> = Dag::new();
        dag.add_vertex("a", None, &[]).unwrap();
        dag.add_vertex("b", None, &[]).unwrap();
        dag.add_vertex("c", None, &[]).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let statuses: Statuses = Arc::new(Mutex::new(BTreeMap::new()));
        let mut source = recording_source(Arc::clone(&order), statuses);

        let mut scheduler = Scheduler::new(1, Some(Duration::from_secs(5)));
        scheduler.run(&dag, &mut source).unwrap();
        assert_eq!(
            *order.lock().unwrap(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn skip_jobs_are_collected_without_dispatch() {
        let mut dag: Dag<()> = Dag::new();
        dag.add_vertex("skipped", None, &[]).unwrap();
        dag.add_vertex("after", None, &["skipped"]).unwrap();

        let ran = Arc::new(Mutex::new(Vec::new()));
        let statuses: Statuses = Arc::new(Mutex::new(BTreeMap::new()));
        let ran_in = Arc::clone(&ran);
        let statuses_in = Arc::clone(&statuses);

        let mut source = FnJobSource {
            provider: move |uid: &str,
                            _: Option<&()>,
                            _: &BTreeSet<String>,
                            notify: &Sender<String>| {
                if uid == "skipped" {
                    Job::empty(uid, None, notify.clone(), JobStatus::Skip)
                } else {
                    let ran = Arc::clone(&ran_in);
                    let uid_owned = uid.to_string();
                    Job::new(uid, None, notify.clone(), move |_| {
                        ran.lock().unwrap().push(uid_owned.clone());
                        JobStatus::Success
                    })
                }
            },
            collect: move |job: &mut Job<()>| {
                statuses_in
                    .lock()
                    .unwrap()
                    .insert(job.uid().to_string(), job.status());
                false
            },
        };

        let mut scheduler = Scheduler::new(1, Some(Duration::from_secs(5)));
        scheduler.run(&dag, &mut source).unwrap();

        assert_eq!(*ran.lock().unwrap(), vec!["after".to_string()]);
        let statuses = statuses.lock().unwrap();
        assert_eq!(statuses["skipped"], JobStatus::Skip);
        assert_eq!(statuses["after"], JobStatus::Success);
    }

    #[test]
    fn notready_jobs_can_be_requeued() {
        let mut dag: Dag<()> = Dag::new();
        dag.add_vertex("flaky", None, &[]).unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let collects = Arc::new(AtomicUsize::new(0));
        let attempts_in = Arc::clone(&attempts);
        let collects_in = Arc::clone(&collects);
        let last_status = Arc::new(Mutex::new(JobStatus::Unknown));
        let last_status_in = Arc::clone(&last_status);

        let mut source = FnJobSource {
            provider: move |uid: &str,
                            _: Option<&()>,
                            _: &BTreeSet<String>,
                            notify: &Sender<String>| {
                let attempts = Arc::clone(&attempts_in);
                Job::new(uid, None, notify.clone(), move |_| {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        JobStatus::NotReady
                    } else {
                        JobStatus::Success
                    }
                })
            },
            collect: move |job: &mut Job<()>| {
                collects_in.fetch_add(1, Ordering::SeqCst);
                *last_status_in.lock().unwrap() = job.status();
                job.status() == JobStatus::NotReady
            },
        };

        let mut scheduler = Scheduler::new(1, Some(Duration::from_secs(5)));
        scheduler.run(&dag, &mut source).unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(collects.load(Ordering::SeqCst), 2);
        assert_eq!(*last_status.lock().unwrap(), JobStatus::Success);
    }

    #[test]
    #[serial]
    fn timeout_interrupts_the_oldest_job() {
        init_tracing();
        let mut dag: Dag<()> = Dag::new();
        dag.add_vertex("long", None, &[]).unwrap();

        let outcome = Arc::new(Mutex::new((JobStatus::Unknown, false, Duration::ZERO)));
        let outcome_in = Arc::clone(&outcome);

        let mut source = FnJobSource {
            provider: |uid: &str,
                       _: Option<&()>,
                       _: &BTreeSet<String>,
                       notify: &Sender<String>| {
                Job::new(uid, None, notify.clone(), |signals: &JobSignals| {
                    let started = Instant::now();
                    while started.elapsed() < Duration::from_secs(30) {
                        if signals.interrupted() {
                            return JobStatus::Failure;
                        }
                        std::thread::sleep(Duration::from_millis(20));
                    }
                    JobStatus::Success
                })
            },
            collect: move |job: &mut Job<()>| {
                *outcome_in.lock().unwrap() =
                    (job.status(), job.interrupted(), job.timing_info().duration);
                false
            },
        };

        let mut scheduler = Scheduler::new(1, Some(Duration::from_millis(400)));
        scheduler.run(&dag, &mut source).unwrap();

        let (status, interrupted, duration) = *outcome.lock().unwrap();
        assert_eq!(status, JobStatus::Failure);
        assert!(interrupted);
        assert!(duration >= Duration::from_millis(400));
        assert!(duration < Duration::from_secs(10), "duration={duration:?}");
    }

    #[test]
    fn queues_advance_independently() {
        let mut dag: Dag<()> = Dag::new();
        for uid in ["build.one", "build.two", "test.one", "test.two"] {
            dag.add_vertex(uid, None, &[]).unwrap();
        }

        let statuses: Statuses = Arc::new(Mutex::new(BTreeMap::new()));
        let statuses_in = Arc::clone(&statuses);
        let mut source = FnJobSource {
            provider: |uid: &str,
                       _: Option<&()>,
                       _: &BTreeSet<String>,
                       notify: &Sender<String>| {
                let mut job: Job<()> = Job::new(uid, None, notify.clone(), |_| JobStatus::Success);
                job.queue_name = uid.split('.').next().unwrap_or("default").to_string();
                job
            },
            collect: move |job: &mut Job<()>| {
                statuses_in
                    .lock()
                    .unwrap()
                    .insert(job.uid().to_string(), job.status());
                false
            },
        };

        let queues = BTreeMap::from([("build".to_string(), 1), ("test".to_string(), 1)]);
        let mut scheduler = Scheduler::with_queues(queues, Some(Duration::from_secs(5)));
        let report = scheduler.run(&dag, &mut source).unwrap();

        assert_eq!(statuses.lock().unwrap().len(), 4);
        // One slot per queue, both start in the same launch phase.
        assert_eq!(report.max_active_jobs, 2);
    }

    #[test]
    fn oversized_jobs_are_rejected_loudly() {
        let mut dag: Dag<()> = Dag::new();
        dag.add_vertex("fat", None, &[]).unwrap();

        let mut source = FnJobSource {
            provider: |uid: &str,
                       _: Option<&()>,
                       _: &BTreeSet<String>,
                       notify: &Sender<String>| {
                let mut job: Job<()> = Job::new(uid, None, notify.clone(), |_| JobStatus::Success);
                job.tokens = 5;
                job
            },
            collect: |_: &mut Job<()>| false,
        };

        let mut scheduler = Scheduler::new(2, Some(Duration::from_secs(5)));
        let err = scheduler.run(&dag, &mut source).unwrap_err();
        assert!(matches!(err, SchedulerError::NotSchedulable { .. }));
    }

    #[test]
    fn unknown_queues_are_rejected_loudly() {
        let mut dag: Dag<()> = Dag::new();
        dag.add_vertex("lost", None, &[]).unwrap();

        let mut source = FnJobSource {
            provider: |uid: &str,
                       _: Option<&()>,
                       _: &BTreeSet<String>,
                       notify: &Sender<String>| {
                let mut job: Job<()> = Job::new(uid, None, notify.clone(), |_| JobStatus::Success);
                job.queue_name = "bulk".to_string();
                job
            },
            collect: |_: &mut Job<()>| false,
        };

        let mut scheduler = Scheduler::new(2, Some(Duration::from_secs(5)));
        let err = scheduler.run(&dag, &mut source).unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownQueue { .. }));
    }

    #[test]
    fn cancellation_aborts_the_run() {
        let mut dag: Dag<()> = Dag::new();
        dag.add_vertex("pending", None, &[]).unwrap();

        let mut source = FnJobSource {
            provider: |uid: &str,
                       _: Option<&()>,
                       _: &BTreeSet<String>,
                       notify: &Sender<String>| {
                Job::new(uid, None, notify.clone(), |_| JobStatus::Success)
            },
            collect: |_: &mut Job<()>| false,
        };

        let mut scheduler = Scheduler::new(1, Some(Duration::from_secs(5)));
        scheduler.cancel_flag().store(true, Ordering::SeqCst);
        let err = scheduler.run(&dag, &mut source).unwrap_err();
        assert!(matches!(err, SchedulerError::Interrupted));
    }

    #[test]
    fn cyclic_graphs_are_reported_as_deadlock() {
        let mut dag: Dag<()> = Dag::new();
        dag.add_vertex("a", None, &[]).unwrap();
        dag.add_vertex("b", None, &[]).unwrap();
        dag.update_vertex("a", None, &["b"]).unwrap();
        dag.update_vertex_unchecked("b", None, &["a"]);

        let mut source = FnJobSource {
            provider: |_: &str,
                       _: Option<&()>,
                       _: &BTreeSet<String>,
                       _: &Sender<String>|
             -> Job<()> { panic!("nothing is ever ready in a cyclic graph") },
            collect: |_: &mut Job<()>| false,
        };

        let mut scheduler = Scheduler::new(1, Some(Duration::from_secs(5)));
        let err = scheduler.run(&dag, &mut source).unwrap_err();
        assert!(matches!(err, SchedulerError::Deadlocked));
    }

    #[test]
    fn run_log_captures_the_job_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("run.jsonl");

        let mut dag: Dag<()> = Dag::new();
        dag.add_vertex("only", None, &[]).unwrap();

        let statuses: Statuses = Arc::new(Mutex::new(BTreeMap::new()));
        let mut source = recording_source(Arc::new(Mutex::new(Vec::new())), statuses);

        let mut scheduler = Scheduler::new(1, Some(Duration::from_secs(5)));
        scheduler.set_run_log(RunLog::create(&log_path).unwrap());
        scheduler.run(&dag, &mut source).unwrap();

        let contents = std::fs::read_to_string(&log_path).unwrap();
        let events: Vec<String> = contents
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                value["event"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(
            events,
            vec![
                "run_started",
                "job_queued",
                "job_started",
                "job_finished",
                "run_finished",
            ]
        );
    }
}
