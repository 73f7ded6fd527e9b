//! Parallel execution of interdependent jobs.
//!
//! `jobdag` schedules a directed acyclic graph of opaque actions across
//! named, token-budgeted queues, with per-job timeouts, requeue support, and
//! fingerprint-based skipping of unchanged work:
//!
//! - [`dag`] stores the graph and iterates it in topological order, with a
//!   busy state so parallel workers can claim, execute, and release vertices;
//! - [`job`] models a unit of work (empty, external process, or closure)
//!   running on its own worker thread;
//! - [`scheduler`] dispatches ready jobs across queues, honoring priorities,
//!   token budgets, timeouts, and cancellation;
//! - [`walk`] adds fingerprint memoization on top: unchanged actions are
//!   skipped, failed predecessors transitively force-fail their descendants;
//! - [`status`] is the shared status taxonomy, with its fixed process exit
//!   codes;
//! - [`fingerprint`], [`config`], and [`log`] provide the content-addressed
//!   store, TOML settings, and the structured JSONL run log.

pub mod config;
pub mod dag;
pub mod fingerprint;
pub mod job;
pub mod log;
pub mod scheduler;
pub mod status;
pub mod walk;

pub use config::SchedulerSettings;
pub use dag::{Dag, DagError, DagIterator, NextVertex, VisitState};
pub use fingerprint::{Fingerprint, FingerprintStore};
pub use job::{Job, JobCommand, JobSignals, TimingInfo};
pub use log::{LogEvent, RunLog};
pub use scheduler::{
    DEFAULT_JOB_MAX_DURATION, FnJobSource, JobSource, RunReport, Scheduler, SchedulerError,
};
pub use status::JobStatus;
pub use walk::{SchedulingParams, WalkHooks, Walker};
