//! Job status taxonomy shared by the scheduler and the walker.
//!
//! The numeric codes are part of the external contract: child processes exit
//! with them, so a job written in any language can report `notready` or
//! `skip` by exiting with the matching code.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of a job execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "failure")]
    Failure,
    #[serde(rename = "missing")]
    Missing,
    /// The job could not run yet; the walker may requeue it.
    #[serde(rename = "notready")]
    NotReady,
    /// Preemptively excluded; counts as a successful predecessor.
    #[serde(rename = "force_skip")]
    ForceSkip,
    /// Failed because a predecessor failed; the job body never ran.
    #[serde(rename = "force_fail")]
    ForceFail,
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
    /// Skipped because fingerprints show the action is up to date.
    #[serde(rename = "skip")]
    Skip,
    /// Ran, but produced no observable change. Accepted but never emitted
    /// by the scheduler or the walker themselves.
    #[serde(rename = "unchanged")]
    Unchanged,
}

impl JobStatus {
    /// Process exit code associated with this status.
    pub const fn code(self) -> i32 {
        match self {
            JobStatus::Success => 0,
            JobStatus::Failure => 1,
            JobStatus::Missing => 2,
            JobStatus::NotReady => 75,
            JobStatus::ForceSkip => 122,
            JobStatus::ForceFail => 123,
            JobStatus::Unknown => 124,
            JobStatus::Skip => 125,
            JobStatus::Unchanged => 126,
        }
    }

    /// Map a raw child exit code back to a status.
    ///
    /// Codes outside the taxonomy all count as `failure`.
    pub const fn from_exit_code(code: i32) -> Self {
        match code {
            0 => JobStatus::Success,
            1 => JobStatus::Failure,
            2 => JobStatus::Missing,
            75 => JobStatus::NotReady,
            122 => JobStatus::ForceSkip,
            123 => JobStatus::ForceFail,
            124 => JobStatus::Unknown,
            125 => JobStatus::Skip,
            126 => JobStatus::Unchanged,
            _ => JobStatus::Failure,
        }
    }

    /// True when a vertex with this final status does not block its
    /// successors from running.
    pub const fn is_predecessor_ok(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Skip | JobStatus::ForceSkip | JobStatus::Unchanged
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            JobStatus::Success => "success",
            JobStatus::Failure => "failure",
            JobStatus::Missing => "missing",
            JobStatus::NotReady => "notready",
            JobStatus::ForceSkip => "force_skip",
            JobStatus::ForceFail => "force_fail",
            JobStatus::Unknown => "unknown",
            JobStatus::Skip => "skip",
            JobStatus::Unchanged => "unchanged",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}
