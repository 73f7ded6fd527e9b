//! Scheduler configuration loaded from `jobdag.toml`.
//!
//! ```toml
//! tokens = 4
//! job_timeout_secs = 3600   # 0 disables per-job timeouts
//!
//! [queues]
//! build = 4
//! upload = 1
//! ```
//!
//! Without a `[queues]` table a single `default` queue of `tokens` capacity
//! is used.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::scheduler::{DEFAULT_JOB_MAX_DURATION, Scheduler};
use crate::walk::SchedulingParams;

const CONFIG_FILENAME: &str = "jobdag.toml";

fn default_tokens() -> usize {
    1
}

fn default_job_timeout_secs() -> u64 {
    DEFAULT_JOB_MAX_DURATION.as_secs()
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Capacity of the `default` queue when no `[queues]` table is given.
    #[serde(default = "default_tokens")]
    pub tokens: usize,
    /// Per-job timeout in seconds; 0 disables timeouts.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    /// Named queues with their token capacities.
    #[serde(default)]
    pub queues: BTreeMap<String, usize>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tokens: default_tokens(),
            job_timeout_secs: default_job_timeout_secs(),
            queues: BTreeMap::new(),
        }
    }
}

impl SchedulerSettings {
    /// Parse the settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Search upward from `start` for a `jobdag.toml` file.
    pub fn discover(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    /// Effective queue layout.
    pub fn queues(&self) -> BTreeMap<String, usize> {
        if self.queues.is_empty() {
            BTreeMap::from([("default".to_string(), self.tokens)])
        } else {
            self.queues.clone()
        }
    }

    /// Effective per-job timeout; `None` when disabled.
    pub fn job_timeout(&self) -> Option<Duration> {
        match self.job_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Build a scheduler from these settings.
    pub fn scheduler<D>(&self) -> Scheduler<D> {
        Scheduler::with_queues(self.queues(), self.job_timeout())
    }

    /// Walker scheduling parameters from these settings.
    pub fn scheduling_params(&self) -> SchedulingParams {
        SchedulingParams {
            queues: self.queues(),
            job_timeout: self.job_timeout(),
        }
    }
}
