//! Document Configuration
//!
//! Tunables for the recompute scheduler, the undo log and the shared
//! worker driver. Configuration is plain data: it can be built in code or
//! parsed from JSON.

use serde::{Deserialize, Serialize};

use crate::error::{DocumentError, Result};

/// What happens to a computation's output when the computation is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputRemovalPolicy {
    /// The output survives as a plain data item.
    #[default]
    Orphan,

    /// The output is deleted along with its producer, unless something
    /// else still consumes it, in which case it is orphaned.
    Delete,
}

/// Configuration for a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentConfig {
    /// Maximum number of settle rounds before `RecomputeDivergence`.
    pub max_recompute_rounds: usize,

    /// Policy applied when a computation is removed.
    pub removal_policy: OutputRemovalPolicy,

    /// Maximum number of retained undo entries. `None` keeps everything.
    pub undo_limit: Option<usize>,

    /// Number of computations the shared driver executes concurrently.
    pub worker_tasks: usize,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            max_recompute_rounds: 32,
            removal_policy: OutputRemovalPolicy::Orphan,
            undo_limit: Some(100),
            worker_tasks: 4,
        }
    }
}

impl DocumentConfig {
    /// Parse and validate a configuration from JSON.
    ///
    /// Missing fields take their default values.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| DocumentError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every field is usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_recompute_rounds == 0 {
            return Err(DocumentError::Config(
                "max_recompute_rounds must be at least 1".into(),
            ));
        }
        if self.worker_tasks == 0 {
            return Err(DocumentError::Config("worker_tasks must be at least 1".into()));
        }
        Ok(())
    }

    /// Set the round bound.
    #[must_use]
    pub fn with_max_recompute_rounds(mut self, rounds: usize) -> Self {
        self.max_recompute_rounds = rounds;
        self
    }

    /// Set the removal policy.
    #[must_use]
    pub fn with_removal_policy(mut self, policy: OutputRemovalPolicy) -> Self {
        self.removal_policy = policy;
        self
    }

    /// Set the undo limit.
    #[must_use]
    pub fn with_undo_limit(mut self, limit: Option<usize>) -> Self {
        self.undo_limit = limit;
        self
    }

    #[must_use]
    pub fn with_worker_tasks(mut self, tasks: usize) -> Self {
        self.worker_tasks = tasks;
        self
    }
}
