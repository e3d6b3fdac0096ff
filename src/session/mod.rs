//! Session state
//!
//! A session is the configuration a dispatcher was started with plus the
//! counters and staging set that live as long as it does.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::config::{Mode, SessionConfig};
use crate::error::Warning;
use crate::parallel::{BackendStats, StreamSeed};

pub mod logs;
pub mod staging;

pub use staging::{AcceptAll, LibraryLoader, StagingSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Stopped,
    Started,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Stopped => f.write_str("stopped"),
            Status::Started => f.write_str("started"),
        }
    }
}

pub(crate) struct Session {
    /// Distinguishes this session from earlier and later ones of the same dispatcher.
    pub id: u64,
    pub config: SessionConfig,
    pub seed: Option<u64>,
    pub workers: usize,
    /// Number the next eligible dispatch will get, starting at 1.
    pub map_invocations: usize,
    /// Top-level calls run sequentially so far.
    pub sequential_invocations: usize,
    pub staging: StagingSet,
    /// Stats of the backend while a dispatch has it checked out.
    pub dispatching: Option<BackendStats>,
}

impl Session {
    pub fn new(id: u64, config: SessionConfig, seed: Option<u64>, workers: usize) -> Self {
        Self {
            id,
            config,
            seed,
            workers,
            map_invocations: 1,
            sequential_invocations: 0,
            staging: StagingSet::default(),
            dispatching: None,
        }
    }

    /// Seed and call number for the next top-level call that is not
    /// parallelized, `None` unless the session is reproducible.
    pub fn sequential_stream(&mut self) -> Option<(StreamSeed, usize)> {
        self.sequential_invocations += 1;
        let seed = self.seed?;
        Some((StreamSeed::new(seed).sequential(), self.sequential_invocations))
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            mode: self.config.mode(),
            workers: self.workers,
            level: self.config.level().map(str::to_string),
            logging: self.config.logging(),
            storage_dir: self.config.storage_dir().to_path_buf(),
            load_balancing: self.config.load_balancing(),
            seed: self.seed,
            map_invocations: self.map_invocations - 1,
        }
    }
}

/// Read-only summary of a running session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub mode: Mode,
    pub workers: usize,
    pub level: Option<String>,
    pub logging: bool,
    pub storage_dir: PathBuf,
    pub load_balancing: bool,
    pub seed: Option<u64>,
    /// Parallel dispatches made so far.
    pub map_invocations: usize,
}

/// What `start` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartReport {
    pub mode: Mode,
    pub workers: usize,
    /// Master seed of a reproducible session.
    pub seed: Option<u64>,
    pub warnings: Vec<Warning>,
}
