//! Configuration management for parmap
//!
//! Two shapes of configuration live here:
//!
//! - [`ParallelOptions`]: the flat option record read from the layered option
//!   store (built-in defaults, config files, `PARMAP_*` environment, explicit
//!   arguments). Every field is optional and contradictions are possible.
//! - [`SessionConfig`]: the validated, per-mode configuration a session is
//!   started with. Mode specific settings live in [`ModeConfig`] so that each
//!   backend only sees the fields it accepts.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub mod core;
pub mod overrides;
pub mod smart_load;

pub use self::core::OptionStore;

/// Backend family of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Sequential, in the calling thread.
    Local,
    /// Workers forked per call from the backend's base environment.
    #[value(name = "multiprocess")]
    MultiProcess,
    /// Persistent worker pool across local processes or hosts.
    Socket,
    /// Persistent worker pool launched through MPI.
    Mpi,
    /// Jobs registered in a registry directory and submitted to a queue.
    #[value(name = "batchqueue")]
    BatchQueue,
}

impl Mode {
    pub const ALL: [Mode; 5] = [
        Mode::Local,
        Mode::MultiProcess,
        Mode::Socket,
        Mode::Mpi,
        Mode::BatchQueue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Local => "local",
            Mode::MultiProcess => "multiprocess",
            Mode::Socket => "socket",
            Mode::Mpi => "mpi",
            Mode::BatchQueue => "batchqueue",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Mode::ALL
            .into_iter()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::config(format!("unknown mode '{}'", s)))
    }
}

/// How a socket cluster is sized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketWorkers {
    /// This many workers on the local machine.
    Count(usize),
    /// One worker per entry, in order.
    Hosts(Vec<String>),
}

/// Mode specific settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeConfig {
    Local {
        suppress_errors: bool,
    },
    MultiProcess {
        /// Auto-detected from the CPU count when unset.
        workers: Option<usize>,
        load_balancing: bool,
    },
    Socket {
        workers: SocketWorkers,
        load_balancing: bool,
    },
    Mpi {
        /// Universe size minus one when unset.
        workers: Option<usize>,
        load_balancing: bool,
    },
    BatchQueue {
        /// Maximum number of jobs running at once, CPU count when unset.
        max_concurrent: Option<usize>,
        resources: BTreeMap<String, String>,
    },
}

impl ModeConfig {
    pub fn mode(&self) -> Mode {
        match self {
            ModeConfig::Local { .. } => Mode::Local,
            ModeConfig::MultiProcess { .. } => Mode::MultiProcess,
            ModeConfig::Socket { .. } => Mode::Socket,
            ModeConfig::Mpi { .. } => Mode::Mpi,
            ModeConfig::BatchQueue { .. } => Mode::BatchQueue,
        }
    }
}

/// Validated configuration a session is started with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    mode: ModeConfig,
    level: Option<String>,
    logging: bool,
    storage_dir: PathBuf,
    reproducible: bool,
    seed: Option<u64>,
    show_info: bool,
}

impl SessionConfig {
    pub fn new(mode: ModeConfig) -> Self {
        Self {
            mode,
            level: None,
            logging: false,
            storage_dir: PathBuf::from("."),
            reproducible: false,
            seed: None,
            show_info: true,
        }
    }

    pub fn local() -> Self {
        Self::new(ModeConfig::Local {
            suppress_errors: false,
        })
    }

    pub fn multiprocess(workers: Option<usize>) -> Self {
        Self::new(ModeConfig::MultiProcess {
            workers,
            load_balancing: false,
        })
    }

    pub fn socket(workers: usize) -> Self {
        Self::new(ModeConfig::Socket {
            workers: SocketWorkers::Count(workers),
            load_balancing: false,
        })
    }

    pub fn socket_hosts<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(ModeConfig::Socket {
            workers: SocketWorkers::Hosts(hosts.into_iter().map(Into::into).collect()),
            load_balancing: false,
        })
    }

    pub fn mpi(workers: Option<usize>) -> Self {
        Self::new(ModeConfig::Mpi {
            workers,
            load_balancing: false,
        })
    }

    pub fn batch_queue(storage_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::new(ModeConfig::BatchQueue {
            max_concurrent: None,
            resources: BTreeMap::new(),
        });
        config.storage_dir = storage_dir.into();
        config
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = Some(level.into());
        self
    }

    pub fn with_logging(mut self, logging: bool) -> Self {
        self.logging = logging;
        self
    }

    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = dir.into();
        self
    }

    /// Enable reproducible streams. A seed is drawn at start when `seed` is `None`.
    pub fn reproducible(mut self, seed: Option<u64>) -> Self {
        self.reproducible = true;
        self.seed = seed;
        self
    }

    pub fn with_show_info(mut self, show_info: bool) -> Self {
        self.show_info = show_info;
        self
    }

    /// Ignored by modes without a scheduling choice.
    pub fn with_load_balancing(mut self, enabled: bool) -> Self {
        match &mut self.mode {
            ModeConfig::MultiProcess { load_balancing, .. }
            | ModeConfig::Socket { load_balancing, .. }
            | ModeConfig::Mpi { load_balancing, .. } => *load_balancing = enabled,
            ModeConfig::Local { .. } | ModeConfig::BatchQueue { .. } => {}
        }
        self
    }

    /// Local mode only.
    pub fn with_suppressed_errors(mut self, enabled: bool) -> Self {
        if let ModeConfig::Local { suppress_errors } = &mut self.mode {
            *suppress_errors = enabled;
        }
        self
    }

    /// Batch queue only.
    pub fn with_max_concurrent_jobs(mut self, jobs: usize) -> Self {
        if let ModeConfig::BatchQueue { max_concurrent, .. } = &mut self.mode {
            *max_concurrent = Some(jobs);
        }
        self
    }

    /// Batch queue only.
    pub fn with_resource(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let ModeConfig::BatchQueue { resources, .. } = &mut self.mode {
            resources.insert(key.into(), value.into());
        }
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode.mode()
    }

    pub fn mode_config(&self) -> &ModeConfig {
        &self.mode
    }

    pub fn level(&self) -> Option<&str> {
        self.level.as_deref()
    }

    pub fn logging(&self) -> bool {
        self.logging
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn is_reproducible(&self) -> bool {
        self.reproducible
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn show_info(&self) -> bool {
        self.show_info
    }

    pub fn load_balancing(&self) -> bool {
        match &self.mode {
            ModeConfig::MultiProcess { load_balancing, .. }
            | ModeConfig::Socket { load_balancing, .. }
            | ModeConfig::Mpi { load_balancing, .. } => *load_balancing,
            ModeConfig::Local { .. } | ModeConfig::BatchQueue { .. } => false,
        }
    }

    pub fn suppress_local_errors(&self) -> bool {
        matches!(
            self.mode,
            ModeConfig::Local {
                suppress_errors: true
            }
        )
    }

    /// Check the cross-field invariants the type cannot express.
    pub fn validate(&self) -> Result<()> {
        if let Some(level) = &self.level {
            if level.trim().is_empty() {
                return Err(Error::config("level must not be empty"));
            }
        }

        match &self.mode {
            ModeConfig::Local { .. } => {
                if self.logging {
                    return Err(Error::config("logging is not supported in local mode"));
                }
            }
            ModeConfig::MultiProcess { workers, .. } | ModeConfig::Mpi { workers, .. } => {
                check_positive(*workers, "cpus")?;
            }
            ModeConfig::Socket { workers, .. } => match workers {
                SocketWorkers::Count(count) => check_positive(Some(*count), "cpus")?,
                SocketWorkers::Hosts(hosts) => {
                    if hosts.is_empty() {
                        return Err(Error::config("socket hosts must not be empty"));
                    }
                    if hosts.iter().any(|h| h.trim().is_empty()) {
                        return Err(Error::config("socket host names must not be empty"));
                    }
                }
            },
            ModeConfig::BatchQueue { max_concurrent, .. } => {
                check_positive(*max_concurrent, "cpus")?;
            }
        }

        Ok(())
    }
}

fn check_positive(value: Option<usize>, name: &str) -> Result<()> {
    match value {
        Some(0) => Err(Error::config(format!("{} must be a positive integer", name))),
        _ => Ok(()),
    }
}

/// Flat option record as stored in config files, environment and CLI flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelOptions {
    pub mode: Option<Mode>,
    /// Worker count; maximum concurrent jobs in batch queue mode.
    pub cpus: Option<usize>,
    pub socket_hosts: Option<Vec<String>>,
    pub level: Option<String>,
    pub logging: Option<bool>,
    pub storage_dir: Option<PathBuf>,
    pub load_balancing: Option<bool>,
    pub show_info: Option<bool>,
    pub suppress_local_errors: Option<bool>,
    pub reproducible: Option<bool>,
    pub seed: Option<u64>,
    pub batch_resources: Option<BTreeMap<String, String>>,
}

impl ParallelOptions {
    /// Turn resolved options into a session configuration, rejecting contradictions.
    pub fn into_session_config(self) -> Result<SessionConfig> {
        let mode = self.mode.unwrap_or(Mode::Local);
        let load_balancing = self.load_balancing.unwrap_or(false);

        if self.socket_hosts.is_some() && mode != Mode::Socket {
            return Err(Error::config(format!(
                "socket_hosts can only be used in socket mode, not '{}'",
                mode
            )));
        }
        if self.suppress_local_errors == Some(true) && mode != Mode::Local {
            return Err(Error::config(format!(
                "suppress_local_errors can only be used in local mode, not '{}'",
                mode
            )));
        }
        if self.batch_resources.as_ref().is_some_and(|r| !r.is_empty()) && mode != Mode::BatchQueue {
            return Err(Error::config(format!(
                "batch_resources can only be used in batchqueue mode, not '{}'",
                mode
            )));
        }

        let mode_config = match mode {
            Mode::Local => {
                if self.cpus.is_some() {
                    return Err(Error::config("cpus must not be set in local mode"));
                }
                ModeConfig::Local {
                    suppress_errors: self.suppress_local_errors.unwrap_or(false),
                }
            }
            Mode::MultiProcess => ModeConfig::MultiProcess {
                workers: self.cpus,
                load_balancing,
            },
            Mode::Socket => {
                let workers = match (self.cpus, self.socket_hosts) {
                    (Some(_), Some(_)) => {
                        return Err(Error::config(
                            "cpus and socket_hosts are mutually exclusive in socket mode",
                        ));
                    }
                    (None, Some(hosts)) => SocketWorkers::Hosts(hosts),
                    (Some(cpus), None) => SocketWorkers::Count(cpus),
                    (None, None) => SocketWorkers::Count(1),
                };
                ModeConfig::Socket {
                    workers,
                    load_balancing,
                }
            }
            Mode::Mpi => ModeConfig::Mpi {
                workers: self.cpus,
                load_balancing,
            },
            Mode::BatchQueue => ModeConfig::BatchQueue {
                max_concurrent: self.cpus,
                resources: self.batch_resources.unwrap_or_default(),
            },
        };

        let config = SessionConfig {
            mode: mode_config,
            level: self.level,
            logging: self.logging.unwrap_or(false),
            storage_dir: self.storage_dir.unwrap_or_else(|| PathBuf::from(".")),
            reproducible: self.reproducible.unwrap_or(false),
            seed: self.seed,
            show_info: self.show_info.unwrap_or(true),
        };
        config.validate()?;
        Ok(config)
    }
}
