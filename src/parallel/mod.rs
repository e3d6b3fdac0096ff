//! Execution backends
//!
//! Every backend runs a [`Job`] (one mapping call) on its workers and returns
//! one [`TaskSlot`] per input, in input order. Backends only see type-erased
//! inputs and outputs; the dispatcher does the boxing and downcasting.
//!
//! | mode           | workers                         | environment                     |
//! |----------------|---------------------------------|---------------------------------|
//! | `local`        | the calling thread              | the master environment          |
//! | `multiprocess` | fresh threads per call          | copied from a base per call     |
//! | `socket`/`mpi` | persistent nodes                | pushed once, kept between calls |
//! | `batchqueue`   | jobs in a registry on a pool    | registry environment            |

use std::any::Any;
use std::path::PathBuf;

use crate::config::{Mode, ModeConfig, SessionConfig};
use crate::error::{Result, TaskError};

pub mod batch;
pub mod cluster;
pub mod context;
pub mod local;
pub mod multiprocess;
pub mod processor;
pub mod rng;

pub use context::{Environment, SharedValue, StagedResources, TaskContext};
pub use processor::{ParallelProcessor, Schedule};
pub use rng::StreamSeed;

/// Type-erased input or output of a task.
pub type AnyValue = Box<dyn Any + Send>;

/// Type-erased mapped function.
pub type TaskFn<'f> = dyn Fn(&mut TaskContext<'_>, AnyValue) -> anyhow::Result<AnyValue> + Send + Sync + 'f;

/// Outcome of one task.
pub type TaskSlot = std::result::Result<AnyValue, TaskError>;

/// One mapping call handed to a backend.
pub struct Job<'a> {
    /// Dispatch number within the session, starting at 1.
    pub call: usize,
    pub inputs: Vec<AnyValue>,
    pub task: &'a TaskFn<'a>,
    /// Master environment, used by backends that run in the caller's process.
    pub master: Option<&'a Environment>,
    /// Directory receiving `<iteration>.log` files when logging is enabled.
    pub log_dir: Option<PathBuf>,
}

/// Counters a backend keeps about the work it was given.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub dispatches: usize,
    pub tasks: usize,
    pub exports_pushed: usize,
    pub libraries_loaded: usize,
    pub sources_loaded: usize,
    pub destroyed: bool,
}

impl BackendStats {
    pub(crate) fn record_push(&mut self, staged: &StagedResources) {
        self.exports_pushed += staged.exports.len();
        self.libraries_loaded += staged.libraries.len();
        self.sources_loaded += staged.sources.len();
    }

    pub(crate) fn record_dispatch(&mut self, tasks: usize) {
        self.dispatches += 1;
        self.tasks += tasks;
    }
}

/// A started execution backend.
pub trait Backend: Send {
    fn mode(&self) -> Mode;

    /// Number of workers tasks are spread over.
    fn workers(&self) -> usize;

    /// Install staged resources on every worker.
    fn push(&mut self, staged: &StagedResources) -> Result<()>;

    /// Run one mapping call. Task failures come back in their slots unless
    /// the backend stops the whole call, in which case it returns the error.
    fn execute(&mut self, job: Job<'_>) -> Result<Vec<TaskSlot>>;

    /// Release workers and on-disk state. Calling it twice is a no-op.
    fn destroy(&mut self) -> Result<()>;

    fn stats(&self) -> BackendStats;
}

/// Create the backend for a validated session configuration.
pub fn create(config: &SessionConfig, seed: Option<StreamSeed>) -> Result<Box<dyn Backend>> {
    let backend: Box<dyn Backend> = match config.mode_config() {
        ModeConfig::Local { suppress_errors } => {
            Box::new(local::LocalBackend::new(*suppress_errors, seed))
        }
        ModeConfig::MultiProcess {
            workers,
            load_balancing,
        } => Box::new(multiprocess::MultiProcessBackend::new(
            workers.unwrap_or_else(num_cpus::get),
            Schedule::from_load_balancing(*load_balancing),
            seed,
        )),
        ModeConfig::Socket {
            workers,
            load_balancing,
        } => Box::new(cluster::ClusterBackend::socket(
            workers,
            Schedule::from_load_balancing(*load_balancing),
            seed,
        )?),
        ModeConfig::Mpi {
            workers,
            load_balancing,
        } => Box::new(cluster::ClusterBackend::mpi(
            *workers,
            Schedule::from_load_balancing(*load_balancing),
            seed,
        )?),
        ModeConfig::BatchQueue {
            max_concurrent,
            resources,
        } => Box::new(batch::BatchBackend::new(
            config.storage_dir(),
            max_concurrent.unwrap_or_else(num_cpus::get),
            resources.clone(),
            seed,
        )?),
    };

    tracing::debug!(
        "Created {} backend with {} worker(s)",
        backend.mode(),
        backend.workers()
    );
    Ok(backend)
}
