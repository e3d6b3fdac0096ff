//! # parmap
//!
//! One entry point for mapping a function over inputs, with the choice of
//! whether and where it runs in parallel left to whoever starts the session.
//!
//! ```no_run
//! use parmap::{Dispatcher, SessionConfig};
//!
//! let dispatcher = Dispatcher::new();
//! dispatcher.start(SessionConfig::multiprocess(Some(2)))?;
//! dispatcher.stage_export("offset", 5_i64);
//!
//! let out = dispatcher.map(
//!     |ctx, x: i64| Ok(x + ctx.require::<i64>("offset")?),
//!     vec![1, 2],
//!     None,
//! )?;
//! assert_eq!(out, vec![6, 7]);
//!
//! dispatcher.stop();
//! # Ok::<(), parmap::Error>(())
//! ```
//!
//! ## Backends
//!
//! - `local`: sequential, in the calling thread
//! - `multiprocess`: worker threads forked per call
//! - `socket` and `mpi`: persistent worker clusters
//! - `batchqueue`: jobs recorded in a registry directory and run on a bounded pool
//!
//! Libraries tag their calls with a [level](levels) so applications can pick
//! which of several nested call sites gets the workers.

use lazy_static::lazy_static;

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod levels;
pub mod parallel;
pub mod session;

pub use config::{Mode, ModeConfig, OptionStore, ParallelOptions, SessionConfig, SocketWorkers};
pub use dispatcher::Dispatcher;
pub use error::{Error, Result, StagedKind, TaskError, Warning};
pub use levels::{Level, LevelRegistry, RegisteredLevels};
pub use parallel::{BackendStats, TaskContext};
pub use session::{LibraryLoader, SessionInfo, StartReport, Status};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

lazy_static! {
    static ref GLOBAL_DISPATCHER: Dispatcher = Dispatcher::new();
}

/// Process-wide dispatcher, checking levels against the global registry.
pub fn global() -> &'static Dispatcher {
    &GLOBAL_DISPATCHER
}

/// Register levels in the process-wide registry.
pub fn register_levels<I, S>(owner: &str, levels: I)
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    LevelRegistry::global().register(owner, levels);
}
