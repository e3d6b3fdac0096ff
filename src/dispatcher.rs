//! The dispatcher owns the current session and decides, call by call,
//! whether a mapping runs on the session's backend or sequentially in the
//! calling thread.
//!
//! A call is parallelized only when all of these hold:
//!
//! 1. a session is started,
//! 2. the call is not nested inside another mapping call,
//! 3. the session has no active level, or the call is tagged with it.
//!
//! Everything else runs sequentially, in input order, with the nesting
//! depth raised so that calls made from inside the mapped function never
//! reach the backend either.
//!
//! The backend is checked out of its slot while a call runs on it, so a
//! mapped function may query, stop or restart the dispatcher. A backend
//! whose session ended meanwhile is shut down once the call returns.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::config::{Mode, SessionConfig};
use crate::error::{Error, Result, StagedKind, TaskError, Warning};
use crate::levels::LevelRegistry;
use crate::parallel::processor::process_sequential;
use crate::parallel::{
    self, AnyValue, Backend, BackendStats, Environment, Job, SharedValue, StreamSeed, TaskContext, TaskFn,
    TaskSlot, rng,
};
use crate::session::logs;
use crate::session::{AcceptAll, LibraryLoader, Session, SessionInfo, StagingSet, StartReport, Status};

/// Log at info level when the session shows info messages, debug otherwise.
macro_rules! show {
    ($show:expr, $($arg:tt)*) => {
        if $show {
            tracing::info!($($arg)*);
        } else {
            tracing::debug!($($arg)*);
        }
    };
}

pub struct Dispatcher {
    registry: Arc<LevelRegistry>,
    loader: RwLock<Arc<dyn LibraryLoader>>,
    started: AtomicBool,
    depth: AtomicUsize,
    sessions: AtomicU64,
    // Lock order: backend, then session.
    backend: Mutex<Option<Box<dyn Backend>>>,
    session: Mutex<Option<Session>>,
    master: RwLock<Environment>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Dispatcher checking levels against the process-wide registry.
    pub fn new() -> Self {
        Self::with_registry(LevelRegistry::global())
    }

    pub fn with_registry(registry: Arc<LevelRegistry>) -> Self {
        Self {
            registry,
            loader: RwLock::new(Arc::new(AcceptAll)),
            started: AtomicBool::new(false),
            depth: AtomicUsize::new(0),
            sessions: AtomicU64::new(0),
            backend: Mutex::new(None),
            session: Mutex::new(None),
            master: RwLock::new(Environment::default()),
        }
    }

    /// Replace the loader used by [`stage_library`](Self::stage_library) and
    /// when staged libraries are flushed.
    pub fn set_library_loader(&self, loader: impl LibraryLoader + 'static) {
        *self.loader.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(loader);
    }

    pub fn registry(&self) -> &Arc<LevelRegistry> {
        &self.registry
    }

    pub fn status(&self) -> Status {
        if self.started.load(Ordering::SeqCst) {
            Status::Started
        } else {
            Status::Stopped
        }
    }

    /// Number of mapping calls currently on the stack of a started session.
    pub fn nesting_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn mode(&self) -> Option<Mode> {
        lock(&self.session).as_ref().map(|s| s.config.mode())
    }

    pub fn info(&self) -> Option<SessionInfo> {
        lock(&self.session).as_ref().map(Session::info)
    }

    pub fn backend_stats(&self) -> Option<BackendStats> {
        let backend = lock(&self.backend);
        if let Some(backend) = backend.as_ref() {
            return Some(backend.stats());
        }
        lock(&self.session).as_ref().and_then(|s| s.dispatching.clone())
    }

    /// Names of exports waiting for the next parallel dispatch.
    pub fn pending_exports(&self) -> Vec<String> {
        lock(&self.session)
            .as_ref()
            .map(|s| s.staging.export_names().into_iter().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Start a session, stopping the running one first.
    ///
    /// A configuration error leaves the current session untouched.
    pub fn start(&self, config: SessionConfig) -> Result<StartReport> {
        config.validate()?;
        logs::check_storage_dir(config.storage_dir())?;

        let mut warnings = Vec::new();
        if let Some(level) = config.level() {
            if !self.registry.contains(level) {
                let warning = Warning::UnregisteredLevel {
                    level: level.to_string(),
                };
                tracing::warn!("{}", warning);
                warnings.push(warning);
            }
        }

        let mut backend_slot = lock(&self.backend);
        let mut session_slot = lock(&self.session);

        if let Some(previous) = session_slot.take() {
            let previous_mode = previous.config.mode();
            if previous_mode != Mode::Local {
                let warning = Warning::AutoStopped {
                    previous: previous_mode,
                };
                tracing::warn!("{}", warning);
                warnings.push(warning);
            }
            self.started.store(false, Ordering::SeqCst);
            shutdown(backend_slot.take(), previous_mode);
        }

        let seed = config
            .is_reproducible()
            .then(|| config.seed().unwrap_or_else(rng::draw_master_seed));
        let mut backend = parallel::create(&config, seed.map(StreamSeed::new))?;

        // Exports, libraries and sources staged before this session started
        let inherited = self.master_snapshot().to_staged();
        if config.mode() != Mode::Local && !inherited.is_empty() {
            if let Err(e) = push_staged(&mut *backend, &inherited) {
                shutdown(Some(backend), config.mode());
                return Err(e);
            }
        }

        if config.logging() {
            if let Err(e) = logs::clear_log_dirs(config.storage_dir()) {
                shutdown(Some(backend), config.mode());
                return Err(Error::resource(format!(
                    "failed to clear old log directories in {}: {}",
                    config.storage_dir().display(),
                    e
                )));
            }
        }

        let workers = backend.workers();
        let mode = config.mode();
        show!(
            config.show_info(),
            "Starting parallelization in mode={} with cpus={}.",
            mode,
            workers
        );
        if let Some(seed) = seed {
            show!(config.show_info(), "Reproducible streams with master seed {}.", seed);
        }

        *backend_slot = Some(backend);
        let id = self.sessions.fetch_add(1, Ordering::SeqCst);
        *session_slot = Some(Session::new(id, config, seed, workers));
        self.depth.store(0, Ordering::SeqCst);
        self.started.store(true, Ordering::SeqCst);

        Ok(StartReport {
            mode,
            workers,
            seed,
            warnings,
        })
    }

    /// Stop the running session. A no-op when nothing is running.
    pub fn stop(&self) {
        let mut backend_slot = lock(&self.backend);
        let mut session_slot = lock(&self.session);

        let Some(session) = session_slot.take() else {
            return;
        };
        self.started.store(false, Ordering::SeqCst);
        shutdown(backend_slot.take(), session.config.mode());

        show!(
            session.config.show_info(),
            "Stopped parallelization. All cleaned up."
        );
    }

    /// Make `value` available as `name` to every mapped function.
    ///
    /// The value is bound on the master immediately; in a parallel session it
    /// is also pushed to the workers before the next parallel dispatch.
    pub fn stage_export<V>(&self, name: impl Into<String>, value: V)
    where
        V: Any + Send + Sync,
    {
        let name = name.into();
        let value: SharedValue = Arc::new(value);
        self.master
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .bind(name.clone(), value.clone());

        self.with_parallel_staging(|staging| {
            tracing::debug!("Staged export '{}'", name);
            staging.export(name, value);
        });
    }

    /// Load a library on the master and stage it for the workers.
    pub fn stage_library(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.current_loader().load(&name).map_err(|e| Error::Staging {
            kind: StagedKind::Library,
            name: name.clone(),
            message: format!("{:#}", e),
        })?;
        self.master
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .load_library(name.clone());

        self.with_parallel_staging(|staging| {
            tracing::debug!("Staged library '{}'", name);
            staging.library(name);
        });
        Ok(())
    }

    /// Read a source file on the master and stage it for the workers.
    ///
    /// Workers get the content as it is when the file is flushed.
    pub fn stage_source(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&path).map_err(|e| Error::Staging {
            kind: StagedKind::Source,
            name: path.display().to_string(),
            message: e.to_string(),
        })?;
        self.master
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .add_source(path.clone(), Arc::from(content));

        self.with_parallel_staging(|staging| {
            tracing::debug!("Staged source {}", path.display());
            staging.source(path);
        });
        Ok(())
    }

    /// Map `f` over `inputs`, returning outputs in input order.
    ///
    /// `level` tags the call; see the module documentation for when the call
    /// is parallelized. The first failing task fails the whole call.
    pub fn map<T, R, F, I>(&self, f: F, inputs: I, level: Option<&str>) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(&mut TaskContext<'_>, T) -> anyhow::Result<R> + Send + Sync,
        I: IntoIterator<Item = T>,
    {
        self.map_results(f, inputs, level)?
            .into_iter()
            .map(|slot| slot.map_err(Error::Task))
            .collect()
    }

    /// Like [`map`](Self::map), but keeps per-task failures in their slots.
    ///
    /// Slots only hold errors in a local session started with suppressed
    /// errors; every other failure still fails the whole call.
    pub fn map_results<T, R, F, I>(
        &self,
        f: F,
        inputs: I,
        level: Option<&str>,
    ) -> Result<Vec<std::result::Result<R, TaskError>>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(&mut TaskContext<'_>, T) -> anyhow::Result<R> + Send + Sync,
        I: IntoIterator<Item = T>,
    {
        let erased = |ctx: &mut TaskContext<'_>, input: AnyValue| -> anyhow::Result<AnyValue> {
            let input = input
                .downcast::<T>()
                .map_err(|_| anyhow::anyhow!("task input has an unexpected type"))?;
            Ok(Box::new(f(ctx, *input)?))
        };
        let inputs: Vec<AnyValue> = inputs.into_iter().map(|x| Box::new(x) as AnyValue).collect();

        self.dispatch(&erased, inputs, level)?
            .into_iter()
            .map(|slot| match slot {
                Ok(value) => value
                    .downcast::<R>()
                    .map(|value| Ok(*value))
                    .map_err(|_| Error::resource("task output has an unexpected type")),
                Err(error) => Ok(Err(error)),
            })
            .collect()
    }

    /// Map `f` over two equally long input sequences element by element.
    pub fn map2<A, B, R, F>(&self, f: F, first: Vec<A>, second: Vec<B>, level: Option<&str>) -> Result<Vec<R>>
    where
        A: Send + 'static,
        B: Send + 'static,
        R: Send + 'static,
        F: Fn(&mut TaskContext<'_>, A, B) -> anyhow::Result<R> + Send + Sync,
    {
        if first.len() != second.len() {
            return Err(Error::config(format!(
                "map2 inputs differ in length: {} and {}",
                first.len(),
                second.len()
            )));
        }
        self.map(
            |ctx: &mut TaskContext<'_>, (a, b): (A, B)| f(ctx, a, b),
            first.into_iter().zip(second),
            level,
        )
    }

    fn dispatch(&self, task: &TaskFn<'_>, inputs: Vec<AnyValue>, level: Option<&str>) -> Result<Vec<TaskSlot>> {
        if !self.started.load(Ordering::SeqCst) {
            return self.run_sequential(task, inputs, rng::next_nested_call());
        }

        let nesting = NestingGuard::enter(&self.depth);
        if nesting.depth() != 1 {
            return self.run_sequential(task, inputs, rng::next_nested_call());
        }

        let mut backend_slot = lock(&self.backend);
        let mut session_slot = lock(&self.session);
        // A session stopped since the check above runs sequentially too
        let sequential = match session_slot.as_mut() {
            Some(session)
                if backend_slot.is_some() && is_eligible(nesting.depth(), session.config.level(), level) =>
            {
                None
            }
            Some(session) => Some(rng::next_nested_call().or_else(|| session.sequential_stream())),
            None => Some(rng::next_nested_call()),
        };
        if let Some(seeding) = sequential {
            drop(session_slot);
            drop(backend_slot);
            return self.run_sequential(task, inputs, seeding);
        }
        let (Some(backend), Some(session)) = (backend_slot.as_mut(), session_slot.as_mut()) else {
            return Err(Error::resource("parallelization was stopped during dispatch"));
        };

        let pending = session.staging.take();
        if !pending.is_empty() {
            let loader = self.current_loader();
            let flushed = pending
                .prepare(loader.as_ref())
                .and_then(|staged| push_staged(&mut **backend, &staged));
            if let Err(e) = flushed {
                session.staging.restore(pending);
                return Err(e);
            }
        }

        let call = session.map_invocations;
        let log_dir: Option<PathBuf> = if session.config.logging() {
            Some(logs::create_call_log_dir(session.config.storage_dir(), call)?)
        } else {
            None
        };
        session.map_invocations += 1;
        let show_info = session.config.show_info();

        show!(
            show_info,
            "Mapping in parallel: mode = {}; level = {}; cpus = {}; elements = {}.",
            session.config.mode(),
            level.unwrap_or("none"),
            session.workers,
            inputs.len()
        );

        let Some(mut backend) = backend_slot.take() else {
            return Err(Error::resource("parallelization was stopped during dispatch"));
        };
        session.dispatching = Some(backend.stats());
        let session_id = session.id;
        drop(session_slot);
        drop(backend_slot);

        let master = self.master_snapshot();
        let result = backend.execute(Job {
            call,
            inputs,
            task,
            master: Some(&master),
            log_dir: log_dir.clone(),
        });
        self.check_in(backend, session_id);

        if let Some(dir) = log_dir {
            show!(show_info, "Log files in {}.", dir.display());
        }
        result
    }

    /// Put a backend checked out by `dispatch` back, or shut it down when its
    /// session was stopped or replaced while the call ran.
    fn check_in(&self, backend: Box<dyn Backend>, session_id: u64) {
        let mut backend_slot = lock(&self.backend);
        let mut session_slot = lock(&self.session);
        match session_slot.as_mut() {
            Some(session) if session.id == session_id && backend_slot.is_none() => {
                session.dispatching = None;
                *backend_slot = Some(backend);
            }
            _ => {
                drop(session_slot);
                drop(backend_slot);
                let mode = backend.mode();
                tracing::debug!("Session ended during the call; shutting down its {} backend", mode);
                shutdown(Some(backend), mode);
            }
        }
    }

    /// Run in the calling thread, drawing from `seeding` (stream seed and call
    /// number) when the call is part of a reproducible session.
    fn run_sequential(
        &self,
        task: &TaskFn<'_>,
        inputs: Vec<AnyValue>,
        seeding: Option<(StreamSeed, usize)>,
    ) -> Result<Vec<TaskSlot>> {
        let env = self.master_snapshot();
        let (seed, call) = match seeding {
            Some((seed, call)) => (Some(seed), call),
            None => (None, 0),
        };
        process_sequential(
            &env,
            Job {
                call,
                inputs,
                task,
                master: None,
                log_dir: None,
            },
            seed,
            false,
        )
    }

    fn master_snapshot(&self) -> Environment {
        self.master.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn current_loader(&self) -> Arc<dyn LibraryLoader> {
        self.loader.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Run `stage` on the pending set of a running non-local session.
    fn with_parallel_staging(&self, stage: impl FnOnce(&mut StagingSet)) {
        let mut session = lock(&self.session);
        if let Some(session) = session.as_mut().filter(|s| s.config.mode() != Mode::Local) {
            stage(&mut session.staging);
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Whether a call at `depth` tagged `level` runs on the backend.
fn is_eligible(depth: usize, active: Option<&str>, level: Option<&str>) -> bool {
    depth == 1 && active.is_none_or(|active| level == Some(active))
}

fn push_staged(backend: &mut dyn Backend, staged: &parallel::StagedResources) -> Result<()> {
    backend.push(staged).map_err(|e| Error::Staging {
        kind: StagedKind::Export,
        name: staged.export_names().collect::<Vec<_>>().join(", "),
        message: e.to_string(),
    })?;
    tracing::debug!(
        "Pushed {} export(s), {} librar(ies), {} source(s) to {} backend",
        staged.exports.len(),
        staged.libraries.len(),
        staged.sources.len(),
        backend.mode()
    );
    Ok(())
}

fn shutdown(backend: Option<Box<dyn Backend>>, mode: Mode) {
    if let Some(mut backend) = backend {
        if let Err(e) = backend.destroy() {
            tracing::error!("Failed to shut down {} backend: {}", mode, e);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Raises the nesting depth for the lifetime of a mapping call.
struct NestingGuard<'a> {
    counter: &'a AtomicUsize,
    depth: usize,
}

impl<'a> NestingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        let depth = counter.fetch_add(1, Ordering::SeqCst) + 1;
        Self { counter, depth }
    }

    fn depth(&self) -> usize {
        self.depth
    }
}

impl Drop for NestingGuard<'_> {
    fn drop(&mut self) {
        // A restart resets the counter while calls may still be unwinding
        let _ = self
            .counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| Some(d.saturating_sub(1)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eligibility() {
        assert!(is_eligible(1, None, None));
        assert!(is_eligible(1, None, Some("mlr.resample")));
        assert!(is_eligible(1, Some("mlr.resample"), Some("mlr.resample")));
        assert!(!is_eligible(1, Some("mlr.resample"), Some("mlr.benchmark")));
        assert!(!is_eligible(1, Some("mlr.resample"), None));
        assert!(!is_eligible(2, None, None));
    }

    #[test]
    fn test_nesting_guard_restores_depth() {
        let counter = AtomicUsize::new(0);
        {
            let outer = NestingGuard::enter(&counter);
            assert_eq!(outer.depth(), 1);
            {
                let inner = NestingGuard::enter(&counter);
                assert_eq!(inner.depth(), 2);
            }
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        let guard = NestingGuard::enter(&counter);
        counter.store(0, Ordering::SeqCst);
        drop(guard);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stopped_dispatcher_maps_sequentially() {
        let dispatcher = Dispatcher::with_registry(Arc::new(LevelRegistry::new()));
        let out = dispatcher
            .map(|_ctx, x: i32| Ok(x + 5), vec![1, 2, 3], None)
            .unwrap();
        assert_eq!(out, vec![6, 7, 8]);
        assert_eq!(dispatcher.status(), Status::Stopped);
        assert_eq!(dispatcher.nesting_depth(), 0);
    }

    #[test]
    fn test_local_exports_are_not_staged() {
        let dispatcher = Dispatcher::with_registry(Arc::new(LevelRegistry::new()));
        dispatcher.start(SessionConfig::local()).unwrap();
        dispatcher.stage_export("k", 2_i32);
        assert!(dispatcher.pending_exports().is_empty());

        let out = dispatcher
            .map(|ctx, x: i32| Ok(x * ctx.require::<i32>("k")?), vec![1, 2], None)
            .unwrap();
        assert_eq!(out, vec![2, 4]);
        dispatcher.stop();
    }
}
