//! Worker-side view of a task: its environment of pushed resources and the
//! per-task context handed to the mapped function.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand_chacha::ChaCha8Rng;

/// An exported value shared by every worker it was pushed to.
pub type SharedValue = Arc<dyn Any + Send + Sync>;

/// Resources a worker has received: exported values, loaded libraries and
/// sourced files.
#[derive(Clone, Default)]
pub struct Environment {
    exports: HashMap<String, SharedValue>,
    libraries: BTreeSet<String>,
    sources: BTreeMap<PathBuf, Arc<str>>,
}

impl Environment {
    pub fn bind(&mut self, name: impl Into<String>, value: SharedValue) {
        self.exports.insert(name.into(), value);
    }

    pub fn load_library(&mut self, name: impl Into<String>) {
        self.libraries.insert(name.into());
    }

    pub fn add_source(&mut self, path: impl Into<PathBuf>, content: Arc<str>) {
        self.sources.insert(path.into(), content);
    }

    /// Install a batch of staged resources.
    pub fn apply(&mut self, staged: &StagedResources) {
        for (name, value) in &staged.exports {
            self.bind(name.clone(), value.clone());
        }
        for library in &staged.libraries {
            self.load_library(library.clone());
        }
        for (path, content) in &staged.sources {
            self.add_source(path.clone(), content.clone());
        }
    }

    pub fn get<T: Any>(&self, name: &str) -> Option<&T> {
        self.exports.get(name).and_then(|value| value.downcast_ref::<T>())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.exports.contains_key(name)
    }

    pub fn has_library(&self, name: &str) -> bool {
        self.libraries.contains(name)
    }

    pub fn source(&self, path: &Path) -> Option<&str> {
        self.sources.get(path).map(|content| content.as_ref())
    }

    pub fn export_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.exports.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Everything installed here, ready to be pushed to another environment.
    pub fn to_staged(&self) -> StagedResources {
        let mut exports: Vec<(String, SharedValue)> = self
            .exports
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        exports.sort_by(|a, b| a.0.cmp(&b.0));

        StagedResources {
            exports,
            libraries: self.libraries.iter().cloned().collect(),
            sources: self
                .sources
                .iter()
                .map(|(path, content)| (path.clone(), content.clone()))
                .collect(),
        }
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("exports", &self.export_names())
            .field("libraries", &self.libraries)
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Staged resources after they were resolved on the master and are ready to
/// be pushed to a backend.
#[derive(Clone, Default)]
pub struct StagedResources {
    pub exports: Vec<(String, SharedValue)>,
    pub libraries: Vec<String>,
    pub sources: Vec<(PathBuf, Arc<str>)>,
}

impl StagedResources {
    pub fn is_empty(&self) -> bool {
        self.exports.is_empty() && self.libraries.is_empty() && self.sources.is_empty()
    }

    pub fn export_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.exports.iter().map(|(name, _)| name.as_str())
    }
}

impl fmt::Debug for StagedResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagedResources")
            .field("exports", &self.export_names().collect::<Vec<_>>())
            .field("libraries", &self.libraries)
            .field("sources", &self.sources.iter().map(|(p, _)| p).collect::<Vec<_>>())
            .finish()
    }
}

/// Context passed to the mapped function for one task.
pub struct TaskContext<'a> {
    iteration: usize,
    worker: Option<usize>,
    env: &'a Environment,
    rng: ChaCha8Rng,
    log_file: Option<PathBuf>,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(
        iteration: usize,
        worker: Option<usize>,
        env: &'a Environment,
        rng: ChaCha8Rng,
        log_file: Option<PathBuf>,
    ) -> Self {
        Self {
            iteration,
            worker,
            env,
            rng,
            log_file,
        }
    }

    /// 1-based position of the input element.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Worker running this task, `None` when running in the caller's thread.
    pub fn worker(&self) -> Option<usize> {
        self.worker
    }

    /// Exported value pushed to this worker.
    pub fn get<T: Any>(&self, name: &str) -> Option<&T> {
        self.env.get(name)
    }

    /// Like [`get`](Self::get) but fails the task when the export is missing.
    pub fn require<T: Any>(&self, name: &str) -> anyhow::Result<&T> {
        self.env.get(name).ok_or_else(|| {
            anyhow::anyhow!(
                "export '{}' is not available on this worker or has a different type",
                name
            )
        })
    }

    pub fn has_library(&self, name: &str) -> bool {
        self.env.has_library(name)
    }

    pub fn source(&self, path: impl AsRef<Path>) -> Option<&str> {
        self.env.source(path.as_ref())
    }

    pub fn environment(&self) -> &Environment {
        self.env
    }

    /// Random stream of this task. Deterministic for reproducible sessions.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    /// Per-task log file, when logging is enabled for the session.
    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    /// Append a line to the task's log file. No-op without logging.
    pub fn log(&self, message: impl fmt::Display) -> std::io::Result<()> {
        let Some(path) = &self.log_file else {
            return Ok(());
        };
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn staged() -> StagedResources {
        StagedResources {
            exports: vec![("bigmatrix".to_string(), Arc::new(vec![1u32, 2, 3]) as SharedValue)],
            libraries: vec!["stats".to_string()],
            sources: vec![(PathBuf::from("helpers.R"), Arc::from("x <- 1"))],
        }
    }

    #[test]
    fn test_apply_staged_resources() {
        let mut env = Environment::default();
        env.apply(&staged());

        assert_eq!(env.get::<Vec<u32>>("bigmatrix"), Some(&vec![1, 2, 3]));
        assert!(env.get::<String>("bigmatrix").is_none());
        assert!(env.has_library("stats"));
        assert_eq!(env.source(Path::new("helpers.R")), Some("x <- 1"));
        assert_eq!(env.export_names(), vec!["bigmatrix"]);
    }

    #[test]
    fn test_to_staged_copies_everything() {
        let mut master = Environment::default();
        master.apply(&staged());
        master.bind("alpha", Arc::new(0.5_f64));
        assert!(Environment::default().to_staged().is_empty());

        let snapshot = master.to_staged();
        assert_eq!(snapshot.export_names().collect::<Vec<_>>(), vec!["alpha", "bigmatrix"]);

        let mut worker = Environment::default();
        worker.apply(&snapshot);
        assert_eq!(worker.get::<f64>("alpha"), Some(&0.5));
        assert!(worker.has_library("stats"));
        assert_eq!(worker.source(Path::new("helpers.R")), Some("x <- 1"));
    }

    #[test]
    fn test_context_accessors() {
        let mut env = Environment::default();
        env.apply(&staged());
        let ctx = TaskContext::new(2, Some(0), &env, ChaCha8Rng::seed_from_u64(1), None);

        assert_eq!(ctx.iteration(), 2);
        assert_eq!(ctx.worker(), Some(0));
        assert!(ctx.require::<Vec<u32>>("bigmatrix").is_ok());
        assert!(ctx.require::<Vec<u32>>("missing").is_err());
        assert!(ctx.log("ignored without a log file").is_ok());
    }

    #[test]
    fn test_log_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.log");
        let env = Environment::default();
        let ctx = TaskContext::new(1, None, &env, ChaCha8Rng::seed_from_u64(1), Some(path.clone()));

        ctx.log("first").unwrap();
        ctx.log("second").unwrap();

        assert_eq!(std::fs::read_to_string(path).unwrap(), "first\nsecond\n");
    }
}
