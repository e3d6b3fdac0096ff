//! Batch queue backend
//!
//! A session owns one registry directory under the storage directory:
//!
//! ```text
//! <storage_dir>/parallelMap_reg_<uuid>/
//!   registry.json           resources and exported names
//!   jobs/<call>/<i>.json    one record per task
//! ```
//!
//! Every call registers one job per input, submits them to a bounded pool
//! and blocks until all of them finished.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crossbeam::channel::unbounded;
use serde::{Deserialize, Serialize};

use super::context::{Environment, StagedResources};
use super::processor::{assemble, run_task};
use super::rng::StreamSeed;
use super::{Backend, BackendStats, Job, TaskSlot};
use crate::config::Mode;
use crate::error::{Error, Result};

pub const REGISTRY_DIR_PREFIX: &str = "parallelMap_reg_";

const REGISTRY_FILE: &str = "registry.json";
const JOBS_DIR: &str = "jobs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Submitted,
    Running,
    Done,
    Error,
}

/// On-disk record of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub call: usize,
    pub iteration: usize,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Contents of `registry.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryMetadata {
    pub resources: BTreeMap<String, String>,
    pub max_concurrent_jobs: usize,
    pub exports: Vec<String>,
    pub libraries: Vec<String>,
    pub sources: Vec<PathBuf>,
}

pub struct BatchBackend {
    registry_dir: PathBuf,
    metadata: RegistryMetadata,
    pool: rayon::ThreadPool,
    env: Environment,
    seed: Option<StreamSeed>,
    stats: BackendStats,
}

impl BatchBackend {
    pub fn new(
        storage_dir: &Path,
        max_concurrent: usize,
        resources: BTreeMap<String, String>,
        seed: Option<StreamSeed>,
    ) -> Result<Self> {
        let max_concurrent = max_concurrent.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(max_concurrent)
            .thread_name(|i| format!("parmap-batch-{}", i))
            .build()
            .map_err(|e| Error::resource(format!("failed to create batch job pool: {}", e)))?;

        let registry_dir = storage_dir.join(format!(
            "{}{}",
            REGISTRY_DIR_PREFIX,
            uuid::Uuid::new_v4().simple()
        ));
        fs::create_dir_all(registry_dir.join(JOBS_DIR)).map_err(|e| {
            Error::resource(format!(
                "failed to create batch registry {}: {}",
                registry_dir.display(),
                e
            ))
        })?;

        let backend = Self {
            registry_dir,
            metadata: RegistryMetadata {
                resources,
                max_concurrent_jobs: max_concurrent,
                ..Default::default()
            },
            pool,
            env: Environment::default(),
            seed,
            stats: BackendStats::default(),
        };
        backend.write_metadata()?;

        tracing::debug!("Created batch registry {}", backend.registry_dir.display());
        Ok(backend)
    }

    pub fn registry_dir(&self) -> &Path {
        &self.registry_dir
    }

    pub fn metadata(&self) -> &RegistryMetadata {
        &self.metadata
    }

    fn write_metadata(&self) -> Result<()> {
        let path = self.registry_dir.join(REGISTRY_FILE);
        let content = serde_json::to_string_pretty(&self.metadata)
            .map_err(|e| Error::resource(format!("failed to serialize registry metadata: {}", e)))?;
        fs::write(&path, content)
            .map_err(|e| Error::resource(format!("failed to write {}: {}", path.display(), e)))
    }

    fn call_dir(&self, call: usize) -> PathBuf {
        self.registry_dir.join(JOBS_DIR).join(call.to_string())
    }
}

fn record_path(call_dir: &Path, iteration: usize) -> PathBuf {
    call_dir.join(format!("{}.json", iteration))
}

fn write_record(call_dir: &Path, record: &JobRecord) -> Result<()> {
    let path = record_path(call_dir, record.iteration);
    let content = serde_json::to_string(record)
        .map_err(|e| Error::resource(format!("failed to serialize job record: {}", e)))?;
    fs::write(&path, content)
        .map_err(|e| Error::resource(format!("failed to write {}: {}", path.display(), e)))
}

/// Read back a job record, mainly for inspection and tests.
pub fn read_record(registry_dir: &Path, call: usize, iteration: usize) -> Result<JobRecord> {
    let path = record_path(&registry_dir.join(JOBS_DIR).join(call.to_string()), iteration);
    let content = fs::read_to_string(&path)?;
    serde_json::from_str(&content)
        .map_err(|e| Error::resource(format!("invalid job record {}: {}", path.display(), e)))
}

impl Backend for BatchBackend {
    fn mode(&self) -> Mode {
        Mode::BatchQueue
    }

    fn workers(&self) -> usize {
        self.metadata.max_concurrent_jobs
    }

    fn push(&mut self, staged: &StagedResources) -> Result<()> {
        if self.stats.destroyed {
            return Err(Error::resource("batch registry was already removed"));
        }
        self.env.apply(staged);

        for name in staged.export_names() {
            if !self.metadata.exports.iter().any(|n| n == name) {
                self.metadata.exports.push(name.to_string());
            }
        }
        for library in &staged.libraries {
            if !self.metadata.libraries.contains(library) {
                self.metadata.libraries.push(library.clone());
            }
        }
        for (path, _) in &staged.sources {
            if !self.metadata.sources.contains(path) {
                self.metadata.sources.push(path.clone());
            }
        }
        self.write_metadata()?;
        self.stats.record_push(staged);
        Ok(())
    }

    fn execute(&mut self, job: Job<'_>) -> Result<Vec<TaskSlot>> {
        if self.stats.destroyed {
            return Err(Error::resource("batch registry was already removed"));
        }
        self.stats.record_dispatch(job.inputs.len());

        let Job {
            call,
            inputs,
            task,
            log_dir,
            ..
        } = job;
        let total = inputs.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let call_dir = self.call_dir(call);
        fs::create_dir_all(&call_dir).map_err(|e| {
            Error::resource(format!("failed to create {}: {}", call_dir.display(), e))
        })?;
        for iteration in 1..=total {
            write_record(
                &call_dir,
                &JobRecord {
                    call,
                    iteration,
                    status: JobStatus::Submitted,
                    error: None,
                },
            )?;
        }
        tracing::debug!("Submitted {} job(s) to {}", total, call_dir.display());

        let (result_tx, result_rx) = unbounded();
        let env = &self.env;
        let seed = self.seed;
        let call_dir = call_dir.as_path();
        let log_dir = log_dir.as_deref();

        self.pool.scope(|s| {
            for (index, input) in inputs.into_iter().enumerate() {
                let result_tx = result_tx.clone();
                s.spawn(move |_| {
                    let iteration = index + 1;
                    let mut record = JobRecord {
                        call,
                        iteration,
                        status: JobStatus::Running,
                        error: None,
                    };
                    if let Err(e) = write_record(call_dir, &record) {
                        tracing::warn!("Job {}: {}", iteration, e);
                    }

                    let outcome = run_task(task, env, None, index, input, call, seed, log_dir);

                    match &outcome {
                        Ok(_) => record.status = JobStatus::Done,
                        Err(error) => {
                            record.status = JobStatus::Error;
                            record.error = Some(error.message.clone());
                        }
                    }
                    if let Err(e) = write_record(call_dir, &record) {
                        tracing::warn!("Job {}: {}", iteration, e);
                    }

                    let _ = result_tx.send((index, outcome));
                });
            }
        });
        drop(result_tx);

        let indexed: Vec<(usize, TaskSlot)> = result_rx.iter().collect();
        let outputs = assemble(total, indexed)?;
        Ok(outputs.into_iter().map(Ok).collect())
    }

    fn destroy(&mut self) -> Result<()> {
        if self.stats.destroyed {
            return Ok(());
        }
        self.stats.destroyed = true;
        if self.registry_dir.exists() {
            fs::remove_dir_all(&self.registry_dir).map_err(|e| {
                Error::resource(format!(
                    "failed to remove batch registry {}: {}",
                    self.registry_dir.display(),
                    e
                ))
            })?;
        }
        tracing::debug!("Removed batch registry {}", self.registry_dir.display());
        Ok(())
    }

    fn stats(&self) -> BackendStats {
        self.stats.clone()
    }
}

impl Drop for BatchBackend {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            tracing::warn!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::{AnyValue, TaskContext};
    use tempfile::TempDir;

    fn double(_ctx: &mut TaskContext<'_>, input: AnyValue) -> anyhow::Result<AnyValue> {
        let x = *input.downcast::<i64>().map_err(|_| anyhow::anyhow!("bad input"))?;
        if x < 0 {
            anyhow::bail!("negative input {}", x);
        }
        Ok(Box::new(x * 2))
    }

    fn job(inputs: Vec<i64>) -> Job<'static> {
        Job {
            call: 1,
            inputs: inputs.into_iter().map(|x| Box::new(x) as AnyValue).collect(),
            task: &double,
            master: None,
            log_dir: None,
        }
    }

    #[test]
    fn test_registry_lifecycle() {
        let storage = TempDir::new().unwrap();
        let mut resources = BTreeMap::new();
        resources.insert("walltime".to_string(), "3600".to_string());

        let mut backend = BatchBackend::new(storage.path(), 2, resources, None).unwrap();
        let registry = backend.registry_dir().to_path_buf();
        assert!(registry.starts_with(storage.path()));
        assert!(
            registry
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with(REGISTRY_DIR_PREFIX)
        );

        let metadata: RegistryMetadata =
            serde_json::from_str(&fs::read_to_string(registry.join(REGISTRY_FILE)).unwrap()).unwrap();
        assert_eq!(metadata.resources.get("walltime").map(String::as_str), Some("3600"));
        assert_eq!(metadata.max_concurrent_jobs, 2);

        let slots = backend.execute(job(vec![1, 2, 3])).unwrap();
        let values: Vec<i64> = slots
            .into_iter()
            .map(|slot| *slot.unwrap().downcast::<i64>().unwrap())
            .collect();
        assert_eq!(values, vec![2, 4, 6]);

        for iteration in 1..=3 {
            let record = read_record(&registry, 1, iteration).unwrap();
            assert_eq!(record.status, JobStatus::Done);
        }

        backend.destroy().unwrap();
        assert!(!registry.exists());
        backend.destroy().unwrap();
    }

    #[test]
    fn test_failed_job_is_recorded() {
        let storage = TempDir::new().unwrap();
        let mut backend = BatchBackend::new(storage.path(), 1, BTreeMap::new(), None).unwrap();

        let err = backend.execute(job(vec![1, -2, -3])).unwrap_err();
        assert!(matches!(err, Error::Task(ref t) if t.iteration == 2));

        let record = read_record(backend.registry_dir(), 1, 2).unwrap();
        assert_eq!(record.status, JobStatus::Error);
        assert!(record.error.unwrap().contains("negative input -2"));
    }

    #[test]
    fn test_push_records_export_names() {
        let storage = TempDir::new().unwrap();
        let mut backend = BatchBackend::new(storage.path(), 1, BTreeMap::new(), None).unwrap();
        let staged = StagedResources {
            exports: vec![("a".to_string(), std::sync::Arc::new(1_u8) as crate::parallel::SharedValue)],
            libraries: vec!["stats".to_string()],
            sources: Vec::new(),
        };

        backend.push(&staged).unwrap();
        backend.push(&staged).unwrap();

        assert_eq!(backend.metadata().exports, vec!["a".to_string()]);
        assert_eq!(backend.metadata().libraries, vec!["stats".to_string()]);
        assert_eq!(backend.stats().exports_pushed, 2);
    }

    #[test]
    fn test_missing_storage_dir_fails() {
        let storage = TempDir::new().unwrap();
        let file = storage.path().join("not-a-dir");
        fs::write(&file, "").unwrap();
        assert!(matches!(
            BatchBackend::new(&file, 1, BTreeMap::new(), None),
            Err(Error::Resource(_))
        ));
    }
}
