use super::context::{Environment, StagedResources};
use super::processor::{ParallelProcessor, Schedule, WorkerSlot};
use super::rng::StreamSeed;
use super::{Backend, BackendStats, Job, TaskSlot};
use crate::config::Mode;
use crate::error::{Error, Result};

/// Forks a fresh set of workers for every call.
///
/// Pushed resources go into a base environment; each call copies the base
/// once per worker so a task can never observe state left by another call.
pub struct MultiProcessBackend {
    workers: usize,
    processor: ParallelProcessor,
    base: Environment,
    seed: Option<StreamSeed>,
    stats: BackendStats,
}

impl MultiProcessBackend {
    pub fn new(workers: usize, schedule: Schedule, seed: Option<StreamSeed>) -> Self {
        Self {
            workers: workers.max(1),
            processor: ParallelProcessor::new(schedule),
            base: Environment::default(),
            seed,
            stats: BackendStats::default(),
        }
    }
}

impl Backend for MultiProcessBackend {
    fn mode(&self) -> Mode {
        Mode::MultiProcess
    }

    fn workers(&self) -> usize {
        self.workers
    }

    fn push(&mut self, staged: &StagedResources) -> Result<()> {
        self.base.apply(staged);
        self.stats.record_push(staged);
        Ok(())
    }

    fn execute(&mut self, job: Job<'_>) -> Result<Vec<TaskSlot>> {
        if self.stats.destroyed {
            return Err(Error::resource("multiprocess backend was already destroyed"));
        }
        self.stats.record_dispatch(job.inputs.len());

        let forked: Vec<Environment> = (0..self.workers.min(job.inputs.len()))
            .map(|_| self.base.clone())
            .collect();
        let slots: Vec<WorkerSlot<'_>> = forked
            .iter()
            .enumerate()
            .map(|(id, env)| WorkerSlot { id, env })
            .collect();

        let outputs = self.processor.process(&slots, job, self.seed)?;
        Ok(outputs.into_iter().map(Ok).collect())
    }

    fn destroy(&mut self) -> Result<()> {
        self.base = Environment::default();
        self.stats.destroyed = true;
        Ok(())
    }

    fn stats(&self) -> BackendStats {
        self.stats.clone()
    }
}
