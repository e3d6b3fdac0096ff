use super::context::{Environment, StagedResources};
use super::processor::process_sequential;
use super::rng::StreamSeed;
use super::{Backend, BackendStats, Job, TaskSlot};
use crate::config::Mode;
use crate::error::Result;

/// Runs tasks one after another in the calling thread, against the master
/// environment. Nothing is pushed anywhere.
pub struct LocalBackend {
    suppress_errors: bool,
    seed: Option<StreamSeed>,
    stats: BackendStats,
}

impl LocalBackend {
    pub fn new(suppress_errors: bool, seed: Option<StreamSeed>) -> Self {
        Self {
            suppress_errors,
            seed,
            stats: BackendStats::default(),
        }
    }
}

impl Backend for LocalBackend {
    fn mode(&self) -> Mode {
        Mode::Local
    }

    fn workers(&self) -> usize {
        1
    }

    fn push(&mut self, _staged: &StagedResources) -> Result<()> {
        Ok(())
    }

    fn execute(&mut self, job: Job<'_>) -> Result<Vec<TaskSlot>> {
        self.stats.record_dispatch(job.inputs.len());
        let empty = Environment::default();
        let env = job.master.unwrap_or(&empty);
        process_sequential(env, job, self.seed, self.suppress_errors)
    }

    fn destroy(&mut self) -> Result<()> {
        self.stats.destroyed = true;
        Ok(())
    }

    fn stats(&self) -> BackendStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::{AnyValue, TaskContext};
    use std::sync::Arc;

    #[test]
    fn test_uses_master_environment() {
        let mut master = Environment::default();
        master.bind("offset", Arc::new(10_i64));

        let add = |ctx: &mut TaskContext<'_>, input: AnyValue| -> anyhow::Result<AnyValue> {
            let x = *input.downcast::<i64>().map_err(|_| anyhow::anyhow!("bad input"))?;
            Ok(Box::new(x + ctx.require::<i64>("offset")?))
        };

        let mut backend = LocalBackend::new(false, None);
        let slots = backend
            .execute(Job {
                call: 1,
                inputs: vec![Box::new(1_i64), Box::new(2_i64)],
                task: &add,
                master: Some(&master),
                log_dir: None,
            })
            .unwrap();

        let values: Vec<i64> = slots
            .into_iter()
            .map(|slot| *slot.unwrap().downcast::<i64>().unwrap())
            .collect();
        assert_eq!(values, vec![11, 12]);
        assert_eq!(backend.stats().dispatches, 1);
        assert_eq!(backend.stats().tasks, 2);
    }
}
