//! Persistent worker clusters (socket and MPI modes)
//!
//! Nodes are created once when the session starts and keep their own
//! environment until the session stops, so resources pushed before the first
//! call are still there for every later call.

use super::context::{Environment, StagedResources};
use super::processor::{ParallelProcessor, Schedule, WorkerSlot};
use super::rng::StreamSeed;
use super::{Backend, BackendStats, Job, TaskSlot};
use crate::config::{Mode, SocketWorkers};
use crate::error::{Error, Result};

/// Environment variables consulted, in order, for the MPI universe size.
pub const UNIVERSE_SIZE_VARS: [&str; 2] = ["OMPI_UNIVERSE_SIZE", "MPI_UNIVERSE_SIZE"];

#[derive(Debug)]
struct Node {
    id: usize,
    host: String,
    env: Environment,
}

pub struct ClusterBackend {
    mode: Mode,
    nodes: Vec<Node>,
    processor: ParallelProcessor,
    seed: Option<StreamSeed>,
    stats: BackendStats,
}

impl ClusterBackend {
    /// One node per host entry, or `count` nodes on localhost.
    pub fn socket(workers: &SocketWorkers, schedule: Schedule, seed: Option<StreamSeed>) -> Result<Self> {
        let hosts = match workers {
            SocketWorkers::Count(count) => vec!["localhost".to_string(); *count],
            SocketWorkers::Hosts(hosts) => hosts.clone(),
        };
        Self::with_hosts(Mode::Socket, hosts, schedule, seed)
    }

    /// `workers` nodes, or the universe size minus the master when unset.
    pub fn mpi(workers: Option<usize>, schedule: Schedule, seed: Option<StreamSeed>) -> Result<Self> {
        let count = workers.unwrap_or_else(|| default_mpi_workers(universe_size()));
        let hosts = (0..count).map(|rank| format!("rank{}", rank + 1)).collect();
        Self::with_hosts(Mode::Mpi, hosts, schedule, seed)
    }

    fn with_hosts(
        mode: Mode,
        hosts: Vec<String>,
        schedule: Schedule,
        seed: Option<StreamSeed>,
    ) -> Result<Self> {
        if hosts.is_empty() {
            return Err(Error::resource(format!("cannot start a {} cluster without workers", mode)));
        }

        let nodes = hosts
            .into_iter()
            .enumerate()
            .map(|(id, host)| Node {
                id,
                host,
                env: Environment::default(),
            })
            .collect::<Vec<_>>();

        for node in &nodes {
            tracing::trace!("{} node {} on {}", mode, node.id, node.host);
        }

        Ok(Self {
            mode,
            nodes,
            processor: ParallelProcessor::new(schedule),
            seed,
            stats: BackendStats::default(),
        })
    }

    /// Host of each node, in node order.
    pub fn hosts(&self) -> Vec<&str> {
        self.nodes.iter().map(|node| node.host.as_str()).collect()
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.stats.destroyed {
            return Err(Error::resource(format!("{} cluster was already destroyed", self.mode)));
        }
        Ok(())
    }
}

impl Backend for ClusterBackend {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn workers(&self) -> usize {
        self.nodes.len()
    }

    fn push(&mut self, staged: &StagedResources) -> Result<()> {
        self.ensure_alive()?;
        for node in &mut self.nodes {
            node.env.apply(staged);
        }
        self.stats.record_push(staged);
        Ok(())
    }

    fn execute(&mut self, job: Job<'_>) -> Result<Vec<TaskSlot>> {
        self.ensure_alive()?;
        self.stats.record_dispatch(job.inputs.len());

        let slots: Vec<WorkerSlot<'_>> = self
            .nodes
            .iter()
            .map(|node| WorkerSlot {
                id: node.id,
                env: &node.env,
            })
            .collect();

        let outputs = self.processor.process(&slots, job, self.seed)?;
        Ok(outputs.into_iter().map(Ok).collect())
    }

    fn destroy(&mut self) -> Result<()> {
        if self.stats.destroyed {
            return Ok(());
        }
        tracing::debug!("Shutting down {} cluster with {} node(s)", self.mode, self.nodes.len());
        self.nodes.clear();
        self.stats.destroyed = true;
        Ok(())
    }

    fn stats(&self) -> BackendStats {
        self.stats.clone()
    }
}

fn universe_size() -> Option<usize> {
    UNIVERSE_SIZE_VARS
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find_map(|value| value.trim().parse::<usize>().ok())
}

/// Universe size minus the master, at least one.
fn default_mpi_workers(universe: Option<usize>) -> usize {
    universe
        .unwrap_or_else(num_cpus::get)
        .saturating_sub(1)
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::{AnyValue, SharedValue, TaskContext};
    use std::sync::Arc;

    #[test]
    fn test_default_mpi_workers() {
        assert_eq!(default_mpi_workers(Some(5)), 4);
        assert_eq!(default_mpi_workers(Some(1)), 1);
        assert_eq!(default_mpi_workers(Some(0)), 1);
        assert!(default_mpi_workers(None) >= 1);
    }

    #[test]
    fn test_socket_hosts_become_nodes() {
        let hosts = SocketWorkers::Hosts(vec!["a".to_string(), "a".to_string(), "b".to_string()]);
        let cluster = ClusterBackend::socket(&hosts, Schedule::Static, None).unwrap();
        assert_eq!(cluster.workers(), 3);
        assert_eq!(cluster.hosts(), vec!["a", "a", "b"]);

        let cluster = ClusterBackend::socket(&SocketWorkers::Count(2), Schedule::Static, None).unwrap();
        assert_eq!(cluster.hosts(), vec!["localhost", "localhost"]);
    }

    #[test]
    fn test_pushed_exports_persist_across_calls() {
        let mut cluster = ClusterBackend::mpi(Some(2), Schedule::LoadBalanced, None).unwrap();
        cluster
            .push(&StagedResources {
                exports: vec![("k".to_string(), Arc::new(3_i64) as SharedValue)],
                ..Default::default()
            })
            .unwrap();

        let times_k = |ctx: &mut TaskContext<'_>, input: AnyValue| -> anyhow::Result<AnyValue> {
            let x = *input.downcast::<i64>().map_err(|_| anyhow::anyhow!("bad input"))?;
            Ok(Box::new(x * ctx.require::<i64>("k")?))
        };

        for call in 1..=2 {
            let slots = cluster
                .execute(Job {
                    call,
                    inputs: (1..=4_i64).map(|x| Box::new(x) as AnyValue).collect(),
                    task: &times_k,
                    master: None,
                    log_dir: None,
                })
                .unwrap();
            let values: Vec<i64> = slots
                .into_iter()
                .map(|slot| *slot.unwrap().downcast::<i64>().unwrap())
                .collect();
            assert_eq!(values, vec![3, 6, 9, 12]);
        }

        let stats = cluster.stats();
        assert_eq!(stats.exports_pushed, 1);
        assert_eq!(stats.dispatches, 2);
    }

    #[test]
    fn test_destroy_is_idempotent_and_final() {
        let mut cluster = ClusterBackend::socket(&SocketWorkers::Count(1), Schedule::Static, None).unwrap();
        cluster.destroy().unwrap();
        cluster.destroy().unwrap();
        assert!(cluster.stats().destroyed);

        let noop = |_ctx: &mut TaskContext<'_>, input: AnyValue| -> anyhow::Result<AnyValue> { Ok(input) };
        let result = cluster.execute(Job {
            call: 1,
            inputs: vec![Box::new(1_i64)],
            task: &noop,
            master: None,
            log_dir: None,
        });
        assert!(matches!(result, Err(Error::Resource(_))));
    }
}
