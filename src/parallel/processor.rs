use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::channel::{Receiver, Sender, bounded};

use super::context::{Environment, TaskContext};
use super::rng::{self, StreamSeed};
use super::{AnyValue, Job, TaskFn, TaskSlot};
use crate::error::{Error, Result, TaskError};

/// How tasks are handed to workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Idle workers pull one task at a time from a shared queue.
    LoadBalanced,
    /// Tasks are dealt round-robin to workers before any of them starts.
    Static,
}

impl Schedule {
    pub fn from_load_balancing(load_balancing: bool) -> Self {
        if load_balancing {
            Schedule::LoadBalanced
        } else {
            Schedule::Static
        }
    }
}

/// A worker identity together with the environment it runs tasks in
pub struct WorkerSlot<'a> {
    pub id: usize,
    pub env: &'a Environment,
}

/// Runs a job on a set of worker threads and returns outputs in input order
///
/// The first failing task stops workers from picking up further tasks; the
/// call then fails with the failure of the lowest iteration seen.
pub struct ParallelProcessor {
    schedule: Schedule,
    /// Channel buffer size multiplier (buffer = workers * multiplier)
    channel_buffer_multiplier: usize,
}

impl ParallelProcessor {
    pub fn new(schedule: Schedule) -> Self {
        Self {
            schedule,
            channel_buffer_multiplier: 2,
        }
    }

    pub fn process(
        &self,
        workers: &[WorkerSlot<'_>],
        job: Job<'_>,
        seed: Option<StreamSeed>,
    ) -> Result<Vec<AnyValue>> {
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
        if workers.is_empty() {
            return Err(Error::resource("no workers available"));
        }

        let active = workers.len().min(total);
        let buffer = active * self.channel_buffer_multiplier;
        let (result_tx, result_rx): (Sender<(usize, TaskSlot)>, Receiver<(usize, TaskSlot)>) =
            bounded(buffer * 2);
        let abort = AtomicBool::new(false);
        let log_dir = log_dir.as_deref();

        let indexed_results = crossbeam::thread::scope(|s| {
            let abort = &abort;

            match self.schedule {
                Schedule::LoadBalanced => {
                    let (work_tx, work_rx): (Sender<(usize, AnyValue)>, Receiver<(usize, AnyValue)>) =
                        bounded(buffer);

                    for slot in &workers[..active] {
                        let work_rx = work_rx.clone();
                        let result_tx = result_tx.clone();
                        s.spawn(move |_| {
                            while let Ok((index, input)) = work_rx.recv() {
                                if abort.load(Ordering::Relaxed) {
                                    continue; // drain without running
                                }
                                let outcome =
                                    run_task(task, slot.env, Some(slot.id), index, input, call, seed, log_dir);
                                if outcome.is_err() {
                                    abort.store(true, Ordering::Relaxed);
                                }
                                if result_tx.send((index, outcome)).is_err() {
                                    break; // Receiver dropped
                                }
                            }
                        });
                    }

                    drop(work_rx);

                    // Producer: feed the shared queue
                    s.spawn(move |_| {
                        for (index, input) in inputs.into_iter().enumerate() {
                            if work_tx.send((index, input)).is_err() {
                                break; // Workers dropped
                            }
                        }
                    });
                }
                Schedule::Static => {
                    let mut chunks: Vec<Vec<(usize, AnyValue)>> = (0..active).map(|_| Vec::new()).collect();
                    for (index, input) in inputs.into_iter().enumerate() {
                        chunks[index % active].push((index, input));
                    }

                    for (slot, chunk) in workers.iter().zip(chunks) {
                        let result_tx = result_tx.clone();
                        s.spawn(move |_| {
                            for (index, input) in chunk {
                                if abort.load(Ordering::Relaxed) {
                                    break;
                                }
                                let outcome =
                                    run_task(task, slot.env, Some(slot.id), index, input, call, seed, log_dir);
                                if outcome.is_err() {
                                    abort.store(true, Ordering::Relaxed);
                                }
                                if result_tx.send((index, outcome)).is_err() {
                                    break;
                                }
                            }
                        });
                    }
                }
            }

            // Drop the original sender so the collector sees the channel close
            drop(result_tx);

            collect_results(result_rx, total)
        })
        .map_err(|_| Error::resource("worker thread panicked during parallel execution"))?;

        assemble(total, indexed_results)
    }
}

/// Run one task, converting errors and panics into a [`TaskError`].
#[allow(clippy::too_many_arguments)]
pub(crate) fn run_task(
    task: &TaskFn<'_>,
    env: &Environment,
    worker: Option<usize>,
    index: usize,
    input: AnyValue,
    call: usize,
    seed: Option<StreamSeed>,
    log_dir: Option<&Path>,
) -> TaskSlot {
    let iteration = index + 1;
    let log_file = log_dir.map(|dir| dir.join(format!("{}.log", iteration)));
    let mut ctx = TaskContext::new(
        iteration,
        worker,
        env,
        rng::task_rng(seed, call, iteration),
        log_file,
    );
    let _scope = rng::TaskScope::enter(seed.map(|seed| seed.nested(call, iteration)));

    match panic::catch_unwind(AssertUnwindSafe(|| task(&mut ctx, input))) {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(error)) => Err(TaskError::new(iteration, worker, &error)),
        Err(payload) => Err(TaskError::from_panic(iteration, worker, payload)),
    }
}

/// Run a job in the calling thread.
///
/// With `suppress_errors` a failing task leaves its error in its slot and the
/// remaining tasks still run; otherwise the first failure ends the call.
pub(crate) fn process_sequential(
    env: &Environment,
    job: Job<'_>,
    seed: Option<StreamSeed>,
    suppress_errors: bool,
) -> Result<Vec<TaskSlot>> {
    let Job {
        call,
        inputs,
        task,
        log_dir,
        ..
    } = job;

    let mut slots = Vec::with_capacity(inputs.len());
    for (index, input) in inputs.into_iter().enumerate() {
        match run_task(task, env, None, index, input, call, seed, log_dir.as_deref()) {
            Ok(output) => slots.push(Ok(output)),
            Err(error) if suppress_errors => {
                tracing::warn!("Suppressed error in {}", error);
                slots.push(Err(error));
            }
            Err(error) => return Err(Error::Task(error)),
        }
    }
    Ok(slots)
}

fn collect_results(result_rx: Receiver<(usize, TaskSlot)>, total: usize) -> Vec<(usize, TaskSlot)> {
    let mut results = Vec::with_capacity(total);

    while let Ok(result) = result_rx.recv() {
        results.push(result);

        if results.len() >= total {
            break;
        }
    }

    results
}

/// Put indexed outcomes back into input order, failing on the lowest failed iteration.
pub(crate) fn assemble(total: usize, indexed: Vec<(usize, TaskSlot)>) -> Result<Vec<AnyValue>> {
    let mut slots: Vec<Option<AnyValue>> = (0..total).map(|_| None).collect();
    let mut first_error: Option<TaskError> = None;

    for (index, outcome) in indexed {
        match outcome {
            Ok(output) => slots[index] = Some(output),
            Err(error) => {
                if first_error.as_ref().is_none_or(|e| error.iteration < e.iteration) {
                    first_error = Some(error);
                }
            }
        }
    }

    if let Some(error) = first_error {
        return Err(Error::Task(error));
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.ok_or_else(|| Error::resource(format!("no result received for task {}", index + 1)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn square(_ctx: &mut TaskContext<'_>, input: AnyValue) -> anyhow::Result<AnyValue> {
        let x = *input.downcast::<i64>().map_err(|_| anyhow::anyhow!("bad input"))?;
        Ok(Box::new(x * x))
    }

    fn job<'f>(task: &'f TaskFn<'f>, inputs: Vec<i64>) -> Job<'f> {
        Job {
            call: 1,
            inputs: inputs.into_iter().map(|i| Box::new(i) as AnyValue).collect(),
            task,
            master: None,
            log_dir: None,
        }
    }

    fn unbox(values: Vec<AnyValue>) -> Vec<i64> {
        values.into_iter().map(|v| *v.downcast::<i64>().unwrap()).collect()
    }

    #[test]
    fn test_order_is_preserved_for_both_schedules() {
        let env = Environment::default();
        let workers: Vec<WorkerSlot<'_>> = (0..3).map(|id| WorkerSlot { id, env: &env }).collect();
        let inputs: Vec<i64> = (1..=20).collect();
        let expected: Vec<i64> = inputs.iter().map(|x| x * x).collect();

        for schedule in [Schedule::LoadBalanced, Schedule::Static] {
            let processor = ParallelProcessor::new(schedule);
            let out = processor.process(&workers, job(&square, inputs.clone()), None).unwrap();
            assert_eq!(unbox(out), expected);
        }
    }

    #[test]
    fn test_empty_input() {
        let env = Environment::default();
        let workers = [WorkerSlot { id: 0, env: &env }];
        let processor = ParallelProcessor::new(Schedule::Static);
        assert!(processor.process(&workers, job(&square, vec![]), None).unwrap().is_empty());
    }

    #[test]
    fn test_first_failure_aborts() {
        let env = Environment::default();
        let workers: Vec<WorkerSlot<'_>> = (0..2).map(|id| WorkerSlot { id, env: &env }).collect();
        let failing = |_ctx: &mut TaskContext<'_>, input: AnyValue| -> anyhow::Result<AnyValue> {
            let x = *input.downcast::<i64>().map_err(|_| anyhow::anyhow!("bad input"))?;
            if x == 3 {
                anyhow::bail!("cannot handle 3");
            }
            Ok(Box::new(x))
        };

        for schedule in [Schedule::LoadBalanced, Schedule::Static] {
            let processor = ParallelProcessor::new(schedule);
            let err = processor
                .process(&workers, job(&failing, vec![1, 2, 3, 4]), None)
                .unwrap_err();
            match err {
                Error::Task(task) => {
                    assert_eq!(task.iteration, 3);
                    assert!(task.message.contains("cannot handle 3"));
                    assert!(task.worker.is_some());
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn test_panics_become_task_errors() {
        let env = Environment::default();
        let workers = [WorkerSlot { id: 0, env: &env }];
        let panicking = |_ctx: &mut TaskContext<'_>, _input: AnyValue| -> anyhow::Result<AnyValue> {
            panic!("worker exploded");
        };

        let processor = ParallelProcessor::new(Schedule::LoadBalanced);
        let err = processor.process(&workers, job(&panicking, vec![1]), None).unwrap_err();
        assert!(matches!(err, Error::Task(ref t) if t.message.contains("worker exploded")));
    }

    #[test]
    fn test_static_schedule_is_round_robin() {
        let env = Environment::default();
        let workers: Vec<WorkerSlot<'_>> = (0..2).map(|id| WorkerSlot { id, env: &env }).collect();
        let which_worker = |ctx: &mut TaskContext<'_>, _input: AnyValue| -> anyhow::Result<AnyValue> {
            Ok(Box::new(ctx.worker().unwrap_or(usize::MAX)))
        };

        let processor = ParallelProcessor::new(Schedule::Static);
        let out = processor
            .process(&workers, job(&which_worker, vec![0, 0, 0, 0]), None)
            .unwrap();
        let assigned: Vec<usize> = out.into_iter().map(|v| *v.downcast::<usize>().unwrap()).collect();
        assert_eq!(assigned, vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_sequential_suppression() {
        let env = Environment::default();
        let calls = AtomicUsize::new(0);
        let failing = |_ctx: &mut TaskContext<'_>, input: AnyValue| -> anyhow::Result<AnyValue> {
            calls.fetch_add(1, Ordering::Relaxed);
            let x = *input.downcast::<i64>().map_err(|_| anyhow::anyhow!("bad input"))?;
            if x == 2 {
                anyhow::bail!("two");
            }
            Ok(Box::new(x))
        };

        let slots = process_sequential(&env, job(&failing, vec![1, 2, 3]), None, true).unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert!(slots[0].is_ok());
        assert_eq!(slots[1].as_ref().unwrap_err().iteration, 2);
        assert!(slots[2].is_ok());

        let err = process_sequential(&env, job(&failing, vec![1, 2, 3]), None, false).unwrap_err();
        assert!(matches!(err, Error::Task(ref t) if t.iteration == 2));
    }

    #[test]
    fn test_tasks_scope_nested_streams() {
        let env = Environment::default();
        let nested = |_ctx: &mut TaskContext<'_>, _input: AnyValue| -> anyhow::Result<AnyValue> {
            Ok(Box::new(rng::next_nested_call().map(|(seed, call)| (seed.value(), call))))
        };
        let run = |seed| {
            process_sequential(&env, job(&nested, vec![1, 2]), seed, false)
                .unwrap()
                .into_iter()
                .map(|slot| *slot.unwrap().downcast::<Option<(u64, usize)>>().unwrap())
                .collect::<Vec<_>>()
        };

        let seeded = run(Some(StreamSeed::new(5)));
        assert_eq!(seeded, run(Some(StreamSeed::new(5))));
        assert_eq!(seeded[0].map(|(_, call)| call), Some(1));
        assert_ne!(seeded[0], seeded[1]);
        assert_eq!(run(None), vec![None, None]);
        assert!(rng::next_nested_call().is_none());
    }
}
