//! Reproducible random streams.
//!
//! A session started with `reproducible = true` owns one master seed. Every
//! task derives its own ChaCha stream from the master seed, the dispatch
//! number and the task's iteration, so the numbers a task sees do not depend
//! on which worker picked it up or in which order tasks finished.
//!
//! Calls that run sequentially inside a seeded task take their streams from
//! that task, numbered by the order the task makes them. Top-level calls
//! that are not parallelized use a separate sequence derived from the
//! master seed.

use std::cell::Cell;

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

const NESTED_SALT: u64 = 0x6e65_7374_6564_5f5f;
const SEQUENTIAL_SALT: u64 = 0x7365_7175_656e_7469;

thread_local! {
    static ENCLOSING: Cell<Option<Enclosing>> = const { Cell::new(None) };
}

/// Stream state of the task running on this thread.
#[derive(Debug, Clone, Copy)]
struct Enclosing {
    seed: StreamSeed,
    calls: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSeed(u64);

impl StreamSeed {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Stream for one task of one dispatch.
    pub fn task_rng(&self, call: usize, iteration: usize) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::seed_from_u64(splitmix64(self.0 ^ splitmix64(call as u64)));
        rng.set_stream(iteration as u64);
        rng
    }

    /// Seed for calls made from inside one task.
    pub fn nested(&self, call: usize, iteration: usize) -> StreamSeed {
        StreamSeed(splitmix64(self.task_rng(call, iteration).next_u64() ^ NESTED_SALT))
    }

    /// Seed for top-level calls of a session that run sequentially.
    pub fn sequential(&self) -> StreamSeed {
        StreamSeed(splitmix64(self.0 ^ SEQUENTIAL_SALT))
    }
}

/// Marks the current thread as running a task whose nested calls draw from
/// `seed`. The previous state comes back when the guard drops.
pub(crate) struct TaskScope {
    previous: Option<Enclosing>,
}

impl TaskScope {
    pub(crate) fn enter(seed: Option<StreamSeed>) -> Self {
        let current = seed.map(|seed| Enclosing { seed, calls: 0 });
        Self {
            previous: ENCLOSING.with(|cell| cell.replace(current)),
        }
    }
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        ENCLOSING.with(|cell| cell.set(self.previous));
    }
}

/// Seed and call number for the next call made by the task running on this
/// thread, `None` outside a seeded task.
pub(crate) fn next_nested_call() -> Option<(StreamSeed, usize)> {
    ENCLOSING.with(|cell| {
        let mut enclosing = cell.get()?;
        enclosing.calls += 1;
        cell.set(Some(enclosing));
        Some((enclosing.seed, enclosing.calls))
    })
}

/// Stream for a task: seeded when the session is reproducible, fresh otherwise.
pub fn task_rng(seed: Option<StreamSeed>, call: usize, iteration: usize) -> ChaCha8Rng {
    match seed {
        Some(seed) => seed.task_rng(call, iteration),
        None => ChaCha8Rng::seed_from_u64(rand::thread_rng().next_u64()),
    }
}

/// Draw a master seed for reproducible sessions started without one.
pub fn draw_master_seed() -> u64 {
    rand::thread_rng().next_u64()
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn draw(rng: &mut ChaCha8Rng) -> Vec<u32> {
        (0..4).map(|_| rng.gen_range(0..1_000_000)).collect()
    }

    #[test]
    fn test_same_seed_same_stream() {
        let seed = StreamSeed::new(42);
        assert_eq!(draw(&mut seed.task_rng(1, 3)), draw(&mut seed.task_rng(1, 3)));
    }

    #[test]
    fn test_streams_differ_per_task_and_call() {
        let seed = StreamSeed::new(42);
        let base = draw(&mut seed.task_rng(1, 1));
        assert_ne!(base, draw(&mut seed.task_rng(1, 2)));
        assert_ne!(base, draw(&mut seed.task_rng(2, 1)));
        assert_ne!(base, draw(&mut StreamSeed::new(43).task_rng(1, 1)));
    }

    #[test]
    fn test_nested_calls_are_numbered_per_task() {
        let seed = StreamSeed::new(7);
        assert!(next_nested_call().is_none());
        {
            let _outer = TaskScope::enter(Some(seed.nested(1, 1)));
            let (first_seed, first) = next_nested_call().unwrap();
            assert_eq!(first, 1);
            {
                let _inner = TaskScope::enter(Some(first_seed.nested(first, 1)));
                assert_eq!(next_nested_call().unwrap().1, 1);
            }
            let (second_seed, second) = next_nested_call().unwrap();
            assert_eq!(second, 2);
            assert_eq!(first_seed, second_seed);
            {
                let _unseeded = TaskScope::enter(None);
                assert!(next_nested_call().is_none());
            }
        }
        assert!(next_nested_call().is_none());
        assert_ne!(seed.nested(1, 1), seed.nested(1, 2));
        assert_ne!(seed.sequential(), seed);
    }

    #[test]
    fn test_unseeded_streams_are_fresh() {
        let a = draw(&mut task_rng(None, 1, 1));
        let b = draw(&mut task_rng(None, 1, 1));
        assert_ne!(a, b);
    }
}
