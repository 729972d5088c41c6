//! A bounded, order-preserving, fail-fast task dispatcher.
//!
//! A fixed number of worker lanes drain a shared queue of independent tasks. Each lane
//! claims the next unclaimed task index from an atomic counter, so lanes balance
//! themselves when task durations vary. Results are reported back to the calling
//! thread over a channel tagged with the task's position and are placed into a
//! pre-sized buffer, so the returned collection always matches the input order.
//!
//! The first task to fail, either by returning an error or by panicking, resolves the
//! whole batch with that failure. Lanes stop claiming new work once a failure has been
//! observed, but tasks that are already running are not interrupted; their results are
//! discarded.
use std::any::Any;
use std::error::Error;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// A unit of work accepted by [`BoundedDispatcher::run`]
pub type Task<T, E> = Box<dyn FnOnce() -> Result<T, E> + Send + 'static>;

#[derive(Debug, Error)]
pub enum DispatchError<E: Error + 'static> {
    #[error("Task {index} failed: {source}")]
    TaskFailed {
        index: usize,
        #[source]
        source: E,
    },
    #[error("Task {index} terminated abnormally: {message}")]
    TaskPanicked { index: usize, message: String },
    #[error("Failed to start a worker lane: {0}")]
    LaneStartFailed(#[source] io::Error),
    #[error("All worker lanes exited before task {0} reported a result")]
    LanesDisconnected(usize),
}

impl<E: Error + 'static> DispatchError<E> {
    /// The position of the task responsible for this failure, if known
    pub fn task_index(&self) -> Option<usize> {
        match self {
            Self::TaskFailed { index, .. } | Self::TaskPanicked { index, .. } => Some(*index),
            Self::LanesDisconnected(index) => Some(*index),
            Self::LaneStartFailed(_) => None,
        }
    }
}

enum Failure<E> {
    Error(E),
    Panic(String),
}

struct LaneMessage<T, E> {
    index: usize,
    outcome: Result<T, Failure<E>>,
}

struct TaskQueue<T, E> {
    slots: Vec<Mutex<Option<Task<T, E>>>>,
    next: AtomicUsize,
    aborted: AtomicBool,
}

impl<T, E> TaskQueue<T, E> {
    fn new(tasks: Vec<Task<T, E>>) -> Self {
        Self {
            slots: tasks.into_iter().map(|t| Mutex::new(Some(t))).collect(),
            next: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
        }
    }

    fn claim(&self) -> Option<(usize, Task<T, E>)> {
        if self.aborted.load(Ordering::Acquire) {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::AcqRel);
        let slot = self.slots.get(index)?;
        let task = slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()?;
        Some((index, task))
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }
}

/// Render a panic payload caught by `catch_unwind` or a thread join
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn run_lane<T, E>(lane: usize, queue: &TaskQueue<T, E>, sender: &Sender<LaneMessage<T, E>>) -> usize {
    let mut completed = 0usize;
    while let Some((index, task)) = queue.claim() {
        trace!("Lane {lane} claimed task {index}");
        let outcome = match panic::catch_unwind(AssertUnwindSafe(task)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(Failure::Error(err)),
            Err(payload) => Err(Failure::Panic(panic_message(&*payload))),
        };
        let failed = outcome.is_err();
        if failed {
            queue.abort();
        }
        if sender.send(LaneMessage { index, outcome }).is_err() {
            trace!("Lane {lane} has no one left to report to");
            break;
        }
        completed += 1;
        if failed {
            break;
        }
    }
    completed
}

/// Executes independent tasks on at most `limit` concurrent lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundedDispatcher {
    limit: usize,
}

impl BoundedDispatcher {
    /// Create a dispatcher with `limit` lanes. A limit of zero is treated as one.
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// The number of lanes that will be started for `n_tasks` tasks
    pub fn lanes_for(&self, n_tasks: usize) -> usize {
        self.limit.min(n_tasks)
    }

    /// Run every task and return their results in input order, or the first failure.
    pub fn run<T, E>(&self, tasks: Vec<Task<T, E>>) -> Result<Vec<T>, DispatchError<E>>
    where
        T: Send + 'static,
        E: Error + Send + 'static,
    {
        let n = tasks.len();
        if n == 0 {
            return Ok(Vec::new());
        }
        let lanes = self.lanes_for(n);
        debug!("Dispatching {n} tasks across {lanes} lanes");

        let queue = Arc::new(TaskQueue::new(tasks));
        let (sender, receiver) = unbounded();
        let mut handles = Vec::with_capacity(lanes);
        for lane in 0..lanes {
            let lane_queue = Arc::clone(&queue);
            let sender = sender.clone();
            let handle = thread::Builder::new()
                .name(format!("glycoscreen-lane-{lane}"))
                .spawn(move || run_lane(lane, &lane_queue, &sender));
            match handle {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    queue.abort();
                    return Err(DispatchError::LaneStartFailed(e));
                }
            }
        }
        drop(sender);

        let mut results: Vec<Option<T>> = (0..n).map(|_| None).collect();
        let mut received = 0usize;
        while received < n {
            match receiver.recv() {
                Ok(LaneMessage { index, outcome }) => match outcome {
                    Ok(value) => {
                        results[index] = Some(value);
                        received += 1;
                    }
                    Err(failure) => {
                        queue.abort();
                        // Lanes still running are left to finish on their own, their
                        // results go nowhere once the receiver is dropped.
                        return Err(match failure {
                            Failure::Error(source) => {
                                warn!("Task {index} failed, aborting batch of {n}");
                                DispatchError::TaskFailed { index, source }
                            }
                            Failure::Panic(message) => {
                                warn!("Task {index} panicked, aborting batch of {n}");
                                DispatchError::TaskPanicked { index, message }
                            }
                        });
                    }
                },
                Err(_) => {
                    let missing = results.iter().position(|r| r.is_none()).unwrap_or(n);
                    return Err(DispatchError::LanesDisconnected(missing));
                }
            }
        }

        for handle in handles {
            match handle.join() {
                Ok(completed) => trace!("Lane finished after {completed} tasks"),
                Err(e) => warn!("Failed to join worker lane: {e:?}"),
            }
        }

        results
            .into_iter()
            .enumerate()
            .map(|(i, r)| r.ok_or(DispatchError::LanesDisconnected(i)))
            .collect()
    }
}

impl Default for BoundedDispatcher {
    fn default() -> Self {
        let limit = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(limit)
    }
}

/// Run `tasks` on at most `limit` lanes, see [`BoundedDispatcher::run`]
pub fn run_bounded<T, E>(tasks: Vec<Task<T, E>>, limit: usize) -> Result<Vec<T>, DispatchError<E>>
where
    T: Send + 'static,
    E: Error + Send + 'static,
{
    BoundedDispatcher::new(limit).run(tasks)
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::time::Duration;

    use super::*;

    fn jitter(i: usize) -> Duration {
        Duration::from_millis(((i * 7919) % 13) as u64)
    }

    fn make_tasks(n: usize) -> Vec<Task<usize, io::Error>> {
        (0..n)
            .map(|i| -> Task<usize, io::Error> {
                Box::new(move || {
                    thread::sleep(jitter(i));
                    Ok(i * 10)
                })
            })
            .collect()
    }

    #[test_log::test]
    fn test_order_preserved() -> Result<(), DispatchError<io::Error>> {
        let n = 9;
        for limit in 1..=n {
            let results = run_bounded(make_tasks(n), limit)?;
            let expected: Vec<_> = (0..n).map(|i| i * 10).collect();
            assert_eq!(results, expected, "limit {limit}");
        }
        Ok(())
    }

    #[test]
    fn test_concurrency_bound() -> Result<(), DispatchError<io::Error>> {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<Task<usize, io::Error>> = (0..5)
            .map(|i| -> Task<usize, io::Error> {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                Box::new(move || {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20) + jitter(i));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(i)
                })
            })
            .collect();
        let results = run_bounded(tasks, 2)?;
        assert_eq!(results, vec![0, 1, 2, 3, 4]);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn test_fail_fast() {
        let tasks: Vec<Task<usize, io::Error>> = (0..6)
            .map(|i| -> Task<usize, io::Error> {
                Box::new(move || {
                    thread::sleep(jitter(i));
                    if i == 3 {
                        Err(io::Error::new(io::ErrorKind::Other, "engine exploded"))
                    } else {
                        Ok(i)
                    }
                })
            })
            .collect();
        match run_bounded(tasks, 3) {
            Ok(results) => panic!("Expected a failure, got {results:?}"),
            Err(DispatchError::TaskFailed { index, source }) => {
                assert_eq!(index, 3);
                assert_eq!(source.to_string(), "engine exploded");
            }
            Err(e) => panic!("Unexpected error {e}"),
        }
    }

    #[test]
    fn test_panic_is_a_failure() {
        let tasks: Vec<Task<usize, io::Error>> = (0..4)
            .map(|i| -> Task<usize, io::Error> {
                Box::new(move || {
                    if i == 1 {
                        panic!("lane went down");
                    }
                    Ok(i)
                })
            })
            .collect();
        let err = run_bounded(tasks, 2).unwrap_err();
        assert_eq!(err.task_index(), Some(1));
        match err {
            DispatchError::TaskPanicked { message, .. } => {
                assert!(message.contains("lane went down"))
            }
            e => panic!("Unexpected error {e}"),
        }
    }

    #[test]
    fn test_empty_and_zero_limit() -> Result<(), DispatchError<io::Error>> {
        let results = run_bounded(make_tasks(0), 4)?;
        assert!(results.is_empty());

        let dispatcher = BoundedDispatcher::new(0);
        assert_eq!(dispatcher.limit(), 1);
        assert_eq!(dispatcher.run(make_tasks(3))?, vec![0, 10, 20]);
        Ok(())
    }

    #[test]
    fn test_tasks_run_on_lanes() -> Result<(), DispatchError<io::Error>> {
        let caller = thread::current().id();
        let tasks: Vec<Task<(thread::ThreadId, Option<String>), io::Error>> = (0..8)
            .map(|i| -> Task<(thread::ThreadId, Option<String>), io::Error> {
                Box::new(move || {
                    thread::sleep(jitter(i));
                    let current = thread::current();
                    Ok((current.id(), current.name().map(String::from)))
                })
            })
            .collect();
        let results = run_bounded(tasks, 3)?;
        let lanes: HashSet<_> = results.iter().map(|(id, _)| *id).collect();
        assert!(!lanes.contains(&caller));
        assert!(lanes.len() <= 3);
        assert!(results
            .iter()
            .all(|(_, name)| name.as_deref().is_some_and(|n| n.starts_with("glycoscreen-lane-"))));
        Ok(())
    }
}
