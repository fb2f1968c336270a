//! Bounded fan-out queue ("sign queue").
//!
//! A worker executing a "big" task can hand out finer-grained subtasks
//! through this queue and then synchronously wait until all of them
//! have been consumed and reported back. Mirrors
//! `common/scheduler/fifoq.h`'s struct shape (a fixed-size ring plus
//! one mutex and two condition variables) even though the `.c` body
//! was not present in the retrieved source: the operation contracts
//! below come from spec.md §4.F and the invariants in spec.md §8
//! (I4, I5).
//!
//! No operation holds the queue's lock across a user callback.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};

use crate::error::ScheduleError;

/// Fixed capacity for the queue, matching `FIFOQ_MAX_COUNT` in the
/// original.
pub const FIFOQ_MAX_COUNT: usize = 1000;
/// Retry budget for `push`, matching `FIFOQ_TRIES_COUNT`.
pub const FIFOQ_TRIES_COUNT: usize = 10;

/// Identifies the worker that owns a batch of subtasks. Stands in for
/// the `void* worker` pointer identity used by the original; any
/// worker-unique value works (the worker pool uses its thread index).
pub type WorkerId = usize;

/// Opaque subtask payload handed through the queue, mirroring the
/// `(item, owner-worker)` blob pairs the original stores — the queue
/// never inspects `item`, only moves it.
pub type SubtaskItem = Box<dyn std::any::Any + Send>;

/// Outcome of a single subtask, reported back through [`FifoQueue::report`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtaskStatus {
    Success,
    Failure,
}

struct State<T> {
    items: VecDeque<(T, WorkerId)>,
    capacity: usize,
    completed: HashMap<WorkerId, u64>,
    failed: HashMap<WorkerId, u64>,
}

/// A fixed-capacity FIFO queue used to fan out subtasks to worker
/// threads and later block until they have all been consumed.
pub struct FifoQueue<T> {
    state: Mutex<State<T>>,
    not_full: Condvar,
    threshold: Condvar,
}

impl<T> FifoQueue<T> {
    pub fn new(capacity: usize) -> Self {
        FifoQueue {
            state: Mutex::new(State {
                items: VecDeque::new(),
                capacity,
                completed: HashMap::new(),
                failed: HashMap::new(),
            }),
            not_full: Condvar::new(),
            threshold: Condvar::new(),
        }
    }

    /// Push `item` on behalf of `owner`. `tries` is an in/out retry
    /// counter the caller owns across its own retry loop (start a
    /// fresh push attempt at `*tries = 0`): if the queue is full and
    /// the budget (`FIFOQ_TRIES_COUNT`) is already spent, returns
    /// [`ScheduleError::ResourceExhausted`] immediately without
    /// blocking — the caller is expected to drain with
    /// [`FifoQueue::wait_for`] and retry with a reset counter.
    /// Otherwise waits on the "not-full" condition, incrementing
    /// `*tries` on every wakeup, until there is room or the budget is
    /// exhausted.
    pub fn push(&self, item: T, owner: WorkerId, tries: &mut usize) -> Result<(), ScheduleError> {
        let mut state = self.state.lock().unwrap();
        while state.items.len() >= state.capacity {
            if *tries >= FIFOQ_TRIES_COUNT {
                return Err(ScheduleError::ResourceExhausted);
            }
            state = self.not_full.wait(state).unwrap();
            *tries += 1;
        }
        state.items.push_back((item, owner));
        self.threshold.notify_all();
        Ok(())
    }

    /// Pop the next item, blocking while the queue is empty. Returns
    /// `None` only when woken by [`FifoQueue::notify_all`] with the
    /// queue still empty (used to unblock consumers at shutdown).
    pub fn pop(&self) -> Option<(T, WorkerId)> {
        let mut state = self.state.lock().unwrap();
        while state.items.is_empty() {
            state = self.threshold.wait(state).unwrap();
            if state.items.is_empty() {
                return None;
            }
        }
        let item = state.items.pop_front();
        self.not_full.notify_all();
        item
    }

    /// Called by a consumer when a subtask completes. Increments
    /// `owner`'s completed-subtasks counter (and failed counter, if
    /// `status` is a failure), then signals the threshold condition.
    pub fn report(&self, owner: WorkerId, status: SubtaskStatus) {
        let mut state = self.state.lock().unwrap();
        *state.completed.entry(owner).or_insert(0) += 1;
        if status == SubtaskStatus::Failure {
            *state.failed.entry(owner).or_insert(0) += 1;
        }
        self.threshold.notify_all();
    }

    /// Block until `owner`'s completed-subtasks counter reaches
    /// `expected`, i.e. until `expected` `report` calls have been made
    /// for it. Returns the number of those that were reported as
    /// failures, and resets both counters to zero.
    pub fn wait_for(&self, owner: WorkerId, expected: u64) -> u64 {
        let mut state = self.state.lock().unwrap();
        loop {
            let completed = *state.completed.get(&owner).unwrap_or(&0);
            if completed >= expected {
                break;
            }
            state = self.threshold.wait(state).unwrap();
        }
        let failed = state.failed.remove(&owner).unwrap_or(0);
        state.completed.remove(&owner);
        failed
    }

    /// Current number of items in the queue.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake every thread blocked in `push` or `pop`/`wait_for`. Used at
    /// shutdown so no wait is indefinite.
    pub fn notify_all(&self) {
        let _state = self.state.lock().unwrap();
        self.not_full.notify_all();
        self.threshold.notify_all();
    }
}

impl<T> Default for FifoQueue<T> {
    fn default() -> Self {
        FifoQueue::new(FIFOQ_MAX_COUNT)
    }
}
