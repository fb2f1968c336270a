//! The scheduler core: two indexed views of the same task set (by due
//! time, by identity), a lazily-grown pool of per-t-tuple mutexes, and
//! an append-only handler registry.
//!
//! Lock ordering: this module's own mutex is the *outer* lock. It is
//! never held while calling into [`crate::fifoq::FifoQueue`], and never
//! held across a task callback. The identity mutex attached to a
//! popped [`Task`] is acquired by the worker pool, not by anything in
//! this module.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::duration;
use crate::error::ScheduleError;
use crate::fifoq::{FifoQueue, SubtaskItem, FIFOQ_MAX_COUNT};
use crate::task::{Task, TaskResult, TASK_CLASS_ENFORCER, WHATEVER, WHENEVER};

/// A task's identity, used as the key of both the identity index and
/// the mutex pool.
type TTupleKey = (String, String, String); // (kind, class, owner)

fn key_of(task: &Task) -> TTupleKey {
    (task.kind.clone(), task.class.clone(), task.owner.clone())
}

fn matches_field(pattern: &str, value: &str) -> bool {
    pattern == WHATEVER || pattern == value
}

/// Maps `WHENEVER` to the far future so the by-time index can use
/// ordinary total ordering while still never surfacing the task to
/// `pop_due`.
fn effective_time(due: i64) -> i64 {
    if due == WHENEVER {
        i64::MAX
    } else {
        due
    }
}

/// A `(class, type)` to callback mapping, used by
/// [`Scheduler::schedule_with_handler`].
pub type HandlerFn =
    dyn Fn(&Task, &str, &mut crate::task::UserData, &crate::task::Context) -> TaskResult
        + Send
        + Sync;

#[derive(Clone)]
struct HandlerEntry {
    class: String,
    kind: String,
    callback: Arc<HandlerFn>,
}

/// Non-blocking snapshot returned by [`Scheduler::info`]. Serializable
/// so a collaborator's status/diagnostics endpoint can hand it out as
/// JSON without a translation layer in this crate.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SchedulerInfo {
    pub first_due: Option<i64>,
    pub idle_workers: i64,
    pub count: usize,
}

struct Inner {
    by_identity: HashMap<TTupleKey, Task>,
    by_time: BTreeSet<(i64, TTupleKey)>,
    mutex_pool: HashMap<TTupleKey, Arc<Mutex<()>>>,
    handlers: Vec<HandlerEntry>,
    idle_workers: i64,
}

/// Two indexed collections of tasks (by time, by identity), a pool of
/// identity-locks, a handler registry, and the bounded fan-out queue
/// workers use to hand out subtasks.
pub struct Scheduler {
    inner: Mutex<Inner>,
    cond: Condvar,
    signq: Arc<FifoQueue<SubtaskItem>>,
}

impl Scheduler {
    pub fn create() -> Arc<Scheduler> {
        Arc::new(Scheduler {
            inner: Mutex::new(Inner {
                by_identity: HashMap::new(),
                by_time: BTreeSet::new(),
                mutex_pool: HashMap::new(),
                handlers: Vec::new(),
                idle_workers: 0,
            }),
            cond: Condvar::new(),
            signq: Arc::new(FifoQueue::new(FIFOQ_MAX_COUNT)),
        })
    }

    /// The fan-out queue shared by every worker servicing this
    /// scheduler. Workers wrap this in the [`crate::task::Context`]
    /// they hand to callbacks.
    pub fn signq(&self) -> Arc<FifoQueue<SubtaskItem>> {
        Arc::clone(&self.signq)
    }

    /// Insert `task`. If its t-tuple is already present: with
    /// `replace = false` the task is handed back in the error so the
    /// caller remains its owner; with `replace = true` the existing
    /// entry's due-time becomes the minimum of the two, its userdata
    /// is replaced by the incoming task's, and the incoming task is
    /// dropped (its userdata already taken, so nothing is
    /// double-freed). Its callback is left untouched by a replace —
    /// only the due-time and payload move.
    pub fn schedule(&self, mut task: Task, replace: bool) -> Result<(), ScheduleError> {
        let key = key_of(&task);
        let mut inner = self.inner.lock().unwrap();

        if let Some(existing) = inner.by_identity.get_mut(&key) {
            if !replace {
                drop(inner);
                return Err(ScheduleError::AlreadyPresent(task));
            }
            let old_effective = effective_time(existing.due_time);
            let new_due = min_due(existing.due_time, task.due_time);
            inner.by_time.remove(&(old_effective, key.clone()));
            let existing = inner.by_identity.get_mut(&key).unwrap();
            existing.due_time = new_due;
            existing.userdata = task.userdata.take();
            inner.by_time.insert((effective_time(new_due), key));
            self.cond.notify_all();
            return Ok(());
        }

        let lock = match task.lock.clone() {
            Some(lock) => {
                inner.mutex_pool.insert(key.clone(), Arc::clone(&lock));
                lock
            }
            None => Arc::clone(
                inner
                    .mutex_pool
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            ),
        };
        task.lock = Some(lock);
        inner.by_time.insert((effective_time(task.due_time), key.clone()));
        inner.by_identity.insert(key, task);
        self.cond.notify_all();
        Ok(())
    }

    /// Remove the entry with this exact t-tuple, if any. The identity
    /// mutex stays in the pool.
    pub fn unschedule(&self, owner: &str, class: &str, kind: &str) -> Option<Task> {
        let key = (kind.to_string(), class.to_string(), owner.to_string());
        let mut inner = self.inner.lock().unwrap();
        let task = inner.by_identity.remove(&key)?;
        inner.by_time.remove(&(effective_time(task.due_time), key));
        Some(task)
    }

    /// Remove every entry matching `(kind, owner)` regardless of
    /// class; `kind`/`owner` may themselves be [`WHATEVER`] to match
    /// any value. Returns the removed tasks (the caller owns their
    /// destruction).
    pub fn unschedule_all_of(&self, kind: &str, owner: &str) -> Vec<Task> {
        let mut inner = self.inner.lock().unwrap();
        let matches: Vec<TTupleKey> = inner
            .by_identity
            .keys()
            .filter(|(k, _, o)| matches_field(kind, k) && matches_field(owner, o))
            .cloned()
            .collect();
        let mut removed = Vec::with_capacity(matches.len());
        for key in matches {
            if let Some(task) = inner.by_identity.remove(&key) {
                inner.by_time.remove(&(effective_time(task.due_time), key));
                removed.push(task);
            }
        }
        removed
    }

    /// If the earliest entry is due, remove and return it. Otherwise
    /// increment the idle-worker counter, wait on the condition once
    /// with a timeout clamped to `[lower, 3600]` seconds (`lower` is 0
    /// for `enforcer` tasks, 60 otherwise; 0 outright if a clock leap
    /// was observed, in which case the leap flag is cleared here so it
    /// skips exactly one wait rather than every subsequent one),
    /// decrement the counter, and return `None`.
    pub fn pop_due(&self) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap();
        let now = duration::now();

        if let Some((time, key)) = inner.by_time.iter().next().cloned() {
            if time <= now {
                inner.by_time.remove(&(time, key.clone()));
                return inner.by_identity.remove(&key);
            }

            let lower: i64 = if inner
                .by_identity
                .get(&key)
                .map(|t| t.class.as_str() == TASK_CLASS_ENFORCER)
                .unwrap_or(false)
            {
                0
            } else {
                60
            };
            let wait_secs = if duration::time_leaped() {
                duration::clear_leap();
                0
            } else {
                (time - now).clamp(lower, 3600)
            };
            inner.idle_workers += 1;
            let (guard, _) = self
                .cond
                .wait_timeout(inner, Duration::from_secs(wait_secs as u64))
                .unwrap();
            inner = guard;
            inner.idle_workers -= 1;
            None
        } else {
            let wait_secs: u64 = if duration::time_leaped() {
                duration::clear_leap();
                0
            } else {
                3600
            };
            inner.idle_workers += 1;
            let (guard, _) = self
                .cond
                .wait_timeout(inner, Duration::from_secs(wait_secs))
                .unwrap();
            inner = guard;
            inner.idle_workers -= 1;
            None
        }
    }

    /// Remove and return the earliest entry unconditionally, whatever
    /// its due-time. Used by test hooks that simulate a time leap.
    pub fn pop_first(&self) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap();
        let (time, key) = inner.by_time.iter().next().cloned()?;
        inner.by_time.remove(&(time, key.clone()));
        inner.by_identity.remove(&key)
    }

    /// Set every future-due entry's due-time to now, preserving the
    /// by-time ordering invariant via remove-then-reinsert. Entries
    /// whose due-time is the `WHENEVER` sentinel are left untouched —
    /// flushing must not be able to make a "never" task due.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        let now = duration::now();
        let due_for_flush: Vec<(i64, TTupleKey)> = inner
            .by_time
            .iter()
            .filter(|(time, _)| *time > now && *time != i64::MAX)
            .cloned()
            .collect();
        for (time, key) in due_for_flush {
            inner.by_time.remove(&(time, key.clone()));
            if let Some(task) = inner.by_identity.get_mut(&key) {
                task.due_time = now;
            }
            inner.by_time.insert((now, key));
        }
        self.cond.notify_all();
    }

    /// Remove and destroy every entry in all three indices (by-time,
    /// by-identity, mutex pool).
    pub fn purge(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.by_identity.clear();
        inner.by_time.clear();
        inner.mutex_pool.clear();
    }

    /// Remove and destroy every entry matching `(class, owner)`; class
    /// or owner may be [`WHATEVER`]. Collects matches first, then
    /// deletes, so the removal doesn't invalidate its own iteration.
    pub fn purge_owner(&self, class: &str, owner: &str) {
        let mut inner = self.inner.lock().unwrap();
        let matches: Vec<TTupleKey> = inner
            .by_identity
            .iter()
            .filter(|(_, t)| matches_field(class, &t.class) && matches_field(owner, &t.owner))
            .map(|(k, _)| k.clone())
            .collect();
        for key in matches {
            if let Some(task) = inner.by_identity.remove(&key) {
                inner.by_time.remove(&(effective_time(task.due_time), key));
            }
        }
    }

    /// Caller must have already stopped every worker. Destroys every
    /// registered task, every identity mutex, and the handler
    /// registry.
    pub fn cleanup(&self) {
        self.purge();
        let mut inner = self.inner.lock().unwrap();
        inner.handlers.clear();
    }

    /// Non-blocking snapshot: the earliest due-time (if any), the
    /// number of workers currently idle in `pop_due`, and the total
    /// task count.
    pub fn info(&self) -> SchedulerInfo {
        let inner = self.inner.lock().unwrap();
        let first_due = inner
            .by_time
            .iter()
            .next()
            .and_then(|(_, key)| inner.by_identity.get(key))
            .map(|t| t.due_time);
        SchedulerInfo {
            first_due,
            idle_workers: inner.idle_workers,
            count: inner.by_identity.len(),
        }
    }

    /// Broadcast both this scheduler's condition and the fan-out
    /// queue's, so every blocked worker wakes. Used at shutdown.
    pub fn release_all(&self) {
        self.cond.notify_all();
        self.signq.notify_all();
    }

    /// Append `(class, kind, callback)` to the handler list. Expected
    /// to be called only during startup, before any worker runs.
    pub fn register_handler(
        &self,
        class: impl Into<String>,
        kind: impl Into<String>,
        callback: Arc<HandlerFn>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.handlers.push(HandlerEntry {
            class: class.into(),
            kind: kind.into(),
            callback,
        });
    }

    /// Look up a handler by `kind` (first match wins), build a task
    /// from it using the handler's class and callback, attach
    /// `resource_mutex` as the task's identity mutex (bypassing the
    /// pool, though it is still recorded there for future lookups),
    /// and schedule it with `replace = false`.
    pub fn schedule_with_handler(
        &self,
        kind: impl Into<String>,
        owner: impl Into<String>,
        userdata: crate::task::UserData,
        resource_mutex: Arc<Mutex<()>>,
        when: i64,
    ) -> Result<(), ScheduleError> {
        let kind = kind.into();
        let entry = {
            let inner = self.inner.lock().unwrap();
            inner
                .handlers
                .iter()
                .find(|h| h.kind == kind)
                .cloned()
                .ok_or_else(|| {
                    ScheduleError::invalid_argument(format!(
                        "no handler registered for type {}",
                        kind
                    ))
                })?
        };
        let handler_cb = Arc::clone(&entry.callback);
        let callback: crate::task::Callback =
            Box::new(move |task, owner, ud, ctx| (handler_cb)(task, owner, ud, ctx));
        let mut task = Task::new(owner, entry.class, kind, callback, Some(userdata), when);
        task.lock = Some(resource_mutex);
        self.schedule(task, false)
    }
}

fn min_due(a: i64, b: i64) -> i64 {
    match (a == WHENEVER, b == WHENEVER) {
        (true, true) => WHENEVER,
        (true, false) => b,
        (false, true) => a,
        (false, false) => a.min(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TASK_CLASS_ENFORCER, TASK_TYPE_RESALT};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop_task(owner: &str, class: &str, kind: &str, due: i64) -> Task {
        Task::new(owner, class, kind, Box::new(|_, _, _, _| TaskResult::Success), None, due)
    }

    #[test]
    fn fresh_schedule_then_pop_first_round_trips() {
        let s = Scheduler::create();
        s.schedule(noop_task("z1", TASK_CLASS_ENFORCER, TASK_TYPE_RESALT, 0), false)
            .unwrap();
        let info = s.info();
        assert_eq!(info.count, 1);
        let popped = s.pop_first().unwrap();
        assert_eq!(popped.owner, "z1");
        assert_eq!(s.info().count, 0);
    }

    #[test]
    fn duplicate_without_replace_is_rejected() {
        let s = Scheduler::create();
        s.schedule(noop_task("z", TASK_CLASS_ENFORCER, "sign", 100), false)
            .unwrap();
        let err = s
            .schedule(noop_task("z", TASK_CLASS_ENFORCER, "sign", 50), false)
            .unwrap_err();
        assert!(matches!(err, ScheduleError::AlreadyPresent(_)));
        assert_eq!(s.info().count, 1);
    }

    #[test]
    fn duplicate_with_replace_keeps_minimum_due_time_and_new_userdata() {
        let s = Scheduler::create();
        s.schedule(noop_task("z", TASK_CLASS_ENFORCER, "sign", 100), false)
            .unwrap();
        let mut b = noop_task("z", TASK_CLASS_ENFORCER, "sign", 50);
        b.userdata = Some(Box::new(99u32));
        s.schedule(b, true).unwrap();

        let task = s.pop_first().unwrap();
        assert_eq!(task.due_time, 50);
        assert_eq!(*task.userdata.unwrap().downcast::<u32>().unwrap(), 99);
    }

    #[test]
    fn whenever_task_is_never_popped_by_pop_due() {
        let s = Scheduler::create();
        s.schedule(noop_task("z", TASK_CLASS_ENFORCER, "sign", WHENEVER), false)
            .unwrap();
        s.flush();
        assert_eq!(s.info().count, 1);
        let info = s.info();
        assert_eq!(info.first_due, Some(WHENEVER));
    }

    #[test]
    fn flush_makes_future_tasks_due_now() {
        let s = Scheduler::create();
        let now = duration::now();
        s.schedule(noop_task("z", TASK_CLASS_ENFORCER, "sign", now + 600), false)
            .unwrap();
        s.flush();
        let popped = s.pop_due().expect("task should now be due");
        assert!(popped.due_time <= duration::now());
    }

    #[test]
    fn unschedule_all_of_matches_wildcard_class() {
        let s = Scheduler::create();
        s.schedule(noop_task("z", "enforcer", "resalt", 0), false).unwrap();
        s.schedule(noop_task("z", "signer", "resalt", 0), false).unwrap();
        s.schedule(noop_task("other", "enforcer", "resalt", 0), false).unwrap();

        let removed = s.unschedule_all_of("resalt", "z");
        assert_eq!(removed.len(), 2);
        assert_eq!(s.info().count, 1);
    }

    #[test]
    fn handler_registry_builds_and_schedules_task() {
        let s = Scheduler::create();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        s.register_handler(
            TASK_CLASS_ENFORCER,
            TASK_TYPE_RESALT,
            Arc::new(move |_, _, _, _| {
                calls2.fetch_add(1, Ordering::SeqCst);
                TaskResult::Success
            }),
        );
        s.schedule_with_handler(
            TASK_TYPE_RESALT,
            "z1",
            Box::new(()),
            Arc::new(Mutex::new(())),
            0,
        )
        .unwrap();

        let mut task = s.pop_due().expect("task should be due immediately");
        let ctx = crate::task::Context { worker_id: 0, signq: s.signq() };
        let mut callback = task.callback.take().unwrap();
        let mut ud = task.userdata.take().unwrap();
        let owner = task.owner.clone();
        let result = callback(&task, &owner, &mut ud, &ctx);
        assert!(matches!(result, TaskResult::Success));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn info_snapshot_round_trips_through_json() {
        let s = Scheduler::create();
        s.schedule(noop_task("z", TASK_CLASS_ENFORCER, TASK_TYPE_RESALT, 42), false)
            .unwrap();
        let info = s.info();
        let encoded = serde_json::to_string(&info).unwrap();
        let decoded: SchedulerInfo = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.first_due, info.first_due);
        assert_eq!(decoded.count, info.count);
    }
}
