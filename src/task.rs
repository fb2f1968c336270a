//! Task records.
//!
//! A task is uniquely identified by its **t-tuple**: `(owner, class,
//! type)`. `owner` is usually the zone a task is for; `class`
//! distinguishes which collaborator produced it (`enforcer` vs
//! `signer`); `type` is the specific job (`resalt`, `sign`, ...).
//!
//! `due_time` is a Unix timestamp. Anything at or before `now()` means
//! "run as soon as a worker is free". [`WHENEVER`] is a sentinel
//! meaning "never schedule this task" that compares equal to any other
//! due time, mirroring `schedule_WHENEVER` in the original.

use std::any::Any;
use std::sync::{Arc, Mutex};

use crate::fifoq::FifoQueue;
use crate::fifoq::SubtaskItem;

/// Sentinel due-time: never becomes due, and compares equal to every
/// other due-time in [`Task::cmp_time_then_ttuple`].
pub const WHENEVER: i64 = -1;

/// Sentinel t-tuple component: matches any other string in
/// [`Task::cmp_ttuple`]. Used to build wildcard lookups such as
/// `unschedule_all_of`.
pub const WHATEVER: &str = "[any]";

pub const TASK_CLASS_ENFORCER: &str = "enforcer";
pub const TASK_CLASS_SIGNER: &str = "signer";

pub const TASK_TYPE_ENFORCE: &str = "enforce";
pub const TASK_TYPE_RESALT: &str = "resalt";
pub const TASK_TYPE_HSMKEYGEN: &str = "hsmkeygen";
pub const TASK_TYPE_DSSUBMIT: &str = "dssubmit";
pub const TASK_TYPE_DSRETRACT: &str = "dsretract";
pub const TASK_TYPE_SIGNCONF: &str = "signconf";

/// What a task's callback asks the scheduler to do next.
#[derive(Debug)]
pub enum TaskResult {
    /// Don't reschedule; the task is destroyed.
    Success,
    /// Retry with (growing) backoff.
    Defer,
    /// Don't reschedule; the task is destroyed.
    Failed,
    /// Reschedule for right now, and reset backoff.
    Promptly,
    /// Reschedule at this absolute Unix time, and reset backoff.
    At(i64),
}

/// Magic return codes accepted at the FFI-ish boundary for
/// collaborators that prefer to hand back a raw `i64`, matching
/// `schedule_PROMPTLY` et al. bit-exactly.
pub const PROMPTLY: i64 = 1;
pub const IMMEDIATELY: i64 = 0;
pub const SUCCESS: i64 = -1;
pub const DEFER: i64 = -2;
pub const FAILED: i64 = -3;

impl TaskResult {
    /// Convert a raw `i64` return code into a `TaskResult`, following
    /// `schedule.h`'s magic constants: any value `>= 0` other than
    /// `IMMEDIATELY` is a literal absolute due-time.
    pub fn from_code(code: i64) -> TaskResult {
        match code {
            SUCCESS => TaskResult::Success,
            DEFER => TaskResult::Defer,
            FAILED => TaskResult::Failed,
            PROMPTLY => TaskResult::Promptly,
            IMMEDIATELY => TaskResult::At(0),
            other if other >= 0 => TaskResult::At(other),
            _ => TaskResult::Failed,
        }
    }
}

/// Opaque, owned task payload. Its `Drop` implementation is the
/// equivalent of the C struct's `freedata` function pointer — the
/// scheduler never has to be told separately how to free it.
pub type UserData = Box<dyn Any + Send>;

/// Context handed to a task's callback: the worker executing it, plus
/// a handle to the scheduler's sign queue for fan-out.
pub struct Context {
    pub worker_id: usize,
    pub signq: Arc<FifoQueue<SubtaskItem>>,
}

pub type Callback =
    Box<dyn FnMut(&Task, &str, &mut UserData, &Context) -> TaskResult + Send>;

/// A task record: its identity, due time, callback, payload, and a
/// handle to the mutex shared by every task that has ever existed with
/// the same t-tuple.
pub struct Task {
    pub owner: String,
    pub class: String,
    pub kind: String,
    pub due_time: i64,
    pub callback: Option<Callback>,
    pub userdata: Option<UserData>,
    pub backoff: i64,
    /// Shared by every task with this t-tuple; created lazily by the
    /// scheduler on first schedule and never destroyed before
    /// `Scheduler::cleanup`.
    pub lock: Option<Arc<Mutex<()>>>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("owner", &self.owner)
            .field("class", &self.class)
            .field("kind", &self.kind)
            .field("due_time", &self.due_time)
            .finish()
    }
}

impl Task {
    pub fn new(
        owner: impl Into<String>,
        class: impl Into<String>,
        kind: impl Into<String>,
        callback: Callback,
        userdata: Option<UserData>,
        due_time: i64,
    ) -> Task {
        Task {
            owner: owner.into(),
            class: class.into(),
            kind: kind.into(),
            due_time,
            callback: Some(callback),
            userdata,
            backoff: 0,
            lock: None,
        }
    }

    /// A task with no callback/userdata/lock, carrying only the
    /// identity triple. Used by the scheduler to populate the
    /// identity-mutex pool and to build wildcard lookup keys.
    pub fn duplicate_shallow(&self) -> Task {
        Task {
            owner: self.owner.clone(),
            class: self.class.clone(),
            kind: self.kind.clone(),
            due_time: self.due_time,
            callback: None,
            userdata: None,
            backoff: 0,
            lock: None,
        }
    }

    /// Lexicographic compare over `(type, class, owner)`. [`WHATEVER`]
    /// matches any value on either side, enabling wildcard unschedule.
    pub fn cmp_ttuple(&self, other: &Task) -> std::cmp::Ordering {
        cmp_field(&self.kind, &other.kind)
            .then_with(|| cmp_field(&self.class, &other.class))
            .then_with(|| cmp_field(&self.owner, &other.owner))
    }

    /// Primary key is `due_time`, ties broken by t-tuple. [`WHENEVER`]
    /// compares equal to any other due time.
    pub fn cmp_time_then_ttuple(&self, other: &Task) -> std::cmp::Ordering {
        cmp_time(self.due_time, other.due_time).then_with(|| self.cmp_ttuple(other))
    }

    /// Human-readable one-liner, mirroring `schedule_describetask`.
    pub fn describe(&self, now: i64) -> String {
        let when = if self.due_time < now { now } else { self.due_time };
        let entity = if self.kind == TASK_TYPE_RESALT {
            "policy"
        } else {
            "zone"
        };
        format!(
            "On {} I will {} {} {}",
            crate::duration::format_unix(when),
            self.kind,
            entity,
            self.owner
        )
    }
}

fn cmp_field(a: &str, b: &str) -> std::cmp::Ordering {
    if a == WHATEVER || b == WHATEVER {
        std::cmp::Ordering::Equal
    } else {
        a.cmp(b)
    }
}

fn cmp_time(a: i64, b: i64) -> std::cmp::Ordering {
    if a == WHENEVER || b == WHENEVER {
        std::cmp::Ordering::Equal
    } else {
        a.cmp(&b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(owner: &str, class: &str, kind: &str, due: i64) -> Task {
        Task {
            owner: owner.to_string(),
            class: class.to_string(),
            kind: kind.to_string(),
            due_time: due,
            callback: None,
            userdata: None,
            backoff: 0,
            lock: None,
        }
    }

    #[test]
    fn ttuple_equality_is_lexicographic() {
        let a = flat("z1", "enforcer", "resalt", 10);
        let b = flat("z1", "enforcer", "resalt", 20);
        assert_eq!(a.cmp_ttuple(&b), std::cmp::Ordering::Equal);
    }

    #[test]
    fn whatever_matches_any_owner() {
        let wildcard = flat(WHATEVER, "enforcer", "resalt", WHENEVER);
        let concrete = flat("z9", "enforcer", "resalt", 5);
        assert_eq!(wildcard.cmp_ttuple(&concrete), std::cmp::Ordering::Equal);
    }

    #[test]
    fn whenever_matches_any_due_time() {
        let a = flat("z1", "enforcer", "resalt", WHENEVER);
        let b = flat("z1", "enforcer", "resalt", 42);
        assert_eq!(a.cmp_time_then_ttuple(&b), std::cmp::Ordering::Equal);
    }

    #[test]
    fn code_translation_matches_constants() {
        assert!(matches!(TaskResult::from_code(SUCCESS), TaskResult::Success));
        assert!(matches!(TaskResult::from_code(DEFER), TaskResult::Defer));
        assert!(matches!(TaskResult::from_code(FAILED), TaskResult::Failed));
        assert!(matches!(TaskResult::from_code(PROMPTLY), TaskResult::Promptly));
        assert!(matches!(TaskResult::from_code(IMMEDIATELY), TaskResult::At(0)));
        assert!(matches!(TaskResult::from_code(12345), TaskResult::At(12345)));
    }
}
