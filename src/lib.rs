//! Multi-threaded task scheduler core for an operational daemon that
//! repeatedly runs long-lived, zone-bound housekeeping jobs (rolling
//! cryptographic material, re-signing data, and the like).
//!
//! Four subsystems, in dependency order:
//! - [`duration`]: ISO-8601-like duration parsing and a clock source
//!   that can be overridden for deterministic tests.
//! - [`crash`]: a process-wide worker-thread registry plus a signal
//!   handler that walks every thread's stack on a fatal signal.
//! - [`task`]: the task record — a (owner, class, type) identity, a
//!   due-time, a callback, and a handle to a shared identity mutex.
//! - [`schedule`]: the scheduler itself — two indexed views of the
//!   task set (by time, by identity), a pool of per-identity mutexes,
//!   and an append-only handler registry.
//! - [`worker`]: a fixed-size pool of threads that pop due tasks, run
//!   their callbacks, and reschedule or destroy them based on the
//!   result.
//! - [`fifoq`]: a bounded fan-out queue a task's callback can use to
//!   dispatch finer-grained subtasks to the same worker pool and
//!   block until they have all been consumed.
//!
//! Configuration parsing, DNSSEC record formatting, HSM bindings, and
//! daemon socket plumbing are out of scope — this crate only provides
//! the scheduling core those collaborators sit on top of.

pub mod crash;
pub mod duration;
pub mod error;
pub mod fifoq;
pub mod logging;
pub mod schedule;
pub mod task;
pub mod worker;

pub use error::ScheduleError;
pub use schedule::{Scheduler, SchedulerInfo};
pub use task::{Context, Task, TaskResult};
pub use worker::WorkerPool;
