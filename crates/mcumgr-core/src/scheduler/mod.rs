//! Priority task scheduler driving multi-step upgrade flows.
//!
//! One task is active at a time. A task's `start` issues work and returns;
//! the task later reports back through its [`TaskContext`], possibly from
//! another thread. The scheduler loop runs on the thread calling
//! [`TaskScheduler::run`] and is the only owner of the queue.

pub mod queue;
pub mod runner;
pub mod task;

pub use queue::TaskQueue;
pub use runner::{RunOutcome, SchedulerHandle, SchedulerObserver, TaskScheduler};
pub use task::{Task, TaskContext};
