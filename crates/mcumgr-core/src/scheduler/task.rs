//! Task contract and the reporting context handed to running tasks.

use std::sync::mpsc::Sender;

use chrono::{DateTime, Utc};
use tracing::trace;

use super::runner::Event;
use crate::error::Error;
use crate::settings::UpgradeSettings;

/// A unit of scheduled work.
///
/// `start` must return promptly. Progress and the outcome are reported
/// through the context: any number of `enqueue`/`progress` calls, then
/// exactly one of `completed` or `failed`.
pub trait Task<S>: Send {
    /// Lower runs first.
    fn priority(&self) -> u32;

    /// Flow state this task represents, if any.
    fn state(&self) -> Option<S> {
        None
    }

    fn name(&self) -> &'static str;

    /// Begin, or continue after a pause.
    fn start(&mut self, ctx: TaskContext<S>);

    fn pause(&mut self) {}

    /// Stop early. The task still acknowledges through `completed`.
    fn cancel(&mut self) {}
}

/// Reporting channel of one task activation. Cheap to clone and `Send`.
pub struct TaskContext<S> {
    task_id: u64,
    settings: UpgradeSettings,
    events: Sender<Event<S>>,
}

impl<S> Clone for TaskContext<S> {
    fn clone(&self) -> Self {
        Self {
            task_id: self.task_id,
            settings: self.settings,
            events: self.events.clone(),
        }
    }
}

impl<S> TaskContext<S> {
    pub(crate) fn new(task_id: u64, settings: UpgradeSettings, events: Sender<Event<S>>) -> Self {
        Self {
            task_id,
            settings,
            events,
        }
    }

    pub fn settings(&self) -> UpgradeSettings {
        self.settings
    }

    /// Schedule follow-on work.
    pub fn enqueue(&self, task: Box<dyn Task<S>>) {
        trace!(task = task.name(), priority = task.priority(), "Enqueue requested");
        self.send(Event::Enqueue {
            task_id: self.task_id,
            task,
        });
    }

    pub fn progress(&self, current: usize, total: usize, timestamp: DateTime<Utc>) {
        self.send(Event::Progress {
            task_id: self.task_id,
            current,
            total,
            timestamp,
        });
    }

    pub fn completed(&self) {
        self.send(Event::Completed {
            task_id: self.task_id,
        });
    }

    pub fn failed(&self, error: Error) {
        self.send(Event::Failed {
            task_id: self.task_id,
            error,
        });
    }

    fn send(&self, event: Event<S>) {
        // A closed channel means the run is over; late reports are dropped.
        let _ = self.events.send(event);
    }
}
