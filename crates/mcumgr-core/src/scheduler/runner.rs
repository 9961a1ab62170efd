//! The scheduler loop.

use std::sync::mpsc::{Receiver, Sender, channel};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::queue::TaskQueue;
use super::task::{Task, TaskContext};
use crate::error::Error;
use crate::settings::UpgradeSettings;

/// Everything that can happen to a run.
pub(crate) enum Event<S> {
    Enqueue {
        task_id: u64,
        task: Box<dyn Task<S>>,
    },
    Progress {
        task_id: u64,
        current: usize,
        total: usize,
        timestamp: DateTime<Utc>,
    },
    Completed {
        task_id: u64,
    },
    Failed {
        task_id: u64,
        error: Error,
    },
    Pause,
    Resume,
    Cancel,
}

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    Canceled,
    Failed(Error),
}

/// Run observer. Called on the thread running the scheduler; exactly one of
/// the terminal methods is called per run.
pub trait SchedulerObserver<S> {
    fn on_task_changed(&mut self, _previous: Option<S>, _next: Option<S>) {}
    fn on_progress(&mut self, _current: usize, _total: usize, _timestamp: DateTime<Utc>) {}
    fn on_completed(&mut self, _last: Option<S>) {}
    fn on_canceled(&mut self, _state: Option<S>) {}
    fn on_failed(&mut self, _state: Option<S>, _error: &Error) {}
}

/// Pause, resume or cancel a run from any thread.
pub struct SchedulerHandle<S> {
    events: Sender<Event<S>>,
}

impl<S> Clone for SchedulerHandle<S> {
    fn clone(&self) -> Self {
        Self {
            events: self.events.clone(),
        }
    }
}

impl<S> SchedulerHandle<S> {
    /// Stop after the active task's current operation; queued tasks wait.
    pub fn pause(&self) {
        let _ = self.events.send(Event::Pause);
    }

    pub fn resume(&self) {
        let _ = self.events.send(Event::Resume);
    }

    /// Cancel the run once the active task acknowledges.
    pub fn cancel(&self) {
        let _ = self.events.send(Event::Cancel);
    }
}

struct Active<S> {
    id: u64,
    task: Box<dyn Task<S>>,
    started: bool,
}

/// Single-use scheduler: build, optionally pre-enqueue, then [`run`](Self::run).
pub struct TaskScheduler<S> {
    queue: TaskQueue<S>,
    settings: UpgradeSettings,
    events: Sender<Event<S>>,
    inbox: Receiver<Event<S>>,
    next_id: u64,
}

impl<S: Clone + Send + 'static> TaskScheduler<S> {
    pub fn new(settings: UpgradeSettings) -> Self {
        let (events, inbox) = channel();
        Self {
            queue: TaskQueue::new(),
            settings,
            events,
            inbox,
            next_id: 0,
        }
    }

    pub fn handle(&self) -> SchedulerHandle<S> {
        SchedulerHandle {
            events: self.events.clone(),
        }
    }

    /// Queue a task to run after the initial one.
    pub fn enqueue(&mut self, task: Box<dyn Task<S>>) {
        self.queue.push(task);
    }

    /// Run `initial` and everything it leads to. Blocks until the run ends.
    pub fn run(
        mut self,
        initial: Box<dyn Task<S>>,
        observer: &mut dyn SchedulerObserver<S>,
    ) -> RunOutcome {
        let mut paused = false;
        let mut canceled = false;

        observer.on_task_changed(None, initial.state());
        let mut active = self.activate(initial);
        self.start(&mut active);

        loop {
            // `self.events` keeps the channel open, so `recv` only returns events.
            let Ok(event) = self.inbox.recv() else {
                return RunOutcome::Canceled;
            };

            match event {
                Event::Enqueue { task_id, task } if task_id == active.id => {
                    debug!(task = task.name(), priority = task.priority(), "Task enqueued");
                    self.queue.push(task);
                }
                Event::Progress {
                    task_id,
                    current,
                    total,
                    timestamp,
                } if task_id == active.id => {
                    observer.on_progress(current, total, timestamp);
                }
                Event::Completed { task_id } if task_id == active.id => {
                    let state = active.task.state();
                    if canceled {
                        info!(task = active.task.name(), "Run canceled");
                        self.queue.clear();
                        observer.on_canceled(state);
                        return RunOutcome::Canceled;
                    }

                    debug!(task = active.task.name(), "Task completed");
                    let Some(next) = self.queue.pop() else {
                        info!("Run completed");
                        observer.on_completed(state);
                        return RunOutcome::Completed;
                    };

                    observer.on_task_changed(state, next.state());
                    active = self.activate(next);
                    if !paused {
                        self.start(&mut active);
                    }
                }
                Event::Failed { task_id, error } if task_id == active.id => {
                    warn!(task = active.task.name(), error = %error, "Task failed");
                    self.queue.clear();
                    observer.on_failed(active.task.state(), &error);
                    return RunOutcome::Failed(error);
                }
                Event::Pause => {
                    if !paused && !canceled {
                        info!(task = active.task.name(), "Run paused");
                        paused = true;
                        if active.started {
                            active.task.pause();
                        }
                    }
                }
                Event::Resume => {
                    if paused {
                        info!(task = active.task.name(), "Run resumed");
                        paused = false;
                        self.start(&mut active);
                    }
                }
                Event::Cancel => {
                    if canceled {
                        continue;
                    }
                    canceled = true;
                    paused = false;
                    if active.started {
                        info!(task = active.task.name(), "Cancel requested");
                        active.task.cancel();
                    } else {
                        // Never started, so it will never acknowledge.
                        info!(task = active.task.name(), "Run canceled");
                        self.queue.clear();
                        observer.on_canceled(active.task.state());
                        return RunOutcome::Canceled;
                    }
                }
                Event::Enqueue { task, .. } => {
                    warn!(task = task.name(), "Dropping enqueue from inactive task");
                }
                Event::Progress { .. } => {}
                Event::Completed { task_id } | Event::Failed { task_id, .. } => {
                    warn!(task_id, "Dropping report from inactive task");
                }
            }
        }
    }

    fn activate(&mut self, task: Box<dyn Task<S>>) -> Active<S> {
        self.next_id += 1;
        Active {
            id: self.next_id,
            task,
            started: false,
        }
    }

    fn start(&self, active: &mut Active<S>) {
        debug!(task = active.task.name(), priority = active.task.priority(), "Starting task");
        active.started = true;
        let ctx = TaskContext::new(active.id, self.settings, self.events.clone());
        active.task.start(ctx);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted tasks and a recording observer.

    use super::*;
    use std::sync::{Arc, Mutex};

    pub type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Clone, Copy)]
    pub enum Script {
        Complete,
        Fail,
        /// Report nothing; the test drives the context.
        Hold,
    }

    pub struct Scripted {
        pub priority: u32,
        pub name: &'static str,
        pub script: Script,
        pub log: Log,
        pub follow_up: Vec<Box<dyn Task<u32>>>,
        pub ctx: Arc<Mutex<Option<TaskContext<u32>>>>,
    }

    impl Scripted {
        pub fn new(priority: u32, name: &'static str, script: Script, log: &Log) -> Self {
            Self {
                priority,
                name,
                script,
                log: Arc::clone(log),
                follow_up: Vec::new(),
                ctx: Arc::new(Mutex::new(None)),
            }
        }
    }

    impl Task<u32> for Scripted {
        fn priority(&self) -> u32 {
            self.priority
        }
        fn state(&self) -> Option<u32> {
            Some(self.priority)
        }
        fn name(&self) -> &'static str {
            self.name
        }
        fn start(&mut self, ctx: TaskContext<u32>) {
            self.log.lock().unwrap().push(format!("start {}", self.name));
            for task in self.follow_up.drain(..) {
                ctx.enqueue(task);
            }
            match self.script {
                Script::Complete => ctx.completed(),
                Script::Fail => ctx.failed(Error::InvalidDeviceState(self.name.into())),
                Script::Hold => *self.ctx.lock().unwrap() = Some(ctx),
            }
        }
        fn pause(&mut self) {
            self.log.lock().unwrap().push(format!("pause {}", self.name));
        }
        fn cancel(&mut self) {
            self.log.lock().unwrap().push(format!("cancel {}", self.name));
        }
    }

    #[derive(Default)]
    pub struct Recorder {
        pub events: Vec<String>,
    }

    impl SchedulerObserver<u32> for Recorder {
        fn on_task_changed(&mut self, previous: Option<u32>, next: Option<u32>) {
            self.events.push(format!("changed {previous:?}->{next:?}"));
        }
        fn on_completed(&mut self, last: Option<u32>) {
            self.events.push(format!("completed {last:?}"));
        }
        fn on_canceled(&mut self, state: Option<u32>) {
            self.events.push(format!("canceled {state:?}"));
        }
        fn on_failed(&mut self, state: Option<u32>, _error: &Error) {
            self.events.push(format!("failed {state:?}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    fn log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    fn terminal_count(recorder: &Recorder) -> usize {
        recorder
            .events
            .iter()
            .filter(|e| !e.starts_with("changed"))
            .count()
    }

    #[test]
    fn test_initial_task_then_ascending_priority() {
        let log = log();
        let mut scheduler = TaskScheduler::new(UpgradeSettings::default());
        for (priority, name) in [(3, "three"), (1, "one"), (2, "two")] {
            scheduler.enqueue(Box::new(Scripted::new(priority, name, Script::Complete, &log)));
        }
        let initial = Box::new(Scripted::new(9, "initial", Script::Complete, &log));

        let mut recorder = Recorder::default();
        let outcome = scheduler.run(initial, &mut recorder);

        assert!(matches!(outcome, RunOutcome::Completed));
        assert_eq!(
            entries(&log),
            vec!["start initial", "start one", "start two", "start three"]
        );
        assert_eq!(recorder.events[0], "changed None->Some(9)");
        assert_eq!(recorder.events.last().unwrap(), "completed Some(3)");
        assert_eq!(terminal_count(&recorder), 1);
    }

    #[test]
    fn test_tasks_enqueued_while_running() {
        let log = log();
        let mut first = Scripted::new(1, "first", Script::Complete, &log);
        first
            .follow_up
            .push(Box::new(Scripted::new(5, "late", Script::Complete, &log)));
        first
            .follow_up
            .push(Box::new(Scripted::new(4, "early", Script::Complete, &log)));

        let scheduler = TaskScheduler::new(UpgradeSettings::default());
        let outcome = scheduler.run(Box::new(first), &mut Recorder::default());

        assert!(matches!(outcome, RunOutcome::Completed));
        assert_eq!(
            entries(&log),
            vec!["start first", "start early", "start late"]
        );
    }

    #[test]
    fn test_failure_clears_queue() {
        let log = log();
        let mut scheduler = TaskScheduler::new(UpgradeSettings::default());
        scheduler.enqueue(Box::new(Scripted::new(2, "broken", Script::Fail, &log)));
        scheduler.enqueue(Box::new(Scripted::new(3, "never", Script::Complete, &log)));

        let mut recorder = Recorder::default();
        let initial = Box::new(Scripted::new(1, "ok", Script::Complete, &log));
        let outcome = scheduler.run(initial, &mut recorder);

        assert!(matches!(outcome, RunOutcome::Failed(Error::InvalidDeviceState(_))));
        assert_eq!(entries(&log), vec!["start ok", "start broken"]);
        assert_eq!(recorder.events.last().unwrap(), "failed Some(2)");
        assert_eq!(terminal_count(&recorder), 1);
    }

    #[test]
    fn test_cancel_during_active_task() {
        let log = log();
        let mut scheduler = TaskScheduler::new(UpgradeSettings::default());
        scheduler.enqueue(Box::new(Scripted::new(2, "queued", Script::Complete, &log)));
        let held = Scripted::new(1, "held", Script::Hold, &log);
        let ctx = Arc::clone(&held.ctx);
        let handle = scheduler.handle();
        let observed = Arc::new(Mutex::new(Vec::new()));

        let runner = {
            let observed = Arc::clone(&observed);
            thread::spawn(move || {
                let mut recorder = Recorder::default();
                let outcome = scheduler.run(Box::new(held), &mut recorder);
                *observed.lock().unwrap() = recorder.events;
                outcome
            })
        };

        // Wait for the task to be started, then cancel it.
        while ctx.lock().unwrap().is_none() {
            thread::sleep(Duration::from_millis(1));
        }
        handle.cancel();
        while !entries(&log).contains(&"cancel held".to_string()) {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(observed.lock().unwrap().is_empty());

        // The task acknowledges; only now does the run end, as canceled.
        ctx.lock().unwrap().as_ref().unwrap().completed();
        let outcome = runner.join().unwrap();

        assert!(matches!(outcome, RunOutcome::Canceled));
        let events = observed.lock().unwrap().clone();
        assert_eq!(events, vec!["changed None->Some(1)", "canceled Some(1)"]);
        assert!(!entries(&log).contains(&"start queued".to_string()));
    }

    #[test]
    fn test_pause_holds_next_task_until_resume() {
        let log = log();
        let mut scheduler = TaskScheduler::new(UpgradeSettings::default());
        scheduler.enqueue(Box::new(Scripted::new(2, "next", Script::Complete, &log)));
        let held = Scripted::new(1, "held", Script::Hold, &log);
        let ctx = Arc::clone(&held.ctx);
        let handle = scheduler.handle();

        let runner = thread::spawn(move || scheduler.run(Box::new(held), &mut Recorder::default()));

        while ctx.lock().unwrap().is_none() {
            thread::sleep(Duration::from_millis(1));
        }
        handle.pause();
        // Events are processed in order, so the pause lands before the completion.
        ctx.lock().unwrap().as_ref().unwrap().completed();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(entries(&log), vec!["start held", "pause held"]);

        handle.resume();
        assert!(matches!(runner.join().unwrap(), RunOutcome::Completed));
        assert_eq!(
            entries(&log),
            vec!["start held", "pause held", "start next"]
        );
    }

    #[test]
    fn test_cancel_while_paused_before_start() {
        let log = log();
        let mut scheduler = TaskScheduler::new(UpgradeSettings::default());
        scheduler.enqueue(Box::new(Scripted::new(2, "next", Script::Complete, &log)));
        let held = Scripted::new(1, "held", Script::Hold, &log);
        let ctx = Arc::clone(&held.ctx);
        let handle = scheduler.handle();

        let runner = thread::spawn(move || {
            let mut recorder = Recorder::default();
            let outcome = scheduler.run(Box::new(held), &mut recorder);
            (outcome, recorder.events)
        });

        while ctx.lock().unwrap().is_none() {
            thread::sleep(Duration::from_millis(1));
        }
        handle.pause();
        ctx.lock().unwrap().as_ref().unwrap().completed();
        handle.cancel();

        let (outcome, events) = runner.join().unwrap();
        assert!(matches!(outcome, RunOutcome::Canceled));
        assert_eq!(events.last().unwrap(), "canceled Some(2)");
        assert!(!entries(&log).contains(&"start next".to_string()));
    }

    #[test]
    fn test_stale_reports_are_ignored() {
        let log = log();
        let mut scheduler = TaskScheduler::new(UpgradeSettings::default());
        let second = Scripted::new(2, "second", Script::Hold, &log);
        let second_ctx = Arc::clone(&second.ctx);
        scheduler.enqueue(Box::new(second));
        let first = Scripted::new(1, "first", Script::Hold, &log);
        let first_ctx = Arc::clone(&first.ctx);

        let runner = thread::spawn(move || {
            let mut recorder = Recorder::default();
            let outcome = scheduler.run(Box::new(first), &mut recorder);
            (outcome, recorder.events)
        });
        while first_ctx.lock().unwrap().is_none() {
            thread::sleep(Duration::from_millis(1));
        }
        let stale = first_ctx.lock().unwrap().clone().unwrap();
        stale.completed();
        while second_ctx.lock().unwrap().is_none() {
            thread::sleep(Duration::from_millis(1));
        }

        // The first task reporting again must neither fail nor end the run.
        stale.failed(Error::InvalidDeviceState("late".into()));
        stale.completed();
        second_ctx.lock().unwrap().as_ref().unwrap().completed();

        let (outcome, events) = runner.join().unwrap();
        assert!(matches!(outcome, RunOutcome::Completed));
        assert_eq!(events.last().unwrap(), "completed Some(2)");
    }
}
