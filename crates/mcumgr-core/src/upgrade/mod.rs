//! Upgrade flows built on the task scheduler.
//!
//! - [`FirmwareUpgrade`]: MCUboot image upload, test, reset, confirm
//! - [`ManifestUpgrade`]: SUIT envelope upload and resource delivery

pub mod firmware;
pub mod manifest;

pub use firmware::{FirmwareUpgrade, UpgradeState};
pub use manifest::{CacheImage, ManifestUpgrade, ManifestUpgradeState};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{RecvTimeoutError, Sender, channel};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::client::McuMgrClient;
use crate::error::Error;
use crate::events::{UpgradeEvent, UpgradeObserver};
use crate::scheduler::{RunOutcome, SchedulerObserver, Task, TaskContext};
use crate::transfer::{TransferCallback, TransferController, UploadTarget, upload};
use crate::transport::TransportError;

/// A run that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome<S> {
    Completed { state: S },
    Canceled { state: Option<S> },
}

/// A failed run and the state it failed in.
#[derive(Debug)]
pub struct UpgradeFailure<S> {
    pub state: Option<S>,
    pub error: Error,
}

impl<S: fmt::Display> fmt::Display for UpgradeFailure<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            Some(state) => write!(f, "upgrade failed in {}: {}", state, self.error),
            None => write!(f, "upgrade failed: {}", self.error),
        }
    }
}

impl<S: fmt::Debug + fmt::Display> std::error::Error for UpgradeFailure<S> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

pub type UpgradeResult<S> = Result<UpgradeOutcome<S>, UpgradeFailure<S>>;

/// Supplies resources a SUIT device asks for, keyed by URI.
pub trait ResourceProvider: Send + Sync {
    fn provide(&self, uri: &str) -> anyhow::Result<Vec<u8>>;
}

impl<F> ResourceProvider for F
where
    F: Fn(&str) -> anyhow::Result<Vec<u8>> + Send + Sync,
{
    fn provide(&self, uri: &str) -> anyhow::Result<Vec<u8>> {
        self(uri)
    }
}

/// Where a task is in its life.
pub(crate) enum Phase<C> {
    NotStarted,
    InFlight(C),
    Canceled,
}

/// Translates scheduler callbacks into [`UpgradeEvent`]s and tracks the
/// flow's current state.
pub(crate) struct FlowBridge<'a, S> {
    observer: &'a dyn UpgradeObserver<S>,
    current: Arc<Mutex<Option<S>>>,
    success: S,
}

impl<'a, S: Copy + PartialEq> FlowBridge<'a, S> {
    pub(crate) fn new(observer: &'a dyn UpgradeObserver<S>, success: S) -> Self {
        Self {
            observer,
            current: Arc::new(Mutex::new(None)),
            success,
        }
    }

    /// Current state, readable from task threads.
    pub(crate) fn shared(&self) -> Arc<Mutex<Option<S>>> {
        Arc::clone(&self.current)
    }

    fn current(&self) -> Option<S> {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self, next: S) {
        let from = {
            let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            if *current == Some(next) {
                return;
            }
            current.replace(next)
        };
        self.observer
            .on_event(&UpgradeEvent::StateChanged { from, to: next });
    }

    /// Map a scheduler outcome to the flow result.
    pub(crate) fn finish(&self, outcome: RunOutcome) -> UpgradeResult<S> {
        match outcome {
            RunOutcome::Completed => Ok(UpgradeOutcome::Completed {
                state: self.success,
            }),
            RunOutcome::Canceled => Ok(UpgradeOutcome::Canceled {
                state: self.current(),
            }),
            RunOutcome::Failed(error) => Err(UpgradeFailure {
                state: self.current(),
                error,
            }),
        }
    }
}

impl<S: Copy + PartialEq> SchedulerObserver<S> for FlowBridge<'_, S> {
    fn on_task_changed(&mut self, _previous: Option<S>, next: Option<S>) {
        if let Some(next) = next {
            self.enter(next);
        }
    }

    fn on_progress(&mut self, current: usize, total: usize, timestamp: DateTime<Utc>) {
        if let Some(state) = self.current() {
            self.observer.on_event(&UpgradeEvent::Progress {
                state,
                current,
                total,
                timestamp,
            });
        }
    }

    fn on_completed(&mut self, _last: Option<S>) {
        self.enter(self.success);
        self.observer.on_event(&UpgradeEvent::Completed {
            state: self.success,
        });
    }

    fn on_canceled(&mut self, _state: Option<S>) {
        self.observer.on_event(&UpgradeEvent::Canceled {
            state: self.current(),
        });
    }

    fn on_failed(&mut self, _state: Option<S>, error: &Error) {
        self.observer.on_event(&UpgradeEvent::Failed {
            state: self.current(),
            message: error.to_string(),
        });
    }
}

/// Reports a transfer to the scheduler. A canceled transfer acknowledges the
/// cancellation by completing.
struct TransferReporter<S> {
    ctx: TaskContext<S>,
}

impl<S: Send> TransferCallback for TransferReporter<S> {
    fn on_progress(&mut self, current: usize, total: usize, timestamp: DateTime<Utc>) {
        self.ctx.progress(current, total, timestamp);
    }

    fn on_failed(&mut self, error: Error) {
        self.ctx.failed(error);
    }

    fn on_canceled(&mut self) {
        self.ctx.completed();
    }

    fn on_uploaded(&mut self) {
        self.ctx.completed();
    }
}

/// Uploads one payload. Pause and resume map onto the transfer controller.
pub(crate) struct UploadTask<T, S> {
    priority: u32,
    state: S,
    name: &'static str,
    client: Arc<McuMgrClient>,
    target: T,
    data: Arc<[u8]>,
    phase: Phase<TransferController>,
}

impl<T, S> UploadTask<T, S> {
    pub(crate) fn new(
        priority: u32,
        state: S,
        name: &'static str,
        client: Arc<McuMgrClient>,
        target: T,
        data: Arc<[u8]>,
    ) -> Self {
        Self {
            priority,
            state,
            name,
            client,
            target,
            data,
            phase: Phase::NotStarted,
        }
    }
}

impl<T, S> Task<S> for UploadTask<T, S>
where
    T: UploadTarget + Clone,
    S: Copy + Send + 'static,
{
    fn priority(&self) -> u32 {
        self.priority
    }

    fn state(&self) -> Option<S> {
        Some(self.state)
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn start(&mut self, ctx: TaskContext<S>) {
        match &self.phase {
            Phase::NotStarted => {
                let settings = ctx.settings();
                let reporter = Box::new(TransferReporter { ctx: ctx.clone() });
                match upload(
                    Arc::clone(&self.client),
                    self.target.clone(),
                    Arc::clone(&self.data),
                    settings,
                    reporter,
                ) {
                    Ok(controller) => self.phase = Phase::InFlight(controller),
                    Err(error) => ctx.failed(error),
                }
            }
            Phase::InFlight(controller) => controller.resume(),
            Phase::Canceled => ctx.completed(),
        }
    }

    fn pause(&mut self) {
        if let Phase::InFlight(controller) = &self.phase {
            controller.pause();
        }
    }

    fn cancel(&mut self) {
        match &self.phase {
            Phase::InFlight(controller) => controller.cancel(),
            Phase::NotStarted => self.phase = Phase::Canceled,
            Phase::Canceled => {}
        }
    }
}

/// A wait on a helper thread that cancellation cuts short.
pub(crate) struct Delay {
    cancel: Sender<()>,
    canceled: Arc<AtomicBool>,
}

impl Delay {
    /// After `duration`, run `then(false)`; on cancel, run `then(true)` early.
    ///
    /// `then` also sees `true` if cancellation lands after the wait but
    /// before it checks.
    pub(crate) fn spawn<F>(duration: Duration, then: F) -> Result<Self, Error>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let (cancel, wake) = channel::<()>();
        let canceled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&canceled);

        std::thread::Builder::new()
            .name("smp-delay".into())
            .spawn(move || {
                let woken = !matches!(wake.recv_timeout(duration), Err(RecvTimeoutError::Timeout));
                then(woken || flag.load(Ordering::SeqCst));
            })
            .map_err(TransportError::Io)?;

        Ok(Self { cancel, canceled })
    }

    pub(crate) fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        let _ = self.cancel.send(());
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::managers::image::testing::{slot, state};
    use crate::protocol::constants::*;
    use crate::protocol::value::Payload;
    use crate::transport::{MockReply, MockRequest};

    /// Echo the uploaded range.
    pub fn echo_upload(req: &MockRequest) -> MockReply {
        let off = req.payload.int("off").unwrap_or(0);
        let len = req.payload.bytes("data").map_or(0, |d| d.len() as i64);
        MockReply::Payload(Payload::new().with("rc", 0i64).with("off", off + len))
    }

    /// A well-behaved MCUboot device.
    pub fn mcuboot_device(req: &MockRequest) -> MockReply {
        let confirm = req.payload.bool("confirm");
        match (req.header.group, req.header.command) {
            (GROUP_IMAGE, IMAGE_UPLOAD) => echo_upload(req),
            (GROUP_IMAGE, IMAGE_STATE) if confirm == Some(true) => {
                MockReply::Payload(state(vec![slot(0, false, true)]))
            }
            (GROUP_IMAGE, IMAGE_STATE) => {
                MockReply::Payload(state(vec![slot(0, false, true), slot(1, true, false)]))
            }
            (GROUP_DEFAULT, DEFAULT_RESET) => MockReply::Payload(Payload::new()),
            _ => MockReply::Payload(Payload::new().with("rc", 8i64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_delay_runs_after_timeout() {
        let (tx, rx) = mpsc::channel();
        let _delay = Delay::spawn(Duration::from_millis(5), move |canceled| {
            tx.send(canceled).unwrap()
        })
        .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(false));
    }

    #[test]
    fn test_delay_cancel_wakes_early() {
        let (tx, rx) = mpsc::channel();
        let delay = Delay::spawn(Duration::from_secs(60), move |canceled| {
            tx.send(canceled).unwrap()
        })
        .unwrap();
        delay.cancel();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(true));
    }

    #[test]
    fn test_closure_provider() {
        let provider = |uri: &str| -> anyhow::Result<Vec<u8>> {
            anyhow::ensure!(uri == "file://a.bin", "unknown resource {uri}");
            Ok(vec![1, 2, 3])
        };
        assert_eq!(provider.provide("file://a.bin").unwrap(), vec![1, 2, 3]);
        assert!(provider.provide("file://b.bin").is_err());
    }

    #[test]
    fn test_failure_display() {
        let failure = UpgradeFailure {
            state: Some(UpgradeState::Test),
            error: Error::InvalidDeviceState("no pending slot".into()),
        };
        assert_eq!(
            failure.to_string(),
            "upgrade failed in TEST: Invalid device state: no pending slot"
        );
    }
}
