//! MCUboot firmware upgrade: upload, test, reset, confirm.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, instrument, warn};

use super::{Delay, FlowBridge, Phase, UploadTask, UpgradeResult};
use crate::client::McuMgrClient;
use crate::error::{Error, Result};
use crate::events::UpgradeObserver;
use crate::image::ParsedImage;
use crate::managers::{DefaultManager, ImageManager, ImageStateResponse, ImageUpload};
use crate::scheduler::{SchedulerHandle, Task, TaskContext, TaskScheduler};
use crate::settings::{ResetPollConfig, UpgradeConfig, UpgradeMode};

/// Legacy upgrade states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpgradeState {
    #[default]
    None,
    Upload,
    Test,
    Reset,
    Confirm,
    Success,
}

impl fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeState::None => write!(f, "NONE"),
            UpgradeState::Upload => write!(f, "UPLOAD"),
            UpgradeState::Test => write!(f, "TEST"),
            UpgradeState::Reset => write!(f, "RESET"),
            UpgradeState::Confirm => write!(f, "CONFIRM"),
            UpgradeState::Success => write!(f, "SUCCESS"),
        }
    }
}

const UPLOAD_PRIORITY: u32 = 1;
const TEST_PRIORITY: u32 = 2;
const RESET_PRIORITY: u32 = 3;
const RESET_POLL_PRIORITY: u32 = 4;
const CONFIRM_PRIORITY: u32 = 5;

/// One firmware upgrade run. Consumed by [`FirmwareUpgrade::run`].
pub struct FirmwareUpgrade {
    client: Arc<McuMgrClient>,
    image: ParsedImage,
    config: UpgradeConfig,
    scheduler: TaskScheduler<UpgradeState>,
}

impl FirmwareUpgrade {
    pub fn new(client: Arc<McuMgrClient>, image: ParsedImage, config: UpgradeConfig) -> Result<Self> {
        let scheduler = TaskScheduler::new(config.settings()?);
        Ok(Self {
            client,
            image,
            config,
            scheduler,
        })
    }

    /// Pause, resume or cancel the run from another thread.
    pub fn handle(&self) -> SchedulerHandle<UpgradeState> {
        self.scheduler.handle()
    }

    #[instrument(skip_all, fields(version = %self.image.header().version, mode = ?self.config.mode))]
    pub fn run(self, observer: &dyn UpgradeObserver<UpgradeState>) -> UpgradeResult<UpgradeState> {
        let Self {
            client,
            image,
            config,
            mut scheduler,
        } = self;

        let hash = image.hash().to_vec();
        let images = ImageManager::new(Arc::clone(&client));
        let mut bridge = FlowBridge::new(observer, UpgradeState::Success);
        info!(size = image.data().len(), "Starting firmware upgrade");

        let upload = UploadTask::new(
            UPLOAD_PRIORITY,
            UpgradeState::Upload,
            "upload",
            Arc::clone(&client),
            ImageUpload {
                image: config.image,
                sha: hash.clone(),
            },
            image.into_data().into(),
        );
        scheduler.enqueue(Box::new(TestTask {
            images: images.clone(),
            hash: hash.clone(),
            image: config.image,
            phase: Phase::NotStarted,
        }));
        scheduler.enqueue(Box::new(ResetTask {
            os: DefaultManager::new(client),
            plan: PollPlan {
                images,
                poll: config.reset_poll,
                mode: config.mode,
                flow_state: bridge.shared(),
                hash,
                image: config.image,
            },
            phase: Phase::NotStarted,
        }));

        let outcome = scheduler.run(Box::new(upload), &mut bridge);
        bridge.finish(outcome)
    }
}

/// Exactly two slots with the secondary one pending.
fn validate_test(response: &ImageStateResponse, image: u32) -> Result<()> {
    let pending = response.slot(image, 1).is_some_and(|s| s.pending);
    if response.slots.len() != 2 || !pending {
        return Err(Error::InvalidDeviceState(format!(
            "expected 2 slots with slot 1 pending, got {} slot(s), pending={}",
            response.slots.len(),
            pending
        )));
    }
    Ok(())
}

/// At least one slot, and the primary slot confirmed.
fn validate_confirm(response: &ImageStateResponse, image: u32) -> Result<()> {
    let confirmed = response.slot(image, 0).is_some_and(|s| s.confirmed);
    if response.slots.is_empty() || !confirmed {
        return Err(Error::InvalidDeviceState(format!(
            "expected slot 0 confirmed, got {} slot(s)",
            response.slots.len()
        )));
    }
    Ok(())
}

struct TestTask {
    images: ImageManager,
    hash: Vec<u8>,
    image: u32,
    phase: Phase<()>,
}

impl Task<UpgradeState> for TestTask {
    fn priority(&self) -> u32 {
        TEST_PRIORITY
    }

    fn state(&self) -> Option<UpgradeState> {
        Some(UpgradeState::Test)
    }

    fn name(&self) -> &'static str {
        "test"
    }

    fn start(&mut self, ctx: TaskContext<UpgradeState>) {
        match self.phase {
            Phase::NotStarted => {}
            Phase::InFlight(()) => return,
            Phase::Canceled => return ctx.completed(),
        }
        self.phase = Phase::InFlight(());
        let image = self.image;
        self.images.test_async(&self.hash, move |result| {
            match result.and_then(|response| validate_test(&response, image)) {
                Ok(()) => ctx.completed(),
                Err(error) => ctx.failed(error),
            }
        });
    }
}

struct ResetTask {
    os: DefaultManager,
    plan: PollPlan,
    phase: Phase<()>,
}

impl Task<UpgradeState> for ResetTask {
    fn priority(&self) -> u32 {
        RESET_PRIORITY
    }

    fn state(&self) -> Option<UpgradeState> {
        Some(UpgradeState::Reset)
    }

    fn name(&self) -> &'static str {
        "reset"
    }

    fn start(&mut self, ctx: TaskContext<UpgradeState>) {
        match self.phase {
            Phase::NotStarted => {}
            Phase::InFlight(()) => return,
            Phase::Canceled => return ctx.completed(),
        }
        self.phase = Phase::InFlight(());
        let plan = self.plan.clone();
        self.os.reset_async(false, move |result| match result {
            Ok(()) => {
                let delay = plan.poll.initial_delay();
                info!(delay_ms = delay.as_millis() as u64, "Reset sent, waiting for device");
                ctx.enqueue(Box::new(ResetPollTask::new(plan, 0, delay)));
                ctx.completed();
            }
            Err(error) => ctx.failed(error),
        });
    }
}

/// Everything a reset poll needs to schedule its successor.
#[derive(Clone)]
struct PollPlan {
    images: ImageManager,
    poll: ResetPollConfig,
    mode: UpgradeMode,
    flow_state: Arc<Mutex<Option<UpgradeState>>>,
    hash: Vec<u8>,
    image: u32,
}

impl PollPlan {
    fn in_reset(&self) -> bool {
        *self.flow_state.lock().unwrap_or_else(|e| e.into_inner()) == Some(UpgradeState::Reset)
    }
}

/// Waits, then checks whether the device answers again.
struct ResetPollTask {
    plan: PollPlan,
    attempt: u32,
    delay: Duration,
    phase: Phase<Delay>,
}

impl ResetPollTask {
    fn new(plan: PollPlan, attempt: u32, delay: Duration) -> Self {
        Self {
            plan,
            attempt,
            delay,
            phase: Phase::NotStarted,
        }
    }
}

impl Task<UpgradeState> for ResetPollTask {
    fn priority(&self) -> u32 {
        RESET_POLL_PRIORITY
    }

    fn state(&self) -> Option<UpgradeState> {
        Some(UpgradeState::Reset)
    }

    fn name(&self) -> &'static str {
        "reset-poll"
    }

    fn start(&mut self, ctx: TaskContext<UpgradeState>) {
        match self.phase {
            Phase::NotStarted => {}
            Phase::InFlight(_) => return,
            Phase::Canceled => return ctx.completed(),
        }

        let plan = self.plan.clone();
        let attempt = self.attempt;
        let failed_ctx = ctx.clone();
        let delay = Delay::spawn(self.delay, move |canceled| {
            if canceled {
                return ctx.completed();
            }
            let images = plan.images.clone();
            images.state_async(move |result| poll_result(plan, attempt, ctx, result));
        });

        match delay {
            Ok(delay) => self.phase = Phase::InFlight(delay),
            Err(error) => failed_ctx.failed(error),
        }
    }

    fn cancel(&mut self) {
        match &self.phase {
            Phase::InFlight(delay) => delay.cancel(),
            Phase::NotStarted => self.phase = Phase::Canceled,
            Phase::Canceled => {}
        }
    }
}

fn poll_result(
    plan: PollPlan,
    attempt: u32,
    ctx: TaskContext<UpgradeState>,
    result: Result<ImageStateResponse>,
) {
    match result {
        Ok(_) => {
            info!(attempt, "Device is back after reset");
            if plan.in_reset() && plan.mode == UpgradeMode::TestAndConfirm {
                ctx.enqueue(Box::new(ConfirmTask {
                    images: plan.images.clone(),
                    hash: plan.hash.clone(),
                    image: plan.image,
                    phase: Phase::NotStarted,
                }));
            }
            ctx.completed();
        }
        Err(error) if attempt < plan.poll.max_retries => {
            warn!(attempt, error = %error, "Device not ready, polling again");
            let interval = plan.poll.interval();
            ctx.enqueue(Box::new(ResetPollTask::new(plan, attempt + 1, interval)));
            ctx.completed();
        }
        Err(error) => {
            warn!(attempt, error = %error, "Device did not come back");
            ctx.failed(Error::ResetPollTimeout {
                attempts: attempt + 1,
            });
        }
    }
}

struct ConfirmTask {
    images: ImageManager,
    hash: Vec<u8>,
    image: u32,
    phase: Phase<()>,
}

impl Task<UpgradeState> for ConfirmTask {
    fn priority(&self) -> u32 {
        CONFIRM_PRIORITY
    }

    fn state(&self) -> Option<UpgradeState> {
        Some(UpgradeState::Confirm)
    }

    fn name(&self) -> &'static str {
        "confirm"
    }

    fn start(&mut self, ctx: TaskContext<UpgradeState>) {
        match self.phase {
            Phase::NotStarted => {}
            Phase::InFlight(()) => return,
            Phase::Canceled => return ctx.completed(),
        }
        self.phase = Phase::InFlight(());
        let image = self.image;
        self.images.confirm_async(Some(self.hash.as_slice()), move |result| {
            match result.and_then(|response| validate_confirm(&response, image)) {
                Ok(()) => ctx.completed(),
                Err(error) => ctx.failed(error),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::UpgradeEvent;
    use crate::events::testing::Collector;
    use crate::image::testing::image_with_hash;
    use crate::managers::image::testing::{slot, state};
    use crate::protocol::constants::*;
    use crate::protocol::header::Operation;
    use crate::transport::{MockReply, MockTransport, TransportError};
    use crate::upgrade::UpgradeOutcome;
    use crate::upgrade::testing::mcuboot_device;

    fn fast_config() -> UpgradeConfig {
        UpgradeConfig {
            reset_poll: ResetPollConfig {
                initial_delay_ms: 5,
                interval_ms: 5,
                max_retries: 4,
            },
            ..Default::default()
        }
    }

    fn setup() -> (Arc<MockTransport>, Arc<McuMgrClient>, ParsedImage) {
        let mock = Arc::new(MockTransport::with_mtu(256));
        let client = Arc::new(McuMgrClient::new(mock.clone()));
        let image = ParsedImage::from_bytes(image_with_hash(2000, &[0x5A; 32])).unwrap();
        (mock, client, image)
    }

    fn state_reads(mock: &MockTransport) -> usize {
        mock.requests()
            .iter()
            .filter(|r| {
                r.is(GROUP_IMAGE, IMAGE_STATE) && r.header.operation() == Some(Operation::Read)
            })
            .count()
    }

    #[test]
    fn test_end_to_end_state_sequence() {
        let (mock, client, image) = setup();
        mock.set_responder(mcuboot_device);
        let collector = Collector::default();

        let upgrade = FirmwareUpgrade::new(client, image, fast_config()).unwrap();
        let result = upgrade.run(&collector);

        assert_eq!(
            result.unwrap(),
            UpgradeOutcome::Completed {
                state: UpgradeState::Success
            }
        );
        assert_eq!(
            collector.states(),
            vec![
                UpgradeState::Upload,
                UpgradeState::Test,
                UpgradeState::Reset,
                UpgradeState::Confirm,
                UpgradeState::Success,
            ]
        );
        assert!(matches!(
            collector.events().last(),
            Some(UpgradeEvent::Completed {
                state: UpgradeState::Success
            })
        ));
        assert!(collector.events().iter().any(|e| matches!(
            e,
            UpgradeEvent::Progress {
                state: UpgradeState::Upload,
                ..
            }
        )));

        let requests = mock.requests();
        let test = requests
            .iter()
            .find(|r| r.payload.bool("confirm") == Some(false))
            .unwrap();
        assert_eq!(test.payload.bytes("hash"), Some(&[0x5A; 32][..]));
        assert_eq!(state_reads(&mock), 1);
    }

    #[test]
    fn test_test_only_mode_skips_confirm() {
        let (mock, client, image) = setup();
        mock.set_responder(mcuboot_device);
        let collector = Collector::default();
        let config = UpgradeConfig {
            mode: UpgradeMode::TestOnly,
            ..fast_config()
        };

        FirmwareUpgrade::new(client, image, config)
            .unwrap()
            .run(&collector)
            .unwrap();

        assert_eq!(
            collector.states(),
            vec![
                UpgradeState::Upload,
                UpgradeState::Test,
                UpgradeState::Reset,
                UpgradeState::Success,
            ]
        );
        assert!(
            !mock
                .requests()
                .iter()
                .any(|r| r.payload.bool("confirm") == Some(true))
        );
    }

    #[test]
    fn test_reset_poll_exhaustion() {
        let (mock, client, image) = setup();
        mock.set_responder(|req| {
            if req.is(GROUP_IMAGE, IMAGE_STATE) && req.header.operation() == Some(Operation::Read) {
                MockReply::Error(TransportError::Timeout { timeout_ms: 5 })
            } else {
                mcuboot_device(req)
            }
        });
        let collector = Collector::default();

        let failure = FirmwareUpgrade::new(client, image, fast_config())
            .unwrap()
            .run(&collector)
            .unwrap_err();

        assert!(matches!(failure.error, Error::ResetPollTimeout { attempts: 5 }));
        assert_eq!(failure.state, Some(UpgradeState::Reset));
        assert_eq!(state_reads(&mock), 5);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(state_reads(&mock), 5);
        assert!(matches!(
            collector.events().last(),
            Some(UpgradeEvent::Failed {
                state: Some(UpgradeState::Reset),
                ..
            })
        ));
    }

    #[test]
    fn test_poll_recovers_after_retries() {
        let (mock, client, image) = setup();
        let mut misses = 2;
        mock.set_responder(move |req| {
            if req.is(GROUP_IMAGE, IMAGE_STATE)
                && req.header.operation() == Some(Operation::Read)
                && misses > 0
            {
                misses -= 1;
                return MockReply::Error(TransportError::Disconnected);
            }
            mcuboot_device(req)
        });
        let collector = Collector::default();

        FirmwareUpgrade::new(client, image, fast_config())
            .unwrap()
            .run(&collector)
            .unwrap();
        assert_eq!(state_reads(&mock), 3);
        assert_eq!(collector.states().last(), Some(&UpgradeState::Success));
    }

    #[test]
    fn test_test_response_without_pending_slot() {
        let (mock, client, image) = setup();
        mock.set_responder(|req| {
            if req.payload.bool("confirm") == Some(false) {
                MockReply::Payload(state(vec![slot(0, false, true), slot(1, false, false)]))
            } else {
                mcuboot_device(req)
            }
        });
        let collector = Collector::default();

        let failure = FirmwareUpgrade::new(client, image, fast_config())
            .unwrap()
            .run(&collector)
            .unwrap_err();
        assert!(matches!(failure.error, Error::InvalidDeviceState(_)));
        assert_eq!(failure.state, Some(UpgradeState::Test));
        assert!(
            !mock
                .requests()
                .iter()
                .any(|r| r.is(GROUP_DEFAULT, DEFAULT_RESET))
        );
    }

    #[test]
    fn test_test_response_with_one_slot() {
        let response = ImageStateResponse::from_payload(&state(vec![slot(1, true, false)])).unwrap();
        assert!(validate_test(&response, 0).is_err());
    }

    #[test]
    fn test_confirm_response_not_confirmed() {
        let (mock, client, image) = setup();
        mock.set_responder(|req| {
            if req.payload.bool("confirm") == Some(true) {
                MockReply::Payload(state(vec![slot(0, false, false)]))
            } else {
                mcuboot_device(req)
            }
        });

        let failure = FirmwareUpgrade::new(client, image, fast_config())
            .unwrap()
            .run(&Collector::default())
            .unwrap_err();
        assert!(matches!(failure.error, Error::InvalidDeviceState(_)));
        assert_eq!(failure.state, Some(UpgradeState::Confirm));
    }

    #[test]
    fn test_device_error_during_upload() {
        let (mock, client, image) = setup();
        mock.set_responder(|req| {
            if req.is(GROUP_IMAGE, IMAGE_UPLOAD) {
                MockReply::Payload(crate::protocol::Payload::new().with("rc", 7i64))
            } else {
                mcuboot_device(req)
            }
        });

        let failure = FirmwareUpgrade::new(client, image, fast_config())
            .unwrap()
            .run(&Collector::default())
            .unwrap_err();
        assert!(matches!(failure.error, Error::Device { code: 7, .. }));
        assert_eq!(failure.state, Some(UpgradeState::Upload));
    }

    #[test]
    fn test_cancel_during_reset_wait() {
        let (mock, client, image) = setup();
        mock.set_responder(mcuboot_device);
        let config = UpgradeConfig {
            reset_poll: ResetPollConfig {
                initial_delay_ms: 60_000,
                ..Default::default()
            },
            ..Default::default()
        };
        let upgrade = FirmwareUpgrade::new(client, image, config).unwrap();
        let handle = upgrade.handle();

        let runner = std::thread::spawn(move || upgrade.run(&Collector::default()));
        while !mock
            .requests()
            .iter()
            .any(|r| r.is(GROUP_DEFAULT, DEFAULT_RESET))
        {
            std::thread::sleep(Duration::from_millis(1));
        }
        handle.cancel();

        let result = runner.join().unwrap().unwrap();
        assert_eq!(
            result,
            UpgradeOutcome::Canceled {
                state: Some(UpgradeState::Reset)
            }
        );
        assert_eq!(state_reads(&mock), 0);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let (_, client, image) = setup();
        let config = UpgradeConfig {
            window_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(
            FirmwareUpgrade::new(client, image, config),
            Err(Error::InvalidSettings(_))
        ));
    }
}
