//! SUIT manifest upgrade: envelope upload, then resource delivery until the
//! device stops asking.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::{Delay, FlowBridge, Phase, ResourceProvider, UploadTask, UpgradeResult};
use crate::client::McuMgrClient;
use crate::error::{Error, Result};
use crate::events::UpgradeObserver;
use crate::image::detect_manifest_image;
use crate::managers::{CacheUpload, EnvelopeUpload, MissingResource, ResourceUpload, SuitManager};
use crate::scheduler::{SchedulerHandle, Task, TaskContext, TaskScheduler};
use crate::settings::UpgradeConfig;

/// Manifest upgrade states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ManifestUpgradeState {
    #[default]
    None,
    UploadingEnvelope,
    Processing,
    UploadingResource,
    Success,
}

impl fmt::Display for ManifestUpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestUpgradeState::None => write!(f, "NONE"),
            ManifestUpgradeState::UploadingEnvelope => write!(f, "UPLOADING_ENVELOPE"),
            ManifestUpgradeState::Processing => write!(f, "PROCESSING"),
            ManifestUpgradeState::UploadingResource => write!(f, "UPLOADING_RESOURCE"),
            ManifestUpgradeState::Success => write!(f, "SUCCESS"),
        }
    }
}

/// Raw image for one of the device's cache partitions.
#[derive(Debug, Clone)]
pub struct CacheImage {
    pub target_id: u32,
    pub data: Vec<u8>,
}

const START_PRIORITY: u32 = 0;
const ENVELOPE_PRIORITY: u32 = 1;
const CACHE_PRIORITY: u32 = 2;
const BEGIN_INSTALL_PRIORITY: u32 = 3;
const POLL_PRIORITY: u32 = 4;
const RESOURCE_PRIORITY: u32 = 5;
const NEXT_POLL_PRIORITY: u32 = 6;

/// One manifest upgrade run. Consumed by [`ManifestUpgrade::run`].
pub struct ManifestUpgrade {
    client: Arc<McuMgrClient>,
    envelope: Vec<u8>,
    caches: Vec<CacheImage>,
    provider: Arc<dyn ResourceProvider>,
    poll_delay: Duration,
    scheduler: TaskScheduler<ManifestUpgradeState>,
}

impl ManifestUpgrade {
    /// Fails with `NotManifestFormat` unless `envelope` looks like a SUIT
    /// envelope.
    pub fn new(
        client: Arc<McuMgrClient>,
        envelope: Vec<u8>,
        caches: Vec<CacheImage>,
        provider: Arc<dyn ResourceProvider>,
        config: UpgradeConfig,
    ) -> Result<Self> {
        let digest = detect_manifest_image(&envelope)?;
        debug!(digest = %hex(&digest), size = envelope.len(), "Manifest envelope");
        Ok(Self {
            client,
            envelope,
            caches,
            provider,
            poll_delay: config.manifest_poll_delay(),
            scheduler: TaskScheduler::new(config.settings()?),
        })
    }

    /// Pause, resume or cancel the run from another thread.
    pub fn handle(&self) -> SchedulerHandle<ManifestUpgradeState> {
        self.scheduler.handle()
    }

    #[instrument(skip_all, fields(size = self.envelope.len(), caches = self.caches.len()))]
    pub fn run(
        self,
        observer: &dyn UpgradeObserver<ManifestUpgradeState>,
    ) -> UpgradeResult<ManifestUpgradeState> {
        let Self {
            client,
            envelope,
            caches,
            provider,
            poll_delay,
            scheduler,
        } = self;

        info!("Starting manifest upgrade");
        let mut bridge = FlowBridge::new(observer, ManifestUpgradeState::Success);
        let start = StartTask {
            plan: Some(StartPlan {
                envelope,
                caches,
                poll: PollPlan {
                    suit: SuitManager::new(Arc::clone(&client)),
                    client,
                    provider,
                    delay: poll_delay,
                },
            }),
        };

        let outcome = scheduler.run(Box::new(start), &mut bridge);
        bridge.finish(outcome)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

struct StartPlan {
    envelope: Vec<u8>,
    caches: Vec<CacheImage>,
    poll: PollPlan,
}

/// Queues the fixed part of the run.
struct StartTask {
    plan: Option<StartPlan>,
}

impl Task<ManifestUpgradeState> for StartTask {
    fn priority(&self) -> u32 {
        START_PRIORITY
    }

    fn name(&self) -> &'static str {
        "start"
    }

    fn start(&mut self, ctx: TaskContext<ManifestUpgradeState>) {
        let Some(plan) = self.plan.take() else {
            return ctx.completed();
        };
        let client = &plan.poll.client;
        let deferred = !plan.caches.is_empty();

        ctx.enqueue(Box::new(UploadTask::new(
            ENVELOPE_PRIORITY,
            ManifestUpgradeState::UploadingEnvelope,
            "envelope-upload",
            Arc::clone(client),
            EnvelopeUpload {
                defer_install: deferred,
            },
            plan.envelope.into(),
        )));

        if deferred {
            for cache in plan.caches {
                debug!(target_id = cache.target_id, size = cache.data.len(), "Queueing cache upload");
                ctx.enqueue(Box::new(UploadTask::new(
                    CACHE_PRIORITY,
                    ManifestUpgradeState::UploadingResource,
                    "cache-upload",
                    Arc::clone(client),
                    CacheUpload {
                        target_id: cache.target_id,
                    },
                    cache.data.into(),
                )));
            }
            ctx.enqueue(Box::new(BeginInstallTask {
                suit: plan.poll.suit.clone(),
                phase: Phase::NotStarted,
            }));
        }

        ctx.enqueue(Box::new(PollTask::new(POLL_PRIORITY, plan.poll)));
        ctx.completed();
    }
}

struct BeginInstallTask {
    suit: SuitManager,
    phase: Phase<()>,
}

impl Task<ManifestUpgradeState> for BeginInstallTask {
    fn priority(&self) -> u32 {
        BEGIN_INSTALL_PRIORITY
    }

    fn state(&self) -> Option<ManifestUpgradeState> {
        Some(ManifestUpgradeState::Processing)
    }

    fn name(&self) -> &'static str {
        "begin-install"
    }

    fn start(&mut self, ctx: TaskContext<ManifestUpgradeState>) {
        match self.phase {
            Phase::NotStarted => {}
            Phase::InFlight(()) => return,
            Phase::Canceled => return ctx.completed(),
        }
        self.phase = Phase::InFlight(());
        self.suit.begin_install_async(move |result| match result {
            Ok(()) => ctx.completed(),
            Err(error) => ctx.failed(error),
        });
    }

    fn cancel(&mut self) {
        if let Phase::NotStarted = self.phase {
            self.phase = Phase::Canceled;
        }
    }
}

/// Everything a poll needs to schedule the next round.
#[derive(Clone)]
struct PollPlan {
    client: Arc<McuMgrClient>,
    suit: SuitManager,
    provider: Arc<dyn ResourceProvider>,
    delay: Duration,
}

/// Waits, then asks the device for the next missing resource.
struct PollTask {
    priority: u32,
    plan: PollPlan,
    phase: Phase<Delay>,
}

impl PollTask {
    fn new(priority: u32, plan: PollPlan) -> Self {
        Self {
            priority,
            plan,
            phase: Phase::NotStarted,
        }
    }
}

impl Task<ManifestUpgradeState> for PollTask {
    fn priority(&self) -> u32 {
        self.priority
    }

    fn state(&self) -> Option<ManifestUpgradeState> {
        Some(ManifestUpgradeState::Processing)
    }

    fn name(&self) -> &'static str {
        "poll"
    }

    fn start(&mut self, ctx: TaskContext<ManifestUpgradeState>) {
        match self.phase {
            Phase::NotStarted => {}
            Phase::InFlight(_) => return,
            Phase::Canceled => return ctx.completed(),
        }

        let plan = self.plan.clone();
        let failed_ctx = ctx.clone();
        let delay = Delay::spawn(self.plan.delay, move |canceled| {
            if canceled {
                return ctx.completed();
            }
            let suit = plan.suit.clone();
            suit.poll_missing_image_async(move |result| poll_result(plan, ctx, result));
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
    ctx: TaskContext<ManifestUpgradeState>,
    result: Result<Option<MissingResource>>,
) {
    let resource = match result {
        Ok(Some(resource)) => resource,
        Ok(None) => {
            info!("Device needs no more resources");
            return ctx.completed();
        }
        Err(error) if error.is_disconnect() => {
            info!(error = %error, "Device went away while processing, assuming reboot");
            return ctx.completed();
        }
        Err(error) => return ctx.failed(error),
    };

    info!(uri = %resource.uri, session = resource.session_id, "Device requested resource");
    let data = match plan.provider.provide(&resource.uri) {
        Ok(data) => data,
        Err(error) => {
            warn!(uri = %resource.uri, error = %error, "Resource not available");
            return ctx.failed(Error::Resource {
                uri: resource.uri,
                message: format!("{:#}", error),
            });
        }
    };

    ctx.enqueue(Box::new(UploadTask::new(
        RESOURCE_PRIORITY,
        ManifestUpgradeState::UploadingResource,
        "resource-upload",
        Arc::clone(&plan.client),
        ResourceUpload {
            session_id: resource.session_id,
        },
        data.into(),
    )));
    ctx.enqueue(Box::new(PollTask::new(NEXT_POLL_PRIORITY, plan)));
    ctx.completed();
}
