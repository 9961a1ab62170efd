//! Chunked transfers over SMP.
//!
//! A transfer runs on its own driver thread. Requests go out through
//! [`McuMgrClient::send_async`](crate::client::McuMgrClient::send_async) and
//! their responses are funnelled back to the driver, so transports that
//! answer inline and transports that answer from another thread behave the
//! same.
//!
//! Callers observe a transfer through a [`TransferCallback`] and steer it
//! through a [`TransferController`].

pub mod download;
pub mod upload;

pub use download::{DownloadTarget, download};
pub use upload::{UploadTarget, chunk_capacity, upload};

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::ThreadId;

use chrono::{DateTime, Utc};

use crate::error::Error;

/// Transfer observer. Every method defaults to a no-op.
///
/// Exactly one of `on_uploaded`/`on_downloaded`, `on_failed` or
/// `on_canceled` is called per transfer.
pub trait TransferCallback: Send {
    fn on_progress(&mut self, _current: usize, _total: usize, _timestamp: DateTime<Utc>) {}
    fn on_failed(&mut self, _error: Error) {}
    fn on_canceled(&mut self) {}
    fn on_uploaded(&mut self) {}
    fn on_downloaded(&mut self, _data: Vec<u8>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferControl {
    Running,
    Paused,
    Canceled,
}

/// Snapshot of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferStatus {
    pub control: TransferControl,
    /// Driver is idle waiting for `resume` or `cancel`.
    pub parked: bool,
    /// A terminal callback has been delivered.
    pub finished: bool,
    /// Last acknowledged offset.
    pub offset: usize,
    /// Total length; unknown for downloads until the first response.
    pub total: Option<usize>,
}

pub(crate) struct Shared {
    status: Mutex<TransferStatus>,
    cond: Condvar,
}

impl Shared {
    pub(crate) fn new(total: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(TransferStatus {
                control: TransferControl::Running,
                parked: false,
                finished: false,
                offset: 0,
                total,
            }),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TransferStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn control(&self) -> TransferControl {
        self.lock().control
    }

    pub(crate) fn record(&self, offset: usize, total: Option<usize>) {
        let mut status = self.lock();
        status.offset = offset;
        status.total = total;
    }

    /// Block while paused. Returns the control value that ended the wait.
    pub(crate) fn park(&self) -> TransferControl {
        let mut status = self.lock();
        status.parked = true;
        self.cond.notify_all();
        while status.control == TransferControl::Paused {
            status = self.cond.wait(status).unwrap_or_else(|e| e.into_inner());
        }
        status.parked = false;
        status.control
    }

    pub(crate) fn finish(&self) {
        let mut status = self.lock();
        status.finished = true;
        self.cond.notify_all();
    }
}

/// Steers a running transfer. Cheap to clone.
#[derive(Clone)]
pub struct TransferController {
    shared: Arc<Shared>,
    driver: ThreadId,
}

impl TransferController {
    pub(crate) fn new(shared: Arc<Shared>, driver: ThreadId) -> Self {
        Self { shared, driver }
    }

    /// Stop issuing chunks; takes effect once in-flight chunks settle.
    pub fn pause(&self) {
        let mut status = self.shared.lock();
        if status.control == TransferControl::Running && !status.finished {
            status.control = TransferControl::Paused;
        }
    }

    /// Continue from the last acknowledged offset.
    pub fn resume(&self) {
        let mut status = self.shared.lock();
        if status.control == TransferControl::Paused {
            status.control = TransferControl::Running;
            self.shared.cond.notify_all();
        }
    }

    /// Cancel the transfer.
    ///
    /// With nothing in flight (the driver is parked) `on_canceled` has run by
    /// the time this returns; otherwise it runs once in-flight chunks settle.
    pub fn cancel(&self) {
        let mut status = self.shared.lock();
        if status.finished || status.control == TransferControl::Canceled {
            return;
        }
        status.control = TransferControl::Canceled;
        self.shared.cond.notify_all();

        if status.parked && std::thread::current().id() != self.driver {
            while !status.finished {
                status = self
                    .shared
                    .cond
                    .wait(status)
                    .unwrap_or_else(|e| e.into_inner());
            }
        }
    }

    pub fn status(&self) -> TransferStatus {
        *self.shared.lock()
    }

    pub fn is_finished(&self) -> bool {
        self.shared.lock().finished
    }

    /// Block until a terminal callback has been delivered.
    pub fn wait(&self) {
        let mut status = self.shared.lock();
        while !status.finished {
            status = self
                .shared
                .cond
                .wait(status)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Block until the driver has parked after a pause.
    pub fn wait_parked(&self) {
        let mut status = self.shared.lock();
        while !status.parked && !status.finished {
            status = self
                .shared
                .cond
                .wait(status)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}
