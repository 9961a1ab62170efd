//! Windowed upload.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};

use chrono::Utc;
use tracing::{debug, info, trace, warn};

use super::{Shared, TransferCallback, TransferControl, TransferController};
use crate::client::McuMgrClient;
use crate::error::{Error, FormatError, Result};
use crate::protocol::header::{Operation, WireHeader};
use crate::protocol::value::Payload;
use crate::settings::UpgradeSettings;
use crate::transport::TransportError;

/// Where uploaded chunks go.
pub trait UploadTarget: Send + Sync + 'static {
    fn group(&self) -> u16;
    fn command(&self) -> u8;
    /// Request body carrying `chunk`, which starts at `offset` of a
    /// `total`-byte payload.
    fn chunk_request(&self, chunk: &[u8], offset: usize, total: usize) -> Payload;
}

/// Largest chunk that fits one frame, aligned down to `alignment`.
///
/// Overhead is the header plus the larger of the empty first-chunk request
/// and the empty request at `total`, plus two bytes for the byte-string
/// length prefix growing with the data.
pub fn chunk_capacity(
    client: &McuMgrClient,
    target: &dyn UploadTarget,
    total: usize,
    alignment: usize,
) -> Result<usize> {
    let codec = client.codec();
    let first = codec.encode(&target.chunk_request(&[], 0, total))?.len();
    let last = codec.encode(&target.chunk_request(&[], total, total))?.len();
    let overhead = WireHeader::SIZE + first.max(last) + 2;

    let mtu = client.mtu();
    let available = mtu
        .min(u16::MAX as usize + WireHeader::SIZE)
        .saturating_sub(overhead);
    let chunk = available / alignment.max(1) * alignment.max(1);
    if chunk == 0 {
        return Err(Error::MtuTooSmall { mtu, overhead });
    }
    Ok(chunk)
}

/// Start uploading `data` to `target`.
///
/// Fails up front only if no chunk fits the MTU; everything after that is
/// reported through `callback`.
pub fn upload<T: UploadTarget>(
    client: Arc<McuMgrClient>,
    target: T,
    data: Arc<[u8]>,
    settings: UpgradeSettings,
    callback: Box<dyn TransferCallback>,
) -> Result<TransferController> {
    let total = data.len();
    let chunk_size = chunk_capacity(&client, &target, total, settings.memory_alignment())?;
    let shared = Shared::new(Some(total));
    let (tx, rx) = channel();

    info!(
        total,
        chunk_size,
        window = settings.window_capacity(),
        group = target.group(),
        command = target.command(),
        "Starting upload"
    );

    let driver = UploadDriver {
        client,
        target,
        data,
        window: settings.window_capacity(),
        chunk_size,
        shared: Arc::clone(&shared),
        callback,
        tx,
        rx,
    };
    let handle = std::thread::Builder::new()
        .name("smp-upload".into())
        .spawn(move || driver.run())
        .map_err(TransportError::Io)?;

    Ok(TransferController::new(shared, handle.thread().id()))
}

/// Consecutive resyncs to the same offset before the device is given up on.
const MAX_STALLED_RESYNCS: u32 = 5;

struct Ack {
    end: usize,
    result: Result<Payload>,
}

struct UploadDriver<T> {
    client: Arc<McuMgrClient>,
    target: T,
    data: Arc<[u8]>,
    window: usize,
    chunk_size: usize,
    shared: Arc<Shared>,
    callback: Box<dyn TransferCallback>,
    tx: Sender<Ack>,
    rx: Receiver<Ack>,
}

impl<T: UploadTarget> UploadDriver<T> {
    fn run(mut self) {
        let total = self.data.len();
        let mut acked = 0usize;
        let mut next = 0usize;
        let mut in_flight = 0usize;
        let mut sent_any = false;
        let mut acked_any = false;
        let mut resync = false;
        let mut echoed = 0usize;
        let mut resync_at: Option<usize> = None;
        let mut stalled = 0u32;
        let mut failure: Option<Error> = None;

        loop {
            if self.shared.control() == TransferControl::Running && failure.is_none() && !resync {
                while in_flight < self.window && (next < total || !sent_any) {
                    let end = (next + self.chunk_size).min(total);
                    self.send_chunk(next, end);
                    in_flight += 1;
                    sent_any = true;
                    next = end;
                }
            }

            if in_flight == 0 {
                let control = self.shared.control();
                if control == TransferControl::Canceled {
                    info!(offset = acked, total, "Upload canceled");
                    self.callback.on_canceled();
                    break;
                }
                if let Some(error) = failure.take() {
                    warn!(offset = acked, total, error = %error, "Upload failed");
                    self.callback.on_failed(error);
                    break;
                }
                if acked_any && acked >= total {
                    info!(total, "Upload complete");
                    self.callback.on_uploaded();
                    break;
                }
                if control == TransferControl::Paused {
                    info!(offset = acked, total, "Upload paused");
                    if self.shared.park() == TransferControl::Canceled {
                        info!(offset = acked, total, "Upload canceled");
                        self.callback.on_canceled();
                        break;
                    }
                    info!(offset = acked, total, "Upload resumed");
                }
                if resync {
                    resync = false;
                    stalled = if resync_at == Some(echoed) { stalled + 1 } else { 1 };
                    resync_at = Some(echoed);
                    if stalled > MAX_STALLED_RESYNCS {
                        failure = Some(
                            FormatError::UnexpectedResponse(format!(
                                "device keeps echoing offset {echoed}"
                            ))
                            .into(),
                        );
                        continue;
                    }
                    // The device's offset wins, even when it moved backwards.
                    debug!(offset = echoed, previous = acked, "Resending from echoed offset");
                    acked = echoed;
                    self.shared.record(acked, Some(total));
                }
                next = acked;
                continue;
            }

            // The driver holds a sender, so the channel never disconnects.
            let Ok(ack) = self.rx.recv() else { break };
            in_flight -= 1;
            if failure.is_some() {
                continue;
            }

            match self.acknowledge(ack, total) {
                Ok((offset, in_order)) => {
                    echoed = offset;
                    acked_any = true;
                    if in_order {
                        acked = acked.max(offset);
                        stalled = 0;
                    } else {
                        resync = true;
                    }
                    self.shared.record(acked, Some(total));
                    self.callback.on_progress(acked, total, Utc::now());
                }
                Err(error) => failure = Some(error),
            }
        }

        self.shared.finish();
    }

    /// Returns the echoed offset and whether it matched the chunk end.
    fn acknowledge(&self, ack: Ack, total: usize) -> Result<(usize, bool)> {
        let payload = ack.result?;
        let offset = payload
            .int("off")
            .ok_or(FormatError::InvalidField("off"))?;
        let offset = usize::try_from(offset)
            .ok()
            .filter(|off| *off <= total)
            .ok_or(Error::OffsetOutOfRange {
                offset: offset.max(0) as usize,
                total,
            })?;

        trace!(offset, expected = ack.end, "Chunk acknowledged");
        if offset != ack.end {
            warn!(offset, expected = ack.end, "Device echoed unexpected offset");
        }
        Ok((offset, offset == ack.end))
    }

    fn send_chunk(&self, start: usize, end: usize) {
        let total = self.data.len();
        let payload = self
            .target
            .chunk_request(&self.data[start..end], start, total);
        debug!(offset = start, len = end - start, "Sending chunk");

        let tx = self.tx.clone();
        self.client.send_async(
            Operation::Write,
            self.target.group(),
            self.target.command(),
            &payload,
            move |result| {
                let _ = tx.send(Ack { end, result });
            },
        );
    }
}
