//! Sequential download.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{Shared, TransferCallback, TransferControl, TransferController};
use crate::client::McuMgrClient;
use crate::error::{Error, FormatError, Result};
use crate::protocol::header::Operation;
use crate::protocol::value::Payload;
use crate::transport::TransportError;

/// Where downloaded chunks come from.
pub trait DownloadTarget: Send + Sync + 'static {
    fn group(&self) -> u16;
    fn command(&self) -> u8;
    /// Request body asking for data at `offset`.
    fn chunk_request(&self, offset: usize) -> Payload;
}

/// Start downloading from `target`.
///
/// The buffer is sized from the `len` reported with the first chunk;
/// `on_downloaded` receives it once full.
pub fn download<T: DownloadTarget>(
    client: Arc<McuMgrClient>,
    target: T,
    callback: Box<dyn TransferCallback>,
) -> Result<TransferController> {
    let shared = Shared::new(None);
    let (tx, rx) = channel();

    info!(
        group = target.group(),
        command = target.command(),
        "Starting download"
    );

    let driver = DownloadDriver {
        client,
        target,
        shared: Arc::clone(&shared),
        callback,
        tx,
        rx,
    };
    let handle = std::thread::Builder::new()
        .name("smp-download".into())
        .spawn(move || driver.run())
        .map_err(TransportError::Io)?;

    Ok(TransferController::new(shared, handle.thread().id()))
}

/// Upper bound on the buffer reserved from a device-declared length.
const MAX_RESERVE: usize = 64 * 1024;

/// Download state: offset, total once known, and the bytes so far.
#[derive(Debug, Default)]
struct TransferState {
    offset: usize,
    total: Option<usize>,
    data: Vec<u8>,
}

impl TransferState {
    /// Fold one response in; returns true once the buffer is full.
    fn apply(&mut self, payload: &Payload) -> Result<bool> {
        if self.offset == 0 {
            let len = payload
                .int("len")
                .and_then(|len| usize::try_from(len).ok())
                .ok_or(FormatError::InvalidField("len"))?;
            self.total = Some(len);
            self.data = Vec::with_capacity(len.min(MAX_RESERVE));
        }
        let total = self.total.ok_or(FormatError::InvalidField("len"))?;

        if let Some(len) = payload.int("len") {
            if len != total as i64 {
                return Err(FormatError::UnexpectedResponse(format!(
                    "length changed from {total} to {len}"
                ))
                .into());
            }
        }

        if let Some(echoed) = payload.int("off") {
            if echoed != self.offset as i64 {
                return Err(FormatError::UnexpectedResponse(format!(
                    "offset {echoed}, requested {}",
                    self.offset
                ))
                .into());
            }
        }

        let chunk = payload
            .bytes("data")
            .filter(|data| !data.is_empty())
            .ok_or(FormatError::InvalidField("data"))?;

        let remaining = total.saturating_sub(self.offset);
        let take = chunk.len().min(remaining);
        if take == 0 {
            return Err(Error::OffsetOutOfRange {
                offset: self.offset,
                total,
            });
        }

        self.data.extend_from_slice(&chunk[..take]);
        self.offset += take;
        Ok(self.offset == total)
    }
}

struct DownloadDriver<T> {
    client: Arc<McuMgrClient>,
    target: T,
    shared: Arc<Shared>,
    callback: Box<dyn TransferCallback>,
    tx: Sender<Result<Payload>>,
    rx: Receiver<Result<Payload>>,
}

impl<T: DownloadTarget> DownloadDriver<T> {
    fn run(mut self) {
        let mut state = TransferState::default();

        loop {
            match self.shared.control() {
                TransferControl::Running => {}
                TransferControl::Paused => {
                    info!(offset = state.offset, "Download paused");
                    if self.shared.park() == TransferControl::Canceled {
                        self.callback.on_canceled();
                        break;
                    }
                    info!(offset = state.offset, "Download resumed");
                    continue;
                }
                TransferControl::Canceled => {
                    info!(offset = state.offset, "Download canceled");
                    self.callback.on_canceled();
                    break;
                }
            }

            debug!(offset = state.offset, "Requesting chunk");
            let tx = self.tx.clone();
            self.client.send_async(
                Operation::Read,
                self.target.group(),
                self.target.command(),
                &self.target.chunk_request(state.offset),
                move |result| {
                    let _ = tx.send(result);
                },
            );

            let Ok(result) = self.rx.recv() else { break };
            if self.shared.control() == TransferControl::Canceled {
                self.callback.on_canceled();
                break;
            }

            match result.and_then(|payload| state.apply(&payload)) {
                Ok(done) => {
                    let total = state.total.unwrap_or(state.offset);
                    self.shared.record(state.offset, state.total);
                    self.callback.on_progress(state.offset, total, Utc::now());
                    if done {
                        info!(total, "Download complete");
                        self.callback.on_downloaded(std::mem::take(&mut state.data));
                        break;
                    }
                }
                Err(error) => {
                    warn!(offset = state.offset, error = %error, "Download failed");
                    self.callback.on_failed(error);
                    break;
                }
            }
        }

        self.shared.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::testing::{Seen, recorder, until_terminal};
    use crate::transport::{MockReply, MockTransport};

    struct TestSource;

    impl DownloadTarget for TestSource {
        fn group(&self) -> u16 {
            8
        }
        fn command(&self) -> u8 {
            0
        }
        fn chunk_request(&self, offset: usize) -> Payload {
            Payload::new().with("name", "/lfs/log").with("off", offset)
        }
    }

    fn serve(file: Vec<u8>, chunk: usize) -> Arc<MockTransport> {
        let mock = Arc::new(MockTransport::new());
        mock.set_responder(move |req| {
            let off = req.payload.int("off").unwrap() as usize;
            let end = (off + chunk).min(file.len());
            let mut body = Payload::new()
                .with("off", off)
                .with("data", &file[off..end]);
            if off == 0 {
                body.insert("len", file.len());
            }
            MockReply::Payload(body)
        });
        mock
    }

    fn run(mock: Arc<MockTransport>) -> Vec<Seen> {
        let client = Arc::new(McuMgrClient::new(mock));
        let (callback, rx) = recorder();
        download(client, TestSource, callback).unwrap();
        until_terminal(&rx)
    }

    #[test]
    fn test_download_assembles_chunks() {
        let file: Vec<u8> = (0..=255).collect();
        let mock = serve(file.clone(), 100);
        let seen = run(mock.clone());

        match seen.last() {
            Some(Seen::Downloaded(data)) => assert_eq!(data, &file),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(seen[0], Seen::Progress(100, 256)));
        assert_eq!(mock.requests().len(), 3);
    }

    #[test]
    fn test_first_response_without_length() {
        let mock = Arc::new(MockTransport::new());
        mock.queue_payload(Payload::new().with("off", 0i64).with("data", vec![1u8, 2]));
        assert!(matches!(
            run(mock).last(),
            Some(Seen::Failed(Error::Format(FormatError::InvalidField("len"))))
        ));
    }

    #[test]
    fn test_empty_data_is_format_error() {
        let mock = Arc::new(MockTransport::new());
        mock.queue_payload(
            Payload::new()
                .with("off", 0i64)
                .with("len", 10i64)
                .with("data", Vec::<u8>::new()),
        );
        assert!(matches!(
            run(mock).last(),
            Some(Seen::Failed(Error::Format(FormatError::InvalidField("data"))))
        ));
    }

    #[test]
    fn test_state_rejects_data_past_end() {
        let mut state = TransferState::default();
        let first = Payload::new().with("len", 4i64).with("data", vec![1u8; 6]);
        // Extra bytes past the declared length are dropped.
        assert!(state.apply(&first).unwrap());
        assert_eq!(state.data, vec![1; 4]);

        let more = Payload::new().with("off", 4i64).with("data", vec![9u8]);
        assert!(matches!(
            state.apply(&more),
            Err(Error::OffsetOutOfRange { offset: 4, total: 4 })
        ));
    }

    #[test]
    fn test_huge_declared_length_is_not_preallocated() {
        let mut state = TransferState::default();
        let first = Payload::new()
            .with("off", 0i64)
            .with("len", i64::MAX)
            .with("data", vec![1u8]);
        assert!(!state.apply(&first).unwrap());
        assert_eq!(state.total, Some(i64::MAX as usize));
        assert!(state.data.capacity() <= MAX_RESERVE);
        assert_eq!(state.data, vec![1]);
    }

    #[test]
    fn test_negative_length_is_rejected() {
        let mut state = TransferState::default();
        let first = Payload::new().with("len", -1i64).with("data", vec![1u8]);
        assert!(matches!(
            state.apply(&first),
            Err(Error::Format(FormatError::InvalidField("len")))
        ));
    }

    #[test]
    fn test_changed_length_fails_download() {
        let mock = Arc::new(MockTransport::new());
        mock.queue_payload(
            Payload::new()
                .with("off", 0i64)
                .with("len", 8i64)
                .with("data", vec![1u8; 4]),
        );
        mock.queue_payload(
            Payload::new()
                .with("off", 4i64)
                .with("len", 6i64)
                .with("data", vec![2u8; 2]),
        );
        let seen = run(mock);
        assert!(matches!(seen[0], Seen::Progress(4, 8)));
        assert!(matches!(
            seen.last(),
            Some(Seen::Failed(Error::Format(FormatError::UnexpectedResponse(_))))
        ));
    }

    #[test]
    fn test_repeated_matching_length_is_accepted() {
        let mut state = TransferState::default();
        let first = Payload::new().with("len", 3i64).with("data", vec![1u8, 2]);
        let second = Payload::new()
            .with("off", 2i64)
            .with("len", 3i64)
            .with("data", vec![3u8]);
        assert!(!state.apply(&first).unwrap());
        assert!(state.apply(&second).unwrap());
        assert_eq!(state.data, vec![1, 2, 3]);
    }

    #[test]
    fn test_transport_error_fails_download() {
        let mock = Arc::new(MockTransport::new());
        mock.queue_error(crate::transport::TransportError::Disconnected);
        let seen = run(mock);
        assert_eq!(seen.len(), 1);
        assert!(matches!(&seen[0], Seen::Failed(e) if e.is_disconnect()));
    }
}
