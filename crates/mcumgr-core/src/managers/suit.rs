//! SUIT management group.
//!
//! Envelope upload starts (or stages, with deferred install) a manifest
//! update. The device may then ask for resources it cannot find itself;
//! [`SuitManager::poll_missing_image`] reports the next one and
//! [`ResourceUpload`] delivers it.

use std::sync::Arc;

use crate::client::McuMgrClient;
use crate::error::{Error, FormatError, Result};
use crate::protocol::constants::{
    GROUP_SUIT, SUIT_CACHE_RAW_UPLOAD, SUIT_CLEANUP, SUIT_ENVELOPE_UPLOAD, SUIT_MANIFEST_LIST,
    SUIT_MISSING_IMAGE_STATE, SUIT_MISSING_IMAGE_UPLOAD,
};
use crate::protocol::header::Operation;
use crate::protocol::value::Payload;
use crate::transfer::UploadTarget;

/// A manifest known to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestInfo {
    pub role: i64,
}

/// A resource the device asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingResource {
    pub session_id: i64,
    pub uri: String,
}

impl MissingResource {
    /// `None` when the device is not waiting for anything.
    pub fn from_payload(payload: &Payload) -> Result<Option<Self>> {
        let uri = match payload.get("resource_id") {
            None => return Ok(None),
            Some(value) => value
                .as_bytes()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .or_else(|| value.as_text().map(str::to_string))
                .ok_or(FormatError::InvalidField("resource_id"))?,
        };
        if uri.is_empty() {
            return Ok(None);
        }
        let session_id = payload
            .int("stream_session_id")
            .ok_or(FormatError::InvalidField("stream_session_id"))?;
        Ok(Some(Self { session_id, uri }))
    }
}

#[derive(Clone)]
pub struct SuitManager {
    client: Arc<McuMgrClient>,
}

impl SuitManager {
    pub fn new(client: Arc<McuMgrClient>) -> Self {
        Self { client }
    }

    pub fn manifest_list(&self) -> Result<Vec<ManifestInfo>> {
        let body = self.client.send(
            Operation::Read,
            GROUP_SUIT,
            SUIT_MANIFEST_LIST,
            &Payload::new(),
        )?;
        let manifests = body
            .array("manifests")
            .ok_or(FormatError::InvalidField("manifests"))?;
        manifests
            .iter()
            .map(|m| {
                m.as_map()
                    .and_then(|m| m.int("role"))
                    .map(|role| ManifestInfo { role })
                    .ok_or_else(|| Error::from(FormatError::InvalidField("role")))
            })
            .collect()
    }

    /// Ask which resource the device needs next.
    pub fn poll_missing_image(&self) -> Result<Option<MissingResource>> {
        let body = self.client.send(
            Operation::Read,
            GROUP_SUIT,
            SUIT_MISSING_IMAGE_STATE,
            &Payload::new(),
        )?;
        MissingResource::from_payload(&body)
    }

    pub fn poll_missing_image_async<F>(&self, on_response: F)
    where
        F: FnOnce(Result<Option<MissingResource>>) + Send + 'static,
    {
        self.client.send_async(
            Operation::Read,
            GROUP_SUIT,
            SUIT_MISSING_IMAGE_STATE,
            &Payload::new(),
            move |result| {
                on_response(result.and_then(|body| MissingResource::from_payload(&body)))
            },
        );
    }

    /// Start processing an envelope uploaded with deferred install.
    pub fn begin_install(&self) -> Result<()> {
        self.client.send(
            Operation::Write,
            GROUP_SUIT,
            SUIT_ENVELOPE_UPLOAD,
            &begin_install_request(),
        )?;
        Ok(())
    }

    pub fn begin_install_async<F>(&self, on_response: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.client.send_async(
            Operation::Write,
            GROUP_SUIT,
            SUIT_ENVELOPE_UPLOAD,
            &begin_install_request(),
            move |result| on_response(result.map(|_| ())),
        );
    }

    /// Drop staged envelopes and cache contents.
    pub fn cleanup(&self) -> Result<()> {
        self.client
            .send(Operation::Write, GROUP_SUIT, SUIT_CLEANUP, &Payload::new())?;
        Ok(())
    }
}

/// Zero-length envelope upload: install what has been staged.
fn begin_install_request() -> Payload {
    Payload::new()
        .with("off", 0i64)
        .with("len", 0i64)
        .with("data", Vec::<u8>::new())
}

fn chunk(chunk: &[u8], offset: usize, total: usize) -> Payload {
    let mut request = Payload::new().with("off", offset).with("data", chunk);
    if offset == 0 {
        request.insert("len", total);
    }
    request
}

/// SUIT envelope upload.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeUpload {
    /// Stage only; processing starts on [`SuitManager::begin_install`].
    pub defer_install: bool,
}

impl UploadTarget for EnvelopeUpload {
    fn group(&self) -> u16 {
        GROUP_SUIT
    }

    fn command(&self) -> u8 {
        SUIT_ENVELOPE_UPLOAD
    }

    fn chunk_request(&self, data: &[u8], offset: usize, total: usize) -> Payload {
        let mut request = chunk(data, offset, total);
        if offset == 0 && self.defer_install {
            request.insert("defer_install", true);
        }
        request
    }
}

/// Upload of a resource the device requested.
#[derive(Debug, Clone, Copy)]
pub struct ResourceUpload {
    pub session_id: i64,
}

impl UploadTarget for ResourceUpload {
    fn group(&self) -> u16 {
        GROUP_SUIT
    }

    fn command(&self) -> u8 {
        SUIT_MISSING_IMAGE_UPLOAD
    }

    fn chunk_request(&self, data: &[u8], offset: usize, total: usize) -> Payload {
        chunk(data, offset, total).with("stream_session_id", self.session_id)
    }
}

/// Raw upload into a device cache partition.
#[derive(Debug, Clone, Copy)]
pub struct CacheUpload {
    pub target_id: u32,
}

impl UploadTarget for CacheUpload {
    fn group(&self) -> u16 {
        GROUP_SUIT
    }

    fn command(&self) -> u8 {
        SUIT_CACHE_RAW_UPLOAD
    }

    fn chunk_request(&self, data: &[u8], offset: usize, total: usize) -> Payload {
        let mut request = chunk(data, offset, total);
        if offset == 0 {
            request.insert("target_id", self.target_id);
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::value::Value;
    use crate::transport::MockTransport;

    fn manager() -> (Arc<MockTransport>, SuitManager) {
        let mock = Arc::new(MockTransport::new());
        let client = Arc::new(McuMgrClient::new(mock.clone()));
        (mock, SuitManager::new(client))
    }

    #[test]
    fn test_poll_missing_image() {
        let (mock, suit) = manager();
        mock.queue_payload(
            Payload::new()
                .with("stream_session_id", 12i64)
                .with("resource_id", b"file://app.bin".as_slice()),
        );
        mock.queue_payload(Payload::new());

        assert_eq!(
            suit.poll_missing_image().unwrap(),
            Some(MissingResource {
                session_id: 12,
                uri: "file://app.bin".into()
            })
        );
        assert_eq!(suit.poll_missing_image().unwrap(), None);
    }

    #[test]
    fn test_missing_resource_without_session() {
        let payload = Payload::new().with("resource_id", "file://a.bin");
        assert!(MissingResource::from_payload(&payload).is_err());
        let empty = Payload::new().with("resource_id", Vec::<u8>::new());
        assert_eq!(MissingResource::from_payload(&empty).unwrap(), None);
    }

    #[test]
    fn test_manifest_list() {
        let (mock, suit) = manager();
        let manifest = |role: i64| Value::Map(Payload::new().with("role", role));
        mock.queue_payload(
            Payload::new().with("manifests", Value::Array(vec![manifest(0x10), manifest(0x20)])),
        );
        let roles: Vec<i64> = suit
            .manifest_list()
            .unwrap()
            .iter()
            .map(|m| m.role)
            .collect();
        assert_eq!(roles, vec![0x10, 0x20]);
    }

    #[test]
    fn test_chunk_requests() {
        let envelope = EnvelopeUpload {
            defer_install: true,
        };
        assert_eq!(envelope.chunk_request(&[1], 0, 9).bool("defer_install"), Some(true));
        assert!(!envelope.chunk_request(&[1], 1, 9).contains("defer_install"));

        let resource = ResourceUpload { session_id: 3 };
        let later = resource.chunk_request(&[1], 5, 9);
        assert_eq!(later.int("stream_session_id"), Some(3));
        assert!(!later.contains("len"));

        let cache = CacheUpload { target_id: 2 };
        assert_eq!(cache.chunk_request(&[], 0, 9).int("target_id"), Some(2));
    }

    #[test]
    fn test_begin_install_request() {
        let (mock, suit) = manager();
        mock.queue_payload(Payload::new());
        suit.begin_install().unwrap();
        let request = &mock.requests()[0];
        assert!(request.is(GROUP_SUIT, SUIT_ENVELOPE_UPLOAD));
        assert_eq!(request.payload.int("len"), Some(0));
    }
}
