//! Image management group (MCUboot slots).

use std::fmt;
use std::sync::Arc;

use crate::client::McuMgrClient;
use crate::error::{FormatError, Result};
use crate::protocol::constants::{GROUP_IMAGE, IMAGE_ERASE, IMAGE_STATE, IMAGE_UPLOAD};
use crate::protocol::header::Operation;
use crate::protocol::value::{Payload, Value};
use crate::transfer::UploadTarget;

/// One entry of the device's image list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageSlot {
    pub image: u32,
    pub slot: u32,
    pub version: String,
    pub hash: Vec<u8>,
    pub bootable: bool,
    pub pending: bool,
    pub confirmed: bool,
    pub active: bool,
    pub permanent: bool,
}

impl ImageSlot {
    fn from_value(value: &Value) -> Result<Self> {
        let map = value.as_map().ok_or(FormatError::InvalidField("images"))?;
        let flag = |key: &str| map.bool(key).unwrap_or(false);
        Ok(Self {
            image: match map.int("image") {
                None => 0,
                Some(image) => u32::try_from(image).map_err(|_| FormatError::InvalidField("image"))?,
            },
            slot: map
                .int("slot")
                .and_then(|s| u32::try_from(s).ok())
                .ok_or(FormatError::InvalidField("slot"))?,
            version: map.text("version").unwrap_or_default().to_string(),
            hash: map.bytes("hash").map(<[u8]>::to_vec).unwrap_or_default(),
            bootable: flag("bootable"),
            pending: flag("pending"),
            confirmed: flag("confirmed"),
            active: flag("active"),
            permanent: flag("permanent"),
        })
    }
}

impl fmt::Display for ImageSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "image={} slot={} version={}", self.image, self.slot, self.version)?;
        let flags: Vec<&str> = [
            (self.bootable, "bootable"),
            (self.pending, "pending"),
            (self.confirmed, "confirmed"),
            (self.active, "active"),
            (self.permanent, "permanent"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
        .collect();
        if !flags.is_empty() {
            write!(f, " [{}]", flags.join(" "))?;
        }
        Ok(())
    }
}

/// Response to an image state read or write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageStateResponse {
    pub slots: Vec<ImageSlot>,
    pub split_status: Option<i64>,
}

impl ImageStateResponse {
    pub fn from_payload(payload: &Payload) -> Result<Self> {
        let images = payload
            .array("images")
            .ok_or(FormatError::InvalidField("images"))?;
        Ok(Self {
            slots: images.iter().map(ImageSlot::from_value).collect::<Result<_>>()?,
            split_status: payload.int("splitStatus"),
        })
    }

    /// Slot `slot` of image `image`.
    pub fn slot(&self, image: u32, slot: u32) -> Option<&ImageSlot> {
        self.slots
            .iter()
            .find(|s| s.image == image && s.slot == slot)
    }
}

/// Image group requests.
#[derive(Clone)]
pub struct ImageManager {
    client: Arc<McuMgrClient>,
}

impl ImageManager {
    pub fn new(client: Arc<McuMgrClient>) -> Self {
        Self { client }
    }

    /// List image slots.
    pub fn state(&self) -> Result<ImageStateResponse> {
        let body = self
            .client
            .send(Operation::Read, GROUP_IMAGE, IMAGE_STATE, &Payload::new())?;
        ImageStateResponse::from_payload(&body)
    }

    pub fn state_async<F>(&self, on_response: F)
    where
        F: FnOnce(Result<ImageStateResponse>) + Send + 'static,
    {
        self.request_state(Operation::Read, Payload::new(), on_response);
    }

    /// Mark the image with `hash` for a test boot on next reset.
    pub fn test(&self, hash: &[u8]) -> Result<ImageStateResponse> {
        let body = self
            .client
            .send(Operation::Write, GROUP_IMAGE, IMAGE_STATE, &test_request(hash))?;
        ImageStateResponse::from_payload(&body)
    }

    pub fn test_async<F>(&self, hash: &[u8], on_response: F)
    where
        F: FnOnce(Result<ImageStateResponse>) + Send + 'static,
    {
        self.request_state(Operation::Write, test_request(hash), on_response);
    }

    /// Confirm the image with `hash`, or the running image when `None`.
    pub fn confirm(&self, hash: Option<&[u8]>) -> Result<ImageStateResponse> {
        let body = self.client.send(
            Operation::Write,
            GROUP_IMAGE,
            IMAGE_STATE,
            &confirm_request(hash),
        )?;
        ImageStateResponse::from_payload(&body)
    }

    pub fn confirm_async<F>(&self, hash: Option<&[u8]>, on_response: F)
    where
        F: FnOnce(Result<ImageStateResponse>) + Send + 'static,
    {
        self.request_state(Operation::Write, confirm_request(hash), on_response);
    }

    /// Erase a slot (the secondary slot when `None`).
    pub fn erase(&self, slot: Option<u32>) -> Result<()> {
        let mut request = Payload::new();
        if let Some(slot) = slot {
            request.insert("slot", slot);
        }
        self.client
            .send(Operation::Write, GROUP_IMAGE, IMAGE_ERASE, &request)?;
        Ok(())
    }

    fn request_state<F>(&self, op: Operation, request: Payload, on_response: F)
    where
        F: FnOnce(Result<ImageStateResponse>) + Send + 'static,
    {
        self.client
            .send_async(op, GROUP_IMAGE, IMAGE_STATE, &request, move |result| {
                on_response(result.and_then(|body| ImageStateResponse::from_payload(&body)))
            });
    }
}

fn test_request(hash: &[u8]) -> Payload {
    Payload::new().with("hash", hash).with("confirm", false)
}

fn confirm_request(hash: Option<&[u8]>) -> Payload {
    let mut request = Payload::new().with("confirm", true);
    if let Some(hash) = hash {
        request.insert("hash", hash);
    }
    request
}

/// Image upload chunks. The first chunk also carries the total length and
/// the image hash.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub image: u32,
    pub sha: Vec<u8>,
}

impl UploadTarget for ImageUpload {
    fn group(&self) -> u16 {
        GROUP_IMAGE
    }

    fn command(&self) -> u8 {
        IMAGE_UPLOAD
    }

    fn chunk_request(&self, chunk: &[u8], offset: usize, total: usize) -> Payload {
        let mut request = Payload::new().with("off", offset).with("data", chunk);
        if offset == 0 {
            request.insert("len", total);
            request.insert("sha", self.sha.as_slice());
            if self.image != 0 {
                request.insert("image", self.image);
            }
        }
        request
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn slot(slot: u32, pending: bool, confirmed: bool) -> Value {
        Value::Map(
            Payload::new()
                .with("image", 0i64)
                .with("slot", slot)
                .with("version", "1.0.0")
                .with("hash", vec![slot as u8; 32])
                .with("bootable", true)
                .with("pending", pending)
                .with("confirmed", confirmed)
                .with("active", slot == 0),
        )
    }

    pub fn state(slots: Vec<Value>) -> Payload {
        Payload::new().with("images", Value::Array(slots))
    }
}
