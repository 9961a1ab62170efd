//! SMP client: request framing, response validation and return-code mapping.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tracing::{debug, trace};

use crate::error::{Error, FormatError, Result};
use crate::protocol::codec::{CborCodec, CodecError, MapCodec};
use crate::protocol::header::{Operation, WireHeader};
use crate::protocol::value::Payload;
use crate::transport::SmpTransport;

/// Request/response client over an [`SmpTransport`].
///
/// The codec is injected; [`McuMgrClient::new`] uses CBOR.
pub struct McuMgrClient {
    transport: Arc<dyn SmpTransport>,
    codec: Arc<dyn MapCodec>,
    sequence: AtomicU8,
}

impl McuMgrClient {
    pub fn new(transport: Arc<dyn SmpTransport>) -> Self {
        Self::with_codec(transport, Arc::new(CborCodec))
    }

    pub fn with_codec(transport: Arc<dyn SmpTransport>, codec: Arc<dyn MapCodec>) -> Self {
        Self {
            transport,
            codec,
            sequence: AtomicU8::new(0),
        }
    }

    pub fn codec(&self) -> &dyn MapCodec {
        self.codec.as_ref()
    }

    pub fn transport(&self) -> &Arc<dyn SmpTransport> {
        &self.transport
    }

    /// Largest frame the transport accepts.
    pub fn mtu(&self) -> usize {
        self.transport.mtu()
    }

    /// Encode `payload` and prepend a v2 header with the next sequence number.
    pub fn frame(
        &self,
        op: Operation,
        group: u16,
        command: u8,
        payload: &Payload,
    ) -> Result<(WireHeader, Vec<u8>)> {
        let body = self.codec.encode(payload)?;
        let length = u16::try_from(body.len()).map_err(|_| {
            CodecError::Encode(format!("{}-byte body exceeds header length field", body.len()))
        })?;
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let header = WireHeader::request(op, length, group, sequence, command);

        let mut frame = Vec::with_capacity(WireHeader::SIZE + body.len());
        frame.extend_from_slice(&header.to_bytes());
        frame.extend(body);
        Ok((header, frame))
    }

    /// Send a request and wait for the validated response body.
    pub fn send(
        &self,
        op: Operation,
        group: u16,
        command: u8,
        payload: &Payload,
    ) -> Result<Payload> {
        let (header, frame) = self.frame(op, group, command, payload)?;
        trace!(%op, group, command, seq = header.sequence, len = frame.len(), "SMP request");
        let response = self.transport.send(&frame)?;
        self.parse_response(&header, &response)
    }

    /// Send a request; `on_response` receives the validated response body.
    ///
    /// Depending on the transport the callback may run before this returns.
    pub fn send_async<F>(
        &self,
        op: Operation,
        group: u16,
        command: u8,
        payload: &Payload,
        on_response: F,
    ) where
        F: FnOnce(Result<Payload>) + Send + 'static,
    {
        let (header, frame) = match self.frame(op, group, command, payload) {
            Ok(framed) => framed,
            Err(e) => return on_response(Err(e)),
        };
        trace!(%op, group, command, seq = header.sequence, len = frame.len(), "SMP request (async)");

        let codec = Arc::clone(&self.codec);
        self.transport.send_async(
            frame,
            Box::new(move |result| {
                let parsed = result
                    .map_err(Error::from)
                    .and_then(|bytes| validate_response(codec.as_ref(), &header, &bytes));
                on_response(parsed);
            }),
        );
    }

    /// Validate a response frame against the request it answers.
    pub fn parse_response(&self, request: &WireHeader, response: &[u8]) -> Result<Payload> {
        validate_response(self.codec.as_ref(), request, response)
    }
}

fn validate_response(
    codec: &dyn MapCodec,
    request: &WireHeader,
    response: &[u8],
) -> Result<Payload> {
    let header = WireHeader::from_bytes(response)?;

    let expected_op = request.operation().map(Operation::response);
    if header.operation() != expected_op {
        return Err(FormatError::UnexpectedResponse(format!(
            "op {} for request op {}",
            header.op, request.op
        ))
        .into());
    }
    if header.group != request.group || header.command != request.command {
        return Err(FormatError::UnexpectedResponse(format!(
            "group {} command {} for request group {} command {}",
            header.group, header.command, request.group, request.command
        ))
        .into());
    }

    let body = &response[WireHeader::SIZE..];
    let length = header.length as usize;
    if body.len() < length {
        return Err(FormatError::BufferTooSmall {
            expected: length,
            actual: body.len(),
        }
        .into());
    }

    let payload = codec.decode(&body[..length])?;
    check_return_code(&payload)?;
    debug!(
        group = header.group,
        command = header.command,
        seq = header.sequence,
        "SMP response OK"
    );
    Ok(payload)
}

/// Map a non-zero `rc` (SMP v1) or `err.rc` (SMP v2) to [`Error::Device`].
pub fn check_return_code(payload: &Payload) -> Result<()> {
    if let Some(code) = payload.int("rc").filter(|rc| *rc != 0) {
        return Err(Error::Device { code, group: None });
    }
    if let Some(err) = payload.map("err") {
        if let Some(code) = err.int("rc").filter(|rc| *rc != 0) {
            let group = err.int("group").and_then(|g| u16::try_from(g).ok());
            return Err(Error::Device { code, group });
        }
    }
    Ok(())
}
