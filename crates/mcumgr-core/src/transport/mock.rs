//! Mock SMP transport for testing.

use std::collections::VecDeque;
use std::sync::Mutex;

use super::traits::{SmpTransport, TransportError};
use crate::protocol::codec::{CborCodec, MapCodec};
use crate::protocol::constants::DEFAULT_MTU;
use crate::protocol::header::WireHeader;
use crate::protocol::value::Payload;

/// A request as seen by the mock device.
#[derive(Debug, Clone)]
pub struct MockRequest {
    pub header: WireHeader,
    pub payload: Payload,
}

impl MockRequest {
    pub fn is(&self, group: u16, command: u8) -> bool {
        self.header.group == group && self.header.command == command
    }
}

/// What the mock device answers with.
#[derive(Debug)]
pub enum MockReply {
    /// Well-formed response frame carrying this body.
    Payload(Payload),
    /// Raw bytes, returned verbatim.
    Raw(Vec<u8>),
    /// Transport-level failure.
    Error(TransportError),
}

type Responder = Box<dyn FnMut(&MockRequest) -> MockReply + Send>;

/// Mock transport for unit testing client and flow logic.
///
/// Queued replies are consumed first; once the queue is empty the responder
/// (if any) acts as the device.
pub struct MockTransport {
    replies: Mutex<VecDeque<MockReply>>,
    responder: Mutex<Option<Responder>>,
    write_log: Mutex<Vec<Vec<u8>>>,
    connected: Mutex<bool>,
    mtu: usize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_mtu(DEFAULT_MTU)
    }

    pub fn with_mtu(mtu: usize) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            responder: Mutex::new(None),
            write_log: Mutex::new(Vec::new()),
            connected: Mutex::new(true),
            mtu,
        }
    }

    /// Queue a response body for the next request.
    pub fn queue_payload(&self, payload: Payload) {
        self.queue(MockReply::Payload(payload));
    }

    /// Queue a transport error for the next request.
    pub fn queue_error(&self, error: TransportError) {
        self.queue(MockReply::Error(error));
    }

    pub fn queue(&self, reply: MockReply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    /// Install a fake device used when the reply queue is empty.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&MockRequest) -> MockReply + Send + 'static,
    {
        *self.responder.lock().unwrap() = Some(Box::new(responder));
    }

    /// Get all captured frames.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().unwrap().clone()
    }

    /// Captured frames, decoded.
    pub fn requests(&self) -> Vec<MockRequest> {
        self.get_writes()
            .iter()
            .filter_map(|frame| decode_request(frame))
            .collect()
    }

    pub fn clear_writes(&self) {
        self.write_log.lock().unwrap().clear();
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        *self.connected.lock().unwrap() = true;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_request(frame: &[u8]) -> Option<MockRequest> {
    let header = WireHeader::from_bytes(frame).ok()?;
    let payload = CborCodec.decode(&frame[WireHeader::SIZE..]).ok()?;
    Some(MockRequest { header, payload })
}

fn response_frame(request: &WireHeader, body: &Payload) -> Result<Vec<u8>, TransportError> {
    let body = CborCodec
        .encode(body)
        .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
    let op = request
        .operation()
        .map_or(request.op, |op| op.response().bits());
    let header = WireHeader {
        op,
        length: body.len() as u16,
        ..*request
    };
    let mut frame = header.to_bytes().to_vec();
    frame.extend(body);
    Ok(frame)
}

impl SmpTransport for MockTransport {
    fn send(&self, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        self.write_log.lock().unwrap().push(frame.to_vec());

        let request = decode_request(frame).ok_or_else(|| {
            TransportError::SendFailed("mock device could not decode request".into())
        })?;

        let queued = self.replies.lock().unwrap().pop_front();
        let reply = match queued {
            Some(reply) => reply,
            None => match self.responder.lock().unwrap().as_mut() {
                Some(responder) => responder(&request),
                None => return Err(TransportError::Timeout { timeout_ms: 5000 }),
            },
        };

        match reply {
            MockReply::Payload(body) => response_frame(&request.header, &body),
            MockReply::Raw(bytes) => Ok(bytes),
            MockReply::Error(e) => Err(e),
        }
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }
}

/// Default-operation request frame, for tests that bypass the client.
#[cfg(test)]
pub(crate) fn request_frame(
    op: crate::protocol::header::Operation,
    group: u16,
    command: u8,
    body: &Payload,
) -> Vec<u8> {
    let body = CborCodec.encode(body).unwrap();
    let mut frame = WireHeader::request(op, body.len() as u16, group, 0, command)
        .to_bytes()
        .to_vec();
    frame.extend(body);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::header::Operation;

    #[test]
    fn test_mock_reply_queue() {
        let mock = MockTransport::new();
        mock.queue_payload(Payload::new().with("rc", 0i64));
        mock.queue_error(TransportError::Disconnected);

        let frame = request_frame(Operation::Read, 1, 0, &Payload::new());
        let response = mock.send(&frame).unwrap();
        let header = WireHeader::from_bytes(&response).unwrap();
        assert_eq!(header.operation(), Some(Operation::ReadResponse));
        assert_eq!(header.group, 1);

        assert!(matches!(mock.send(&frame), Err(TransportError::Disconnected)));
        // Queue is empty and no responder: timeout.
        assert!(matches!(
            mock.send(&frame),
            Err(TransportError::Timeout { .. })
        ));
    }

    #[test]
    fn test_mock_responder() {
        let mock = MockTransport::new();
        mock.set_responder(|req| {
            MockReply::Payload(Payload::new().with("echo", req.header.command as i64))
        });
        let frame = request_frame(Operation::Write, 0, 5, &Payload::new());
        let response = mock.send(&frame).unwrap();
        let body = CborCodec.decode(&response[WireHeader::SIZE..]).unwrap();
        assert_eq!(body.int("echo"), Some(5));
        assert_eq!(mock.requests().len(), 1);
        assert!(mock.requests()[0].is(0, 5));
    }

    #[test]
    fn test_mock_disconnect() {
        let mock = MockTransport::new();
        assert!(mock.is_connected());

        mock.disconnect();
        assert!(!mock.is_connected());
        let frame = request_frame(Operation::Read, 0, 0, &Payload::new());
        assert!(mock.send(&frame).is_err());
        assert!(mock.get_writes().is_empty());
    }
}
