//! SMP transport abstraction.
//!
//! Defines the `SmpTransport` trait for request/response exchange,
//! allowing different implementations (UDP, mock, BLE bridges, etc.).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open transport: {0}")]
    OpenFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Completion for [`SmpTransport::send_async`].
pub type ResponseCallback = Box<dyn FnOnce(Result<Vec<u8>, TransportError>) + Send>;

/// Abstract SMP transport.
///
/// A transport moves whole SMP frames: fragmentation, reassembly and pairing
/// of responses to requests happen below this trait.
pub trait SmpTransport: Send + Sync {
    /// Send one frame and wait for its response frame.
    fn send(&self, frame: &[u8]) -> Result<Vec<u8>, TransportError>;

    /// Send one frame; `on_response` runs when the response arrives.
    ///
    /// The default answers inline through [`SmpTransport::send`], so the
    /// callback may run before this returns.
    fn send_async(&self, frame: Vec<u8>, on_response: ResponseCallback) {
        on_response(self.send(&frame));
    }

    /// Largest frame the link accepts, header included.
    fn mtu(&self) -> usize;

    /// Check if the link is still up.
    fn is_connected(&self) -> bool {
        true
    }
}
