//! Transport layer module.

pub mod mock;
pub mod traits;
pub mod udp;

pub use mock::{MockReply, MockRequest, MockTransport};
pub use traits::{ResponseCallback, SmpTransport, TransportError};
pub use udp::UdpTransport;
