//! Protocol module - SMP framing and payload definitions.

pub mod codec;
pub mod constants;
pub mod header;
pub mod return_code;
pub mod value;

pub use codec::{CborCodec, CodecError, MapCodec};
pub use constants::*;
pub use header::{Operation, WireHeader};
pub use return_code::ReturnCode;
pub use value::{Payload, Value};
