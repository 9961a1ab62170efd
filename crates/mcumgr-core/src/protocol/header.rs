//! SMP management header.
//!
//! ```text
//! byte 0     : version (bits 3-4) | op (bits 0-2)
//! byte 1     : flags
//! bytes 2-3  : payload length (big-endian)
//! bytes 4-5  : group id (big-endian)
//! byte 6     : sequence number
//! byte 7     : command id
//! ```

use byteorder::{BigEndian, ReadBytesExt};
use std::fmt;
use std::io::Cursor;

use super::constants::{HEADER_LEN, SMP_VERSION_2};
use crate::error::FormatError;

/// Request/response operation carried in the low 3 bits of byte 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    ReadResponse,
    Write,
    WriteResponse,
}

impl Operation {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Operation::Read),
            1 => Some(Operation::ReadResponse),
            2 => Some(Operation::Write),
            3 => Some(Operation::WriteResponse),
            _ => None,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Operation::Read => 0,
            Operation::ReadResponse => 1,
            Operation::Write => 2,
            Operation::WriteResponse => 3,
        }
    }

    /// The op a device answers this request with.
    pub fn response(self) -> Self {
        match self {
            Operation::Read | Operation::ReadResponse => Operation::ReadResponse,
            Operation::Write | Operation::WriteResponse => Operation::WriteResponse,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Read => write!(f, "READ"),
            Operation::ReadResponse => write!(f, "READ_RSP"),
            Operation::Write => write!(f, "WRITE"),
            Operation::WriteResponse => write!(f, "WRITE_RSP"),
        }
    }
}

/// 8-byte SMP header.
///
/// `op` keeps the raw 3-bit value so that decoding never loses information;
/// use [`WireHeader::operation`] for the typed view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireHeader {
    pub version: u8,
    pub op: u8,
    pub flags: u8,
    pub length: u16,
    pub group: u16,
    pub sequence: u8,
    pub command: u8,
}

impl WireHeader {
    pub const SIZE: usize = HEADER_LEN;

    /// Header for a version 2 request.
    pub fn request(op: Operation, length: u16, group: u16, sequence: u8, command: u8) -> Self {
        Self {
            version: SMP_VERSION_2,
            op: op.bits(),
            flags: 0,
            length,
            group,
            sequence,
            command,
        }
    }

    pub fn operation(&self) -> Option<Operation> {
        Operation::from_bits(self.op)
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        encode(
            self.version,
            self.op,
            self.flags,
            self.length,
            self.group,
            self.sequence,
            self.command,
        )
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, FormatError> {
        decode(data)
    }
}

/// Pack header fields into their wire form.
///
/// `version` is truncated to 2 bits and `op` to 3 bits.
pub fn encode(
    version: u8,
    op: u8,
    flags: u8,
    length: u16,
    group: u16,
    sequence: u8,
    command: u8,
) -> [u8; HEADER_LEN] {
    let mut bytes = [0u8; HEADER_LEN];
    bytes[0] = ((version & 0x03) << 3) | (op & 0x07);
    bytes[1] = flags;
    bytes[2..4].copy_from_slice(&length.to_be_bytes());
    bytes[4..6].copy_from_slice(&group.to_be_bytes());
    bytes[6] = sequence;
    bytes[7] = command;
    bytes
}

/// Parse the header at the start of `data`.
pub fn decode(data: &[u8]) -> Result<WireHeader, FormatError> {
    if data.len() < HEADER_LEN {
        return Err(FormatError::BufferTooSmall {
            expected: HEADER_LEN,
            actual: data.len(),
        });
    }
    let mut cursor = Cursor::new(data);
    let first = cursor.read_u8()?;
    Ok(WireHeader {
        version: (first >> 3) & 0x03,
        op: first & 0x07,
        flags: cursor.read_u8()?,
        length: cursor.read_u16::<BigEndian>()?,
        group: cursor.read_u16::<BigEndian>()?,
        sequence: cursor.read_u8()?,
        command: cursor.read_u8()?,
    })
}
