//! TLV trailer parsing.
//!
//! Current images append one or two TLV tables after the image body, each
//! introduced by a 4-byte info record. Legacy images have no info record and
//! the entries simply run to the end of the file.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::FormatError;

/// Info magic of the unprotected (hash/signature) table.
pub const TLV_INFO_MAGIC: u16 = 0x6907;
/// Info magic of the protected table, which precedes the unprotected one.
pub const TLV_PROT_INFO_MAGIC: u16 = 0x6908;

/// SHA-256 entry type used by legacy images.
pub const TLV_TYPE_SHA256_LEGACY: u8 = 0x01;
pub const TLV_TYPE_SHA256: u8 = 0x10;
pub const TLV_TYPE_SHA384: u8 = 0x11;
pub const TLV_TYPE_SHA512: u8 = 0x12;

const TLV_ENTRY_HEADER: usize = 4;

/// TLV table info record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvInfo {
    pub magic: u16,
    /// Size of the whole table, info record included.
    pub total_length: u16,
}

impl TlvInfo {
    pub const SIZE: usize = 4;

    pub fn is_protected(&self) -> bool {
        self.magic == TLV_PROT_INFO_MAGIC
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvEntry {
    pub kind: u8,
    pub length: u16,
    pub value: Vec<u8>,
}

/// One parsed TLV table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvTable {
    pub info: Option<TlvInfo>,
    pub entries: Vec<TlvEntry>,
}

impl TlvTable {
    pub fn is_protected(&self) -> bool {
        self.info.is_some_and(|info| info.is_protected())
    }

    pub fn find(&self, kind: u8) -> Option<&TlvEntry> {
        self.entries.iter().find(|e| e.kind == kind)
    }
}

/// Parse a TLV table starting at `offset`.
pub fn parse_tlv_table(
    data: &[u8],
    offset: usize,
    is_legacy: bool,
) -> Result<TlvTable, FormatError> {
    let (info, mut pos, end) = if is_legacy {
        (None, offset, data.len())
    } else {
        let available = data.len().saturating_sub(offset);
        if available < TlvInfo::SIZE {
            return Err(FormatError::BufferTooSmall {
                expected: TlvInfo::SIZE,
                actual: available,
            });
        }
        let magic = LittleEndian::read_u16(&data[offset..]);
        if magic != TLV_INFO_MAGIC && magic != TLV_PROT_INFO_MAGIC {
            return Err(FormatError::InvalidTlvMagic { actual: magic });
        }
        let total_length = LittleEndian::read_u16(&data[offset + 2..]);
        let info = TlvInfo {
            magic,
            total_length,
        };
        (
            Some(info),
            offset + TlvInfo::SIZE,
            offset + total_length as usize,
        )
    };

    let mut entries = Vec::new();
    // Strictly less-than: a trailing record of exactly one entry header is
    // not read.
    while pos + TLV_ENTRY_HEADER < end {
        if pos + TLV_ENTRY_HEADER > data.len() {
            return Err(FormatError::TruncatedTlv {
                offset: pos,
                needed: TLV_ENTRY_HEADER,
                available: data.len().saturating_sub(pos),
            });
        }
        let kind = data[pos];
        let length = LittleEndian::read_u16(&data[pos + 2..]);
        let start = pos + TLV_ENTRY_HEADER;
        let stop = start + length as usize;
        if stop > data.len() {
            return Err(FormatError::TruncatedTlv {
                offset: pos,
                needed: TLV_ENTRY_HEADER + length as usize,
                available: data.len() - pos,
            });
        }
        entries.push(TlvEntry {
            kind,
            length,
            value: data[start..stop].to_vec(),
        });
        pos = stop;
    }

    Ok(TlvTable { info, entries })
}

/// Return the value of the first hash entry, in table order.
///
/// The first match wins even when a stronger digest follows it.
pub fn extract_hash(entries: &[TlvEntry], is_legacy: bool) -> Option<&[u8]> {
    let sha256 = if is_legacy {
        TLV_TYPE_SHA256_LEGACY
    } else {
        TLV_TYPE_SHA256
    };
    entries
        .iter()
        .find(|e| e.kind == TLV_TYPE_SHA512 || e.kind == TLV_TYPE_SHA384 || e.kind == sha256)
        .map(|e| e.value.as_slice())
}
