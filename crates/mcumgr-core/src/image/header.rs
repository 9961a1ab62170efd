//! MCUboot image header.
//!
//! All fields are little-endian.
//!
//! ```text
//! 0x00  magic            u32
//! 0x04  load address     u32
//! 0x08  header size      u16
//! 0x0A  protect TLV size u16
//! 0x0C  image size       u32
//! 0x10  flags            u32
//! 0x14  version          8 bytes (major u8, minor u8, revision u16, build u32)
//! ```

use byteorder::{LittleEndian, ReadBytesExt};
use std::fmt;
use std::io::Cursor;

use crate::error::FormatError;

/// Current MCUboot header magic.
pub const IMAGE_MAGIC: u32 = 0x96F3_B83D;
/// Pre-1.0 MCUboot header magic.
pub const IMAGE_MAGIC_LEGACY: u32 = 0x96F3_B83C;

/// Image version (`major.minor.revision+build`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageVersion {
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
    pub build_num: u32,
}

impl ImageVersion {
    pub const SIZE: usize = 8;

    pub fn parse(data: &[u8], offset: usize) -> Result<Self, FormatError> {
        parse_version(data, offset)
    }
}

impl fmt::Display for ImageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}+{}",
            self.major, self.minor, self.revision, self.build_num
        )
    }
}

/// Fixed image header at the start of every MCUboot image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub magic: u32,
    pub load_addr: u32,
    pub header_size: u16,
    pub protect_tlv_size: u16,
    pub image_size: u32,
    pub flags: u32,
    pub version: ImageVersion,
}

impl ImageHeader {
    /// Fixed fields plus trailing padding, version record excluded.
    pub const FIXED_SIZE: usize = 24;
    pub const VERSION_OFFSET: usize = 0x14;
    /// Minimum bytes `parse_header` needs.
    pub const SIZE: usize = Self::FIXED_SIZE + ImageVersion::SIZE;

    pub fn parse(data: &[u8], offset: usize) -> Result<Self, FormatError> {
        parse_header(data, offset)
    }

    /// Whether the header was written by a pre-1.0 image tool, which also
    /// changes the TLV trailer layout.
    pub fn is_legacy(&self) -> bool {
        self.magic == IMAGE_MAGIC_LEGACY
    }
}

/// Parse the image header at `offset`.
pub fn parse_header(data: &[u8], offset: usize) -> Result<ImageHeader, FormatError> {
    let available = data.len().saturating_sub(offset);
    if available < ImageHeader::SIZE {
        return Err(FormatError::BufferTooSmall {
            expected: ImageHeader::SIZE,
            actual: available,
        });
    }

    let mut cursor = Cursor::new(&data[offset..]);
    let magic = cursor.read_u32::<LittleEndian>()?;
    if magic != IMAGE_MAGIC && magic != IMAGE_MAGIC_LEGACY {
        return Err(FormatError::InvalidMagic { actual: magic });
    }

    let load_addr = cursor.read_u32::<LittleEndian>()?;
    let header_size = cursor.read_u16::<LittleEndian>()?;
    let protect_tlv_size = cursor.read_u16::<LittleEndian>()?;
    let image_size = cursor.read_u32::<LittleEndian>()?;
    let flags = cursor.read_u32::<LittleEndian>()?;
    let version = parse_version(data, offset + ImageHeader::VERSION_OFFSET)?;

    Ok(ImageHeader {
        magic,
        load_addr,
        header_size,
        protect_tlv_size,
        image_size,
        flags,
        version,
    })
}

/// Parse an 8-byte version record at `offset`.
pub fn parse_version(data: &[u8], offset: usize) -> Result<ImageVersion, FormatError> {
    let available = data.len().saturating_sub(offset);
    if available < ImageVersion::SIZE {
        return Err(FormatError::BufferTooSmall {
            expected: ImageVersion::SIZE,
            actual: available,
        });
    }
    let mut cursor = Cursor::new(&data[offset..]);
    Ok(ImageVersion {
        major: cursor.read_u8()?,
        minor: cursor.read_u8()?,
        revision: cursor.read_u16::<LittleEndian>()?,
        build_num: cursor.read_u32::<LittleEndian>()?,
    })
}
