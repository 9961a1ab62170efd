//! Firmware image formats.
//!
//! - **MCUboot**: fixed header, image body, TLV trailer carrying the hash
//! - **SUIT**: CBOR envelope; only its digest is extracted here

pub mod header;
pub mod manifest;
pub mod tlv;

pub use header::{IMAGE_MAGIC, IMAGE_MAGIC_LEGACY, ImageHeader, ImageVersion, parse_header, parse_version};
pub use manifest::{detect_manifest_image, is_manifest_image};
pub use tlv::{TlvEntry, TlvInfo, TlvTable, extract_hash, parse_tlv_table};

use tracing::debug;

use crate::error::ImageError;

/// A validated MCUboot image.
#[derive(Debug, Clone)]
pub struct ParsedImage {
    header: ImageHeader,
    protected_tlv: Option<TlvTable>,
    tlv: TlvTable,
    hash: Vec<u8>,
    data: Vec<u8>,
}

impl ParsedImage {
    /// Parse and validate an image; fails unless a hash TLV is present.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, ImageError> {
        let header = parse_header(&data, 0)?;
        let is_legacy = header.is_legacy();
        let mut offset = header.header_size as usize + header.image_size as usize;

        let mut table = parse_tlv_table(&data, offset, is_legacy)?;
        let mut protected_tlv = None;
        if table.is_protected() {
            // Protected entries are covered by the signature; the hash lives
            // in the unprotected table right after.
            offset += table.info.map_or(0, |info| info.total_length as usize);
            protected_tlv = Some(table);
            table = parse_tlv_table(&data, offset, is_legacy)?;
        }

        let hash = extract_hash(&table.entries, is_legacy)
            .ok_or(ImageError::NoHashFound)?
            .to_vec();

        debug!(
            version = %header.version,
            image_size = header.image_size,
            legacy = is_legacy,
            tlv_entries = table.entries.len(),
            "Parsed image"
        );

        Ok(Self {
            header,
            protected_tlv,
            tlv: table,
            hash,
            data,
        })
    }

    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    pub fn protected_tlv(&self) -> Option<&TlvTable> {
        self.protected_tlv.as_ref()
    }

    pub fn tlv(&self) -> &TlvTable {
        &self.tlv
    }

    pub fn hash(&self) -> &[u8] {
        &self.hash
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Parse `data` as an MCUboot image.
pub fn parse_image(data: &[u8]) -> Result<ParsedImage, ImageError> {
    ParsedImage::from_bytes(data.to_vec())
}

/// An update file of either supported format.
#[derive(Debug, Clone)]
pub enum FirmwareImage {
    McuBoot(ParsedImage),
    Manifest { digest: [u8; 32], data: Vec<u8> },
}

impl FirmwareImage {
    /// Sniff the format: SUIT envelope prefix first, MCUboot otherwise.
    pub fn detect(data: Vec<u8>) -> Result<Self, ImageError> {
        if is_manifest_image(&data) {
            let digest = detect_manifest_image(&data)?;
            return Ok(FirmwareImage::Manifest { digest, data });
        }
        Ok(FirmwareImage::McuBoot(ParsedImage::from_bytes(data)?))
    }

    pub fn data(&self) -> &[u8] {
        match self {
            FirmwareImage::McuBoot(image) => image.data(),
            FirmwareImage::Manifest { data, .. } => data,
        }
    }

    /// Hash (MCUboot) or manifest digest (SUIT).
    pub fn digest(&self) -> &[u8] {
        match self {
            FirmwareImage::McuBoot(image) => image.hash(),
            FirmwareImage::Manifest { digest, .. } => digest,
        }
    }
}
