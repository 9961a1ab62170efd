//! SUIT envelope detection.
//!
//! This is a byte-pattern heuristic, not a CBOR parse: the envelope starts
//! with the SUIT envelope tag and the manifest digest is the 32-byte string
//! following the first `[-16 (sha-256), bstr .size 32]` pair.

use crate::error::{FormatError, ImageError};

/// Leading bytes of a tagged SUIT envelope.
pub const MANIFEST_PREFIX: [u8; 2] = [0xD8, 0x6B];
/// `array(2), -16, bstr(32)` preceding the digest.
pub const DIGEST_MARKER: [u8; 4] = [0x82, 0x2F, 0x58, 0x20];
pub const DIGEST_LEN: usize = 32;

/// Whether `data` starts like a SUIT envelope.
pub fn is_manifest_image(data: &[u8]) -> bool {
    data.starts_with(&MANIFEST_PREFIX)
}

/// Extract the manifest digest from an envelope.
pub fn detect_manifest_image(data: &[u8]) -> Result<[u8; DIGEST_LEN], ImageError> {
    if !is_manifest_image(data) {
        return Err(ImageError::NotManifestFormat);
    }

    let marker = data
        .windows(DIGEST_MARKER.len())
        .position(|w| w == DIGEST_MARKER)
        .ok_or(FormatError::MarkerNotFound)?;

    let start = marker + DIGEST_MARKER.len();
    let digest = data
        .get(start..start + DIGEST_LEN)
        .ok_or(FormatError::BufferTooSmall {
            expected: start + DIGEST_LEN,
            actual: data.len(),
        })?;

    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(digest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_extraction() {
        let digest: Vec<u8> = (0..32).collect();
        let mut buf = vec![0xD8, 0x6B, 0xA2, 0x02, 0x58, 0x71, 0x13];
        buf.extend_from_slice(&DIGEST_MARKER);
        buf.extend_from_slice(&digest);
        buf.extend_from_slice(&[0x03, 0x58, 0x40, 0xFF, 0xFF]);

        assert_eq!(detect_manifest_image(&buf).unwrap().to_vec(), digest);
    }

    #[test]
    fn test_not_manifest() {
        let buf = [0x3D, 0xB8, 0xF3, 0x96, 0x82, 0x2F, 0x58, 0x20];
        assert!(matches!(
            detect_manifest_image(&buf),
            Err(ImageError::NotManifestFormat)
        ));
    }

    #[test]
    fn test_marker_missing() {
        let buf = [0xD8, 0x6B, 0x00, 0x01, 0x02];
        assert!(matches!(
            detect_manifest_image(&buf),
            Err(ImageError::Format(FormatError::MarkerNotFound))
        ));
    }

    #[test]
    fn test_digest_truncated() {
        let mut buf = vec![0xD8, 0x6B];
        buf.extend_from_slice(&DIGEST_MARKER);
        buf.extend_from_slice(&[0u8; 10]);
        assert!(matches!(
            detect_manifest_image(&buf),
            Err(ImageError::Format(FormatError::BufferTooSmall { .. }))
        ));
    }
}
