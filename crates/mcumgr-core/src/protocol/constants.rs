//! SMP protocol constants.
//!
//! Group and command identifiers follow the Zephyr mcumgr numbering.

// ============================================================================
// Header
// ============================================================================

/// Size of the SMP header preceding every payload.
pub const HEADER_LEN: usize = 8;

/// Original SMP framing (single `rc` status).
pub const SMP_VERSION_1: u8 = 0;
/// SMP version 2 (group-scoped `err` status object).
pub const SMP_VERSION_2: u8 = 1;

// ============================================================================
// Groups
// ============================================================================

/// Default / OS management group.
pub const GROUP_DEFAULT: u16 = 0;
/// Image management group.
pub const GROUP_IMAGE: u16 = 1;
/// File system management group.
pub const GROUP_FS: u16 = 8;
/// SUIT (manifest) management group.
pub const GROUP_SUIT: u16 = 66;

// ============================================================================
// Default group commands
// ============================================================================

pub const DEFAULT_ECHO: u8 = 0;
pub const DEFAULT_RESET: u8 = 5;
pub const DEFAULT_PARAMS: u8 = 6;

// ============================================================================
// Image group commands
// ============================================================================

pub const IMAGE_STATE: u8 = 0;
pub const IMAGE_UPLOAD: u8 = 1;
pub const IMAGE_ERASE: u8 = 5;

// ============================================================================
// File system group commands
// ============================================================================

pub const FS_FILE: u8 = 0;

// ============================================================================
// SUIT group commands
// ============================================================================

pub const SUIT_MANIFEST_LIST: u8 = 0;
pub const SUIT_MANIFEST_STATE: u8 = 1;
pub const SUIT_ENVELOPE_UPLOAD: u8 = 2;
pub const SUIT_MISSING_IMAGE_STATE: u8 = 3;
pub const SUIT_MISSING_IMAGE_UPLOAD: u8 = 4;
pub const SUIT_CACHE_RAW_UPLOAD: u8 = 5;
pub const SUIT_CLEANUP: u8 = 6;

// ============================================================================
// Transport defaults
// ============================================================================

/// Default SMP UDP port.
pub const SMP_UDP_PORT: u16 = 1337;

/// Default MTU used when the transport does not negotiate one.
pub const DEFAULT_MTU: usize = 512;
