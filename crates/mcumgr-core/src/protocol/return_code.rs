//! Device status codes.
//!
//! Every SMP response carries an `rc` (v1) or `err.rc` (v2) value; zero means
//! success.

use std::fmt;

/// mcumgr management return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Ok,
    Unknown,
    NoMemory,
    InValue,
    Timeout,
    NoEntry,
    BadState,
    TooLarge,
    NotSupported,
    Corrupt,
    Busy,
    AccessDenied,
    ProtocolTooOld,
    ProtocolTooNew,
    /// Application-defined codes start at 256.
    PerUser(i64),
    Other(i64),
}

impl ReturnCode {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => ReturnCode::Ok,
            1 => ReturnCode::Unknown,
            2 => ReturnCode::NoMemory,
            3 => ReturnCode::InValue,
            4 => ReturnCode::Timeout,
            5 => ReturnCode::NoEntry,
            6 => ReturnCode::BadState,
            7 => ReturnCode::TooLarge,
            8 => ReturnCode::NotSupported,
            9 => ReturnCode::Corrupt,
            10 => ReturnCode::Busy,
            11 => ReturnCode::AccessDenied,
            12 => ReturnCode::ProtocolTooOld,
            13 => ReturnCode::ProtocolTooNew,
            c if c >= 256 => ReturnCode::PerUser(c),
            c => ReturnCode::Other(c),
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            ReturnCode::Ok => 0,
            ReturnCode::Unknown => 1,
            ReturnCode::NoMemory => 2,
            ReturnCode::InValue => 3,
            ReturnCode::Timeout => 4,
            ReturnCode::NoEntry => 5,
            ReturnCode::BadState => 6,
            ReturnCode::TooLarge => 7,
            ReturnCode::NotSupported => 8,
            ReturnCode::Corrupt => 9,
            ReturnCode::Busy => 10,
            ReturnCode::AccessDenied => 11,
            ReturnCode::ProtocolTooOld => 12,
            ReturnCode::ProtocolTooNew => 13,
            ReturnCode::PerUser(c) | ReturnCode::Other(c) => *c,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ReturnCode::Ok)
    }

    fn name(&self) -> &'static str {
        match self {
            ReturnCode::Ok => "OK",
            ReturnCode::Unknown => "UNKNOWN",
            ReturnCode::NoMemory => "NO_MEMORY",
            ReturnCode::InValue => "IN_VALUE",
            ReturnCode::Timeout => "TIMEOUT",
            ReturnCode::NoEntry => "NO_ENTRY",
            ReturnCode::BadState => "BAD_STATE",
            ReturnCode::TooLarge => "TOO_LARGE",
            ReturnCode::NotSupported => "NOT_SUPPORTED",
            ReturnCode::Corrupt => "CORRUPT",
            ReturnCode::Busy => "BUSY",
            ReturnCode::AccessDenied => "ACCESS_DENIED",
            ReturnCode::ProtocolTooOld => "PROTOCOL_TOO_OLD",
            ReturnCode::ProtocolTooNew => "PROTOCOL_TOO_NEW",
            ReturnCode::PerUser(_) => "PER_USER",
            ReturnCode::Other(_) => "UNRECOGNIZED",
        }
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for code in 0..=13 {
            assert_eq!(ReturnCode::from_code(code).code(), code);
        }
        assert_eq!(ReturnCode::from_code(300), ReturnCode::PerUser(300));
        assert_eq!(ReturnCode::from_code(-1), ReturnCode::Other(-1));
    }

    #[test]
    fn test_display() {
        assert_eq!(ReturnCode::Busy.to_string(), "BUSY (10)");
        assert!(ReturnCode::Ok.is_ok());
        assert!(!ReturnCode::NoEntry.is_ok());
    }
}
