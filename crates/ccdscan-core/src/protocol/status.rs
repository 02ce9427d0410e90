//! Response status code parsing and classification.
//!
//! Every response frame starts with a big-endian 16-bit status. Only three
//! values are meaningful; everything else indicates a malformed exchange.

use std::fmt;

use super::constants::{STATUS_BUSY, STATUS_FAILED, STATUS_OK};

/// How the session controller should treat a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Ok,
    /// Transient; the command may be retried.
    Busy,
    /// The device refused or cancelled the request.
    Failed,
    /// Not a status this protocol defines.
    Unknown,
}

/// Parsed status code from a response header.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct StatusCode(u16);

impl StatusCode {
    pub const OK: Self = Self(STATUS_OK);
    pub const BUSY: Self = Self(STATUS_BUSY);
    pub const FAILED: Self = Self(STATUS_FAILED);

    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    /// Parse from the first two bytes of a response.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [hi, lo, ..] => Some(Self(u16::from_be_bytes([*hi, *lo]))),
            _ => None,
        }
    }

    pub fn value(&self) -> u16 {
        self.0
    }

    pub fn class(&self) -> StatusClass {
        match self.0 {
            STATUS_OK => StatusClass::Ok,
            STATUS_BUSY => StatusClass::Busy,
            STATUS_FAILED => StatusClass::Failed,
            _ => StatusClass::Unknown,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.class() == StatusClass::Ok
    }
}

impl fmt::Debug for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatusCode(0x{:04X} {:?})", self.0, self.class())
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}
