//! Driver error taxonomy.
//!
//! Lower layers have their own error types (`TransportError`,
//! `FrameError`); the session maps them onto `DriverError`, and every
//! failure handed to the caller is a `ScanError` carrying the lifecycle
//! phase it came from.

use std::fmt;
use thiserror::Error;

use crate::protocol::frame::FrameError;
use crate::protocol::status::{StatusClass, StatusCode};
use crate::transport::{DeviceCondition, TransportError};

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Device busy")]
    Busy,

    #[error("No paper in the document feeder")]
    NoPaper,

    #[error("Paper jammed")]
    Jammed,

    #[error("Cover open")]
    CoverOpen,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Transport error: {0}")]
    Transport(#[source] TransportError),
}

/// Error classes without payloads, for matching and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Busy,
    NoPaper,
    Jammed,
    CoverOpen,
    Protocol,
    Cancelled,
    Timeout,
    InvalidParameter,
    Unsupported,
    InvalidState,
    Transport,
}

impl DriverError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Busy => ErrorKind::Busy,
            Self::NoPaper => ErrorKind::NoPaper,
            Self::Jammed => ErrorKind::Jammed,
            Self::CoverOpen => ErrorKind::CoverOpen,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::InvalidParameter(_) => ErrorKind::InvalidParameter,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::Transport(_) => ErrorKind::Transport,
        }
    }

    /// Map a response status onto the taxonomy. `None` for success.
    pub fn from_status(status: StatusCode) -> Option<Self> {
        match status.class() {
            StatusClass::Ok => None,
            StatusClass::Busy => Some(Self::Busy),
            StatusClass::Failed => Some(Self::Cancelled),
            StatusClass::Unknown => Some(Self::Protocol(format!("unexpected status {status}"))),
        }
    }

    /// Conditions the user has to clear before anything else can work.
    pub fn needs_intervention(&self) -> bool {
        matches!(self, Self::NoPaper | Self::Jammed | Self::CoverOpen)
    }
}

impl From<TransportError> for DriverError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout { timeout_ms } => {
                Self::Timeout(format!("no response after {timeout_ms}ms"))
            }
            TransportError::ShortWrite { written, expected } => {
                Self::Timeout(format!("short write, {written} of {expected} bytes"))
            }
            TransportError::Condition(DeviceCondition::Busy) => Self::Busy,
            TransportError::Condition(DeviceCondition::NoDocuments) => Self::NoPaper,
            TransportError::Condition(DeviceCondition::Jammed) => Self::Jammed,
            TransportError::Condition(DeviceCondition::CoverOpen) => Self::CoverOpen,
            other => Self::Transport(other),
        }
    }
}

impl From<FrameError> for DriverError {
    fn from(err: FrameError) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Lifecycle phase a failure was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Open,
    Negotiate,
    Start,
    Transfer,
    Teardown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Open => write!(f, "open"),
            Phase::Negotiate => write!(f, "negotiate"),
            Phase::Start => write!(f, "start"),
            Phase::Transfer => write!(f, "transfer"),
            Phase::Teardown => write!(f, "teardown"),
        }
    }
}

/// A failure as the caller sees it.
#[derive(Error, Debug)]
#[error("{phase} failed: {source}")]
pub struct ScanError {
    pub phase: Phase,
    #[source]
    pub source: DriverError,
}

impl ScanError {
    pub fn new(phase: Phase, source: DriverError) -> Self {
        Self { phase, source }
    }

    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

/// Attach a phase to driver results.
pub trait PhaseExt<T> {
    fn in_phase(self, phase: Phase) -> Result<T, ScanError>;
}

impl<T, E: Into<DriverError>> PhaseExt<T> for Result<T, E> {
    fn in_phase(self, phase: Phase) -> Result<T, ScanError> {
        self.map_err(|e| ScanError::new(phase, e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(DriverError::from_status(StatusCode::OK).is_none());
        assert_eq!(
            DriverError::from_status(StatusCode::BUSY).unwrap().kind(),
            ErrorKind::Busy
        );
        assert_eq!(
            DriverError::from_status(StatusCode::FAILED).unwrap().kind(),
            ErrorKind::Cancelled
        );
        assert_eq!(
            DriverError::from_status(StatusCode::new(0x0303)).unwrap().kind(),
            ErrorKind::Protocol
        );
    }

    #[test]
    fn test_transport_mapping() {
        let err: DriverError = TransportError::Timeout { timeout_ms: 20 }.into();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        let err: DriverError = TransportError::Condition(DeviceCondition::Jammed).into();
        assert_eq!(err.kind(), ErrorKind::Jammed);
        assert!(err.needs_intervention());
        let err: DriverError = TransportError::Disconnected.into();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_scan_error_carries_phase() {
        let res: Result<(), FrameError> = Err(FrameError::Checksum { sum: 3 });
        let err = res.in_phase(Phase::Transfer).unwrap_err();
        assert_eq!(err.phase, Phase::Transfer);
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.to_string().starts_with("transfer failed"));
    }
}
