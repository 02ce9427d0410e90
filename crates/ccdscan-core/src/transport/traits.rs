//! Scanner transport abstraction.
//!
//! Defines the `ScannerTransport` trait for the command and interrupt
//! channels, allowing different implementations (nusb, mock, simulator).

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Conditions a transport can report out-of-band, e.g. from SCSI sense data
/// or a USB class-specific status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCondition {
    Busy,
    NoDocuments,
    Jammed,
    CoverOpen,
}

impl fmt::Display for DeviceCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "device busy"),
            Self::NoDocuments => write!(f, "no documents"),
            Self::Jammed => write!(f, "paper jam"),
            Self::CoverOpen => write!(f, "cover open"),
        }
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint not found: type={ep_type}, direction={direction}")]
    EndpointNotFound { ep_type: String, direction: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device reported {0}")]
    Condition(DeviceCondition),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract scanner transport interface.
///
/// All calls block. Implementations own their timeouts for the command
/// channel; interrupt reads take the timeout from the caller.
pub trait ScannerTransport: Send + Sync {
    /// Write raw bytes to the command channel.
    fn write(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read up to `max_len` bytes from the command channel.
    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError>;

    /// Wait for one interrupt packet. `Ok(None)` means the timeout elapsed.
    fn read_interrupt(
        &self,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, TransportError>;

    /// Write the whole buffer, treating a short write as an error.
    fn write_all(&self, data: &[u8]) -> Result<(), TransportError> {
        let written = self.write(data)?;
        if written != data.len() {
            return Err(TransportError::ShortWrite {
                written,
                expected: data.len(),
            });
        }
        Ok(())
    }

    /// Check if device is still connected.
    fn is_connected(&self) -> bool;

    /// Get the current VID.
    fn vendor_id(&self) -> u16;

    /// Get the current PID.
    fn product_id(&self) -> u16;
}

impl<T: ScannerTransport + ?Sized> ScannerTransport for Box<T> {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        (**self).write(data)
    }

    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        (**self).read(max_len)
    }

    fn read_interrupt(
        &self,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        (**self).read_interrupt(max_len, timeout)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn vendor_id(&self) -> u16 {
        (**self).vendor_id()
    }

    fn product_id(&self) -> u16 {
        (**self).product_id()
    }
}
