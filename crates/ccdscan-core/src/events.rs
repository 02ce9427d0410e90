//! Event system for UI decoupling.
//!
//! Lets a CLI or GUI follow a scan without the core knowing about it.

use std::fmt;

use crate::error::{ErrorKind, Phase};
use crate::monitor::DeviceEvent;
use crate::state::SessionState;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Events emitted by a scan session.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    DeviceOpened { vid: u16, pid: u16, model: String },
    StateChanged { from: SessionState, to: SessionState },
    /// Output lines delivered so far.
    Progress { lines: u64, total: u64 },
    Log { level: LogLevel, message: String },
    /// Notification from the interrupt channel or a status change.
    Device(DeviceEvent),
    /// Image block received.
    Block { len: usize, flags: u8 },
    /// Raw bytes on the command channel.
    Packet {
        direction: PacketDirection,
        length: usize,
        data: Option<Vec<u8>>,
    },
    Error {
        phase: Phase,
        kind: ErrorKind,
        message: String,
    },
    Complete { lines: u64 },
}

/// USB packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Transmit (Host -> Device)
    Rx, // Receive (Device -> Host)
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving scan events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait ScanObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &ScanEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl ScanObserver for NullObserver {
    fn on_event(&self, _event: &ScanEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl ScanObserver for TracingObserver {
    fn on_event(&self, event: &ScanEvent) {
        match event {
            ScanEvent::DeviceOpened { vid, pid, model } => {
                tracing::info!(vid = %format!("{:04X}", vid), pid = %format!("{:04X}", pid), model = %model, "Device opened");
            }
            ScanEvent::StateChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "Session state changed");
            }
            ScanEvent::Progress { lines, total } => {
                let pct = if *total > 0 { (*lines * 100) / *total } else { 0 };
                tracing::debug!(lines, total, progress = %format!("{}%", pct), "Progress");
            }
            ScanEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            ScanEvent::Device(device_event) => {
                tracing::info!(event = %device_event, "Device event");
            }
            ScanEvent::Block { len, flags } => {
                tracing::trace!(len, flags = %format!("0x{:02X}", flags), "Block");
            }
            ScanEvent::Packet {
                direction, length, ..
            } => {
                tracing::trace!(dir = %direction, len = length, "USB Packet");
            }
            ScanEvent::Error {
                phase,
                kind,
                message,
            } => {
                tracing::error!(phase = %phase, kind = ?kind, "Error: {}", message);
            }
            ScanEvent::Complete { lines } => {
                tracing::info!(lines, "Scan complete");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Observer that keeps every event for assertions.
    #[derive(Default)]
    pub struct RecordingObserver {
        pub events: Mutex<Vec<ScanEvent>>,
    }

    impl ScanObserver for RecordingObserver {
        fn on_event(&self, event: &ScanEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    impl RecordingObserver {
        pub fn states(&self) -> Vec<SessionState> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    ScanEvent::StateChanged { to, .. } => Some(*to),
                    _ => None,
                })
                .collect()
        }
    }
}
