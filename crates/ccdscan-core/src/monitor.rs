//! Interrupt packet decoding and device status tracking.
//!
//! The monitor itself never touches the transport; the session reads the
//! interrupt channel between transactions and feeds the packets in.

use std::collections::VecDeque;
use std::fmt;

use tracing::debug;

use crate::error::DriverError;
use crate::protocol::commands::{InterruptLayout, StatusLayout};

/// Events kept for `wait_event` before the oldest are dropped.
pub const MAX_PENDING_EVENTS: usize = 32;

/// Asynchronous notifications from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A front panel button. `target` and `original` are the panel
    /// selections sent along with it.
    Button { button: u8, target: u8, original: u8 },
    /// The device wants the host clock.
    TimeSyncRequested,
    /// Something in the status record changed.
    StatusChanged,
    PaperEmpty,
    CalibrationDone,
    LampReady,
}

impl fmt::Display for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceEvent::Button {
                button,
                target,
                original,
            } => write!(f, "button {button} (target {target}, original {original})"),
            DeviceEvent::TimeSyncRequested => write!(f, "time sync requested"),
            DeviceEvent::StatusChanged => write!(f, "status changed"),
            DeviceEvent::PaperEmpty => write!(f, "paper empty"),
            DeviceEvent::CalibrationDone => write!(f, "calibration done"),
            DeviceEvent::LampReady => write!(f, "lamp ready"),
        }
    }
}

/// Decoded general status record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    pub paper_present: bool,
    pub calibrated: bool,
    /// `None` when the family does not report the lamp.
    pub lamp_on: Option<bool>,
    pub jammed: bool,
    pub cover_open: bool,
    pub raw: Vec<u8>,
}

impl DeviceStatus {
    /// `duplex` also accepts paper on the back-side sensor.
    pub fn decode(layout: &StatusLayout, data: &[u8], duplex: bool) -> Self {
        let front = layout.paper_present.matches(data);
        let back = duplex
            && layout
                .paper_present_back
                .is_some_and(|t| t.matches(data));
        Self {
            paper_present: front || back,
            calibrated: layout.calibrated.matches(data),
            lamp_on: layout.lamp_on.map(|t| t.matches(data)),
            jammed: layout.jammed.is_some_and(|t| t.matches(data)),
            cover_open: layout.cover_open.is_some_and(|t| t.matches(data)),
            raw: data.to_vec(),
        }
    }

    /// The fatal condition this status reports, if any.
    pub fn fault(&self) -> Option<DriverError> {
        if self.jammed {
            Some(DriverError::Jammed)
        } else if self.cover_open {
            Some(DriverError::CoverOpen)
        } else {
            None
        }
    }
}

#[derive(Debug)]
pub struct StatusMonitor {
    layout: InterruptLayout,
    last: Option<DeviceStatus>,
    pending: VecDeque<DeviceEvent>,
}

impl StatusMonitor {
    pub fn new(layout: InterruptLayout) -> Self {
        Self {
            layout,
            last: None,
            pending: VecDeque::new(),
        }
    }

    /// Decode one interrupt transfer. Several events can arrive together.
    pub fn decode_packet(&self, packet: &[u8]) -> Result<Vec<DeviceEvent>, DriverError> {
        let unit = self.layout.packet_len.max(1);
        if packet.is_empty() || packet.len() % unit != 0 {
            return Err(DriverError::Protocol(format!(
                "interrupt packet of {} bytes",
                packet.len()
            )));
        }

        let mut events = Vec::new();
        if let Some(code) = self.layout.button_code {
            let value = packet.get(code.offset).copied().unwrap_or(0);
            if value != 0 {
                events.push(DeviceEvent::Button {
                    button: if value == code.button_2 { 2 } else { 1 },
                    target: value >> 4,
                    original: 0,
                });
            }
            return Ok(events);
        }

        if self.layout.time_request.matches(packet) {
            events.push(DeviceEvent::TimeSyncRequested);
        }
        if self.layout.status_changed.matches(packet) {
            events.push(DeviceEvent::StatusChanged);
        }
        let target = packet.get(self.layout.target_offset).copied().unwrap_or(0);
        let original = packet.get(self.layout.original_offset).copied().unwrap_or(0) >> 4;
        // Button 1 wins when both are reported.
        let button = if self.layout.button_1.matches(packet) {
            Some(1)
        } else if self.layout.button_2.matches(packet) {
            Some(2)
        } else {
            None
        };
        if let Some(button) = button {
            events.push(DeviceEvent::Button {
                button,
                target,
                original,
            });
        }
        Ok(events)
    }

    /// Record a fresh status and derive edge events from the previous one.
    pub fn observe(&mut self, status: DeviceStatus) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        if let Some(prev) = &self.last {
            if prev.paper_present && !status.paper_present {
                events.push(DeviceEvent::PaperEmpty);
            }
            if !prev.calibrated && status.calibrated {
                events.push(DeviceEvent::CalibrationDone);
            }
            if prev.lamp_on == Some(false) && status.lamp_on == Some(true) {
                events.push(DeviceEvent::LampReady);
            }
        }
        self.last = Some(status);
        events
    }

    pub fn last_status(&self) -> Option<&DeviceStatus> {
        self.last.as_ref()
    }

    /// Keep an event for `wait_event`.
    pub fn queue(&mut self, event: DeviceEvent) {
        if self.pending.len() == MAX_PENDING_EVENTS
            && let Some(dropped) = self.pending.pop_front()
        {
            debug!(event = %dropped, "Event queue full, dropping oldest");
        }
        self.pending.push_back(event);
    }

    pub fn next_event(&mut self) -> Option<DeviceEvent> {
        self.pending.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolFamily;
    use crate::protocol::commands::{ButtonCode, CommandTable};

    fn monitor() -> StatusMonitor {
        StatusMonitor::new(InterruptLayout::default())
    }

    #[test]
    fn test_button_packet() {
        let mut packet = [0u8; 16];
        packet[0] = 0x31;
        packet[1] = 0x02;
        let events = monitor().decode_packet(&packet).unwrap();
        assert_eq!(
            events,
            vec![DeviceEvent::Button {
                button: 1,
                target: 2,
                original: 3
            }]
        );
    }

    #[test]
    fn test_time_and_status_bits() {
        let mut packet = [0u8; 32];
        packet[3] = 0x01;
        packet[9] = 0x02;
        let events = monitor().decode_packet(&packet).unwrap();
        assert_eq!(
            events,
            vec![DeviceEvent::TimeSyncRequested, DeviceEvent::StatusChanged]
        );
    }

    #[test]
    fn test_bad_packet_length() {
        assert!(monitor().decode_packet(&[0u8; 10]).is_err());
        assert!(monitor().decode_packet(&[]).is_err());
    }

    #[test]
    fn test_button_code_models() {
        let layout = InterruptLayout {
            button_code: Some(ButtonCode {
                offset: 1,
                button_2: 0x50,
            }),
            ..InterruptLayout::default()
        };
        let monitor = StatusMonitor::new(layout);
        let mut packet = [0u8; 16];
        packet[1] = 0x50;
        // Time bit is not part of this encoding.
        packet[3] = 0x01;
        let events = monitor.decode_packet(&packet).unwrap();
        assert_eq!(
            events,
            vec![DeviceEvent::Button {
                button: 2,
                target: 5,
                original: 0
            }]
        );
        packet[1] = 0x20;
        assert!(matches!(
            monitor.decode_packet(&packet).unwrap()[0],
            DeviceEvent::Button { button: 1, .. }
        ));
    }

    #[test]
    fn test_status_edges() {
        let layout = CommandTable::for_family(ProtocolFamily::Standard).status_layout;
        let mut monitor = monitor();
        // paper at byte 1 == 0, calibrated at byte 9 == 1, lamp byte 7
        let mut record = [0u8; 16];
        record[9] = 0;
        assert!(monitor.observe(DeviceStatus::decode(&layout, &record, false)).is_empty());

        record[1] = 1;
        record[9] = 1;
        record[7] = 1;
        let events = monitor.observe(DeviceStatus::decode(&layout, &record, false));
        assert_eq!(
            events,
            vec![
                DeviceEvent::PaperEmpty,
                DeviceEvent::CalibrationDone,
                DeviceEvent::LampReady
            ]
        );
        assert!(!monitor.last_status().unwrap().paper_present);
    }

    #[test]
    fn test_duplex_back_sensor() {
        let layout = CommandTable::for_family(ProtocolFamily::Standard).status_layout;
        let mut record = [0u8; 16];
        record[1] = 1;
        assert!(!DeviceStatus::decode(&layout, &record, false).paper_present);
        assert!(DeviceStatus::decode(&layout, &record, true).paper_present);
    }

    #[test]
    fn test_event_queue() {
        let mut monitor = monitor();
        monitor.queue(DeviceEvent::LampReady);
        assert_eq!(monitor.next_event(), Some(DeviceEvent::LampReady));
        assert_eq!(monitor.next_event(), None);
    }

    #[test]
    fn test_event_queue_drops_oldest_when_full() {
        let mut monitor = monitor();
        monitor.queue(DeviceEvent::PaperEmpty);
        for _ in 0..MAX_PENDING_EVENTS {
            monitor.queue(DeviceEvent::StatusChanged);
        }
        let mut drained = 0;
        while let Some(event) = monitor.next_event() {
            assert_eq!(event, DeviceEvent::StatusChanged);
            drained += 1;
        }
        assert_eq!(drained, MAX_PENDING_EVENTS);
    }
}
