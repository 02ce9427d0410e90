//! nusb-based USB transport implementation.

use nusb::transfer::{Bulk, In, Interrupt, Out};
use nusb::{Interface, MaybeFuture, list_devices};
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use tracing::{debug, info, instrument, trace};

use super::traits::{ScannerTransport, TransportError};

/// Command channel timeouts.
#[derive(Debug, Clone, Copy)]
pub struct UsbTimeouts {
    pub write: Duration,
    pub read: Duration,
}

impl Default for UsbTimeouts {
    fn default() -> Self {
        Self {
            write: Duration::from_secs(20),
            read: Duration::from_secs(20),
        }
    }
}

/// nusb-based USB transport.
pub struct NusbTransport {
    interface: Interface,
    in_endpoint: u8,
    out_endpoint: u8,
    /// Zero when the device exposes no interrupt endpoint.
    interrupt_endpoint: u8,
    timeouts: UsbTimeouts,
    vid: u16,
    pid: u16,
}

impl NusbTransport {
    /// Open a device with specific VID/PID.
    #[instrument(level = "info", fields(vid = format!("{:04X}", vid), pid = format!("{:04X}", pid)))]
    pub fn open_with_ids(vid: u16, pid: u16, timeouts: UsbTimeouts) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid)
            .ok_or(TransportError::DeviceNotFound { vid, pid })?;

        Self::open_device_info(device_info, timeouts)
    }

    fn open_device_info(
        device_info: nusb::DeviceInfo,
        timeouts: UsbTimeouts,
    ) -> Result<Self, TransportError> {
        let vid = device_info.vendor_id();
        let pid = device_info.product_id();

        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            "Found scanner"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let interface =
            device
                .claim_interface(0)
                .wait()
                .map_err(|e| TransportError::ClaimInterfaceFailed {
                    interface: 0,
                    message: e.to_string(),
                })?;

        let mut in_endpoint: u8 = 0;
        let mut out_endpoint: u8 = 0;
        let mut interrupt_endpoint: u8 = 0;

        for config in device.configurations() {
            for iface in config.interfaces() {
                if iface.interface_number() != 0 {
                    continue;
                }
                for alt in iface.alt_settings() {
                    for ep in alt.endpoints() {
                        let is_in = ep.direction() == nusb::transfer::Direction::In;
                        match ep.transfer_type() {
                            nusb::descriptors::TransferType::Bulk if is_in => {
                                in_endpoint = ep.address()
                            }
                            nusb::descriptors::TransferType::Bulk => out_endpoint = ep.address(),
                            nusb::descriptors::TransferType::Interrupt if is_in => {
                                interrupt_endpoint = ep.address()
                            }
                            _ => {}
                        }
                    }
                }
            }
        }

        if in_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Bulk".into(),
                direction: "In".into(),
            });
        }
        if out_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Bulk".into(),
                direction: "Out".into(),
            });
        }

        info!(
            in_ep = %format!("0x{:02X}", in_endpoint),
            out_ep = %format!("0x{:02X}", out_endpoint),
            int_ep = %format!("0x{:02X}", interrupt_endpoint),
            "Scanner opened successfully"
        );

        Ok(Self {
            interface,
            in_endpoint,
            out_endpoint,
            interrupt_endpoint,
            timeouts,
            vid,
            pid,
        })
    }
}

fn read_error(e: std::io::Error, timeout: Duration) -> TransportError {
    match e.kind() {
        ErrorKind::TimedOut => TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        },
        ErrorKind::NotConnected | ErrorKind::BrokenPipe => TransportError::Disconnected,
        _ => TransportError::ReadFailed(e.to_string()),
    }
}

impl ScannerTransport for NusbTransport {
    #[instrument(skip(self, data), fields(len = data.len()))]
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let ep = self
            .interface
            .endpoint::<Bulk, Out>(self.out_endpoint)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        let mut writer = ep.writer(4096).with_write_timeout(self.timeouts.write);
        writer.write_all(data).map_err(|e| match e.kind() {
            ErrorKind::TimedOut => TransportError::Timeout {
                timeout_ms: self.timeouts.write.as_millis() as u64,
            },
            _ => TransportError::WriteFailed(e.to_string()),
        })?;
        writer
            .flush()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        debug!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    #[instrument(skip(self), fields(max_len))]
    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let ep = self
            .interface
            .endpoint::<Bulk, In>(self.in_endpoint)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        let mut reader = ep.reader(max_len.max(512)).with_read_timeout(self.timeouts.read);
        let mut buf = vec![0u8; max_len];

        let n = reader
            .read(&mut buf)
            .map_err(|e| read_error(e, self.timeouts.read))?;

        buf.truncate(n);
        debug!(bytes_read = n, "Read complete");
        Ok(buf)
    }

    fn read_interrupt(
        &self,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        if self.interrupt_endpoint == 0 {
            std::thread::sleep(timeout);
            return Ok(None);
        }
        let ep = self
            .interface
            .endpoint::<Interrupt, In>(self.interrupt_endpoint)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        let mut reader = ep.reader(max_len).with_read_timeout(timeout);
        let mut buf = vec![0u8; max_len];
        match reader.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                trace!(bytes_read = n, "Interrupt packet");
                Ok(Some(buf))
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(read_error(e, timeout)),
        }
    }

    fn is_connected(&self) -> bool {
        // nusb has no cheap liveness check; failures surface on the next transfer.
        true
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}
