//! Transport wrapper that reports every packet to an observer.

use std::sync::Arc;
use std::time::Duration;

use super::traits::{ScannerTransport, TransportError};
use crate::events::{PacketDirection, ScanEvent, ScanObserver};

/// Bytes of each packet copied into the event.
const PACKET_PREVIEW: usize = 32;

pub struct ObservedTransport<T: ScannerTransport> {
    inner: T,
    observer: Arc<dyn ScanObserver>,
}

impl<T: ScannerTransport> ObservedTransport<T> {
    pub fn new(inner: T, observer: Arc<dyn ScanObserver>) -> Self {
        Self { inner, observer }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    fn emit(&self, direction: PacketDirection, data: &[u8]) {
        self.observer.on_event(&ScanEvent::Packet {
            direction,
            length: data.len(),
            data: Some(data.iter().take(PACKET_PREVIEW).cloned().collect()),
        });
    }
}

impl<T: ScannerTransport> ScannerTransport for ObservedTransport<T> {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let res = self.inner.write(data);
        if res.is_ok() {
            self.emit(PacketDirection::Tx, data);
        }
        res
    }

    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let res = self.inner.read(max_len);
        if let Ok(data) = &res
            && !data.is_empty()
        {
            self.emit(PacketDirection::Rx, data);
        }
        res
    }

    fn read_interrupt(
        &self,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let res = self.inner.read_interrupt(max_len, timeout);
        if let Ok(Some(packet)) = &res {
            self.emit(PacketDirection::Rx, packet);
        }
        res
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn vendor_id(&self) -> u16 {
        self.inner.vendor_id()
    }

    fn product_id(&self) -> u16 {
        self.inner.product_id()
    }
}
