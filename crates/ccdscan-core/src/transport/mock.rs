//! Mock scanner transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{DeviceCondition, ScannerTransport, TransportError};
use crate::protocol::constants::{CANON_VENDOR_ID, MP810_PID};

/// One scripted answer on the command channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    Data(Vec<u8>),
    Timeout,
    Condition(DeviceCondition),
}

/// Scripted transport for unit testing the session logic.
///
/// Clones share the same queues and logs, so a test can keep one handle
/// while the session owns another.
#[derive(Clone)]
pub struct MockTransport {
    /// Queued replies returned on read.
    replies: Arc<Mutex<VecDeque<MockReply>>>,
    /// Returned when the reply queue is empty.
    fallback: Arc<Mutex<Option<Vec<u8>>>>,
    /// Queued interrupt packets.
    interrupts: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    reads: Arc<Mutex<usize>>,
    short_writes: Arc<Mutex<bool>>,
    vid: u16,
    pid: u16,
    /// Whether device is "connected".
    connected: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            replies: Arc::new(Mutex::new(VecDeque::new())),
            fallback: Arc::new(Mutex::new(None)),
            interrupts: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            reads: Arc::new(Mutex::new(0)),
            short_writes: Arc::new(Mutex::new(false)),
            vid: CANON_VENDOR_ID,
            pid: MP810_PID,
            connected: Arc::new(Mutex::new(true)),
        }
    }

    /// Queue raw bytes to be returned on a later read.
    ///
    /// A read with a smaller `max_len` takes a prefix and leaves the rest
    /// at the head of the queue, like a bulk endpoint does.
    pub fn queue_reply(&self, bytes: &[u8]) {
        self.push(MockReply::Data(bytes.to_vec()));
    }

    pub fn queue_timeout(&self) {
        self.push(MockReply::Timeout);
    }

    pub fn queue_condition(&self, condition: DeviceCondition) {
        self.push(MockReply::Condition(condition));
    }

    fn push(&self, reply: MockReply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    /// Answer every read with `bytes` once the queue runs dry.
    pub fn set_fallback(&self, bytes: &[u8]) {
        *self.fallback.lock().unwrap() = Some(bytes.to_vec());
    }

    /// Queue an interrupt packet.
    pub fn queue_interrupt(&self, packet: &[u8]) {
        self.interrupts.lock().unwrap().push_back(packet.to_vec());
    }

    /// Make every write report one byte less than requested.
    pub fn set_short_writes(&self, enabled: bool) {
        *self.short_writes.lock().unwrap() = enabled;
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().unwrap().clone()
    }

    /// Opcodes of all captured writes, in order.
    pub fn opcodes(&self) -> Vec<u16> {
        self.get_writes()
            .iter()
            .filter(|w| w.len() >= 2)
            .map(|w| u16::from_be_bytes([w[0], w[1]]))
            .collect()
    }

    /// Number of writes carrying `opcode`.
    pub fn count_opcode(&self, opcode: u16) -> usize {
        self.opcodes().into_iter().filter(|&op| op == opcode).count()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.write_log.lock().unwrap().clear();
    }

    /// Number of command-channel reads performed so far.
    pub fn read_count(&self) -> usize {
        *self.reads.lock().unwrap()
    }

    /// Replies still queued.
    pub fn pending_replies(&self) -> usize {
        self.replies.lock().unwrap().len()
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        *self.connected.lock().unwrap() = true;
    }

    pub fn set_ids(&mut self, vid: u16, pid: u16) {
        self.vid = vid;
        self.pid = pid;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScannerTransport for MockTransport {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.write_log.lock().unwrap().push(data.to_vec());
        if *self.short_writes.lock().unwrap() {
            return Ok(data.len().saturating_sub(1));
        }
        Ok(data.len())
    }

    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        *self.reads.lock().unwrap() += 1;

        let mut replies = self.replies.lock().unwrap();
        match replies.pop_front() {
            Some(MockReply::Data(mut bytes)) => {
                if bytes.len() > max_len {
                    let rest = bytes.split_off(max_len);
                    replies.push_front(MockReply::Data(rest));
                }
                Ok(bytes)
            }
            Some(MockReply::Timeout) => Err(TransportError::Timeout { timeout_ms: 5000 }),
            Some(MockReply::Condition(c)) => Err(TransportError::Condition(c)),
            None => self
                .fallback
                .lock()
                .unwrap()
                .clone()
                .ok_or(TransportError::Timeout { timeout_ms: 5000 }),
        }
    }

    fn read_interrupt(
        &self,
        _max_len: usize,
        _timeout: Duration,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        Ok(self.interrupts.lock().unwrap().pop_front())
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_reply_queue() {
        let mock = MockTransport::new();
        mock.queue_reply(&[0x06, 0x06]);
        mock.queue_timeout();

        assert_eq!(mock.read(64).unwrap(), vec![0x06, 0x06]);
        assert!(matches!(mock.read(64), Err(TransportError::Timeout { .. })));
        // Queue is empty now
        assert!(mock.read(64).is_err());
        assert_eq!(mock.read_count(), 3);
    }

    #[test]
    fn test_mock_split_reads() {
        let mock = MockTransport::new();
        mock.queue_reply(&[1, 2, 3, 4, 5]);
        assert_eq!(mock.read(2).unwrap(), vec![1, 2]);
        assert_eq!(mock.read(64).unwrap(), vec![3, 4, 5]);
    }

    #[test]
    fn test_mock_fallback() {
        let mock = MockTransport::new();
        mock.set_fallback(&[0x14, 0x14, 0, 0, 0, 0, 0, 0]);
        for _ in 0..3 {
            assert_eq!(mock.read(16).unwrap()[0], 0x14);
        }
    }

    #[test]
    fn test_mock_write_capture() {
        let mock = MockTransport::new();
        mock.write(&[0xDB, 0x20, 0]).unwrap();
        mock.write(&[0xEF, 0x20]).unwrap();

        assert_eq!(mock.get_writes().len(), 2);
        assert_eq!(mock.opcodes(), vec![0xDB20, 0xEF20]);
        assert_eq!(mock.count_opcode(0xEF20), 1);
    }

    #[test]
    fn test_mock_short_write() {
        let mock = MockTransport::new();
        mock.set_short_writes(true);
        assert!(matches!(
            mock.write_all(b"test"),
            Err(TransportError::ShortWrite { written: 3, expected: 4 })
        ));
    }

    #[test]
    fn test_mock_interrupts_and_disconnect() {
        let mock = MockTransport::new();
        mock.queue_interrupt(&[0u8; 16]);
        let timeout = Duration::from_millis(10);
        assert!(mock.read_interrupt(64, timeout).unwrap().is_some());
        assert!(mock.read_interrupt(64, timeout).unwrap().is_none());

        mock.disconnect();
        assert!(!mock.is_connected());
        assert!(mock.write(b"test").is_err());
    }
}
