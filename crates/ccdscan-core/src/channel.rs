//! Request/response transactions over the command channel.
//!
//! One transaction is one write followed by one response read; nothing is
//! pipelined. Response reads that time out are retried a bounded number
//! of times because the device answers late while the optics travel home.

use tracing::{debug, trace, warn};

use crate::error::{DriverError, ErrorKind};
use crate::protocol::commands::CommandTable;
use crate::protocol::frame::{Command, Response, decode_response};
use crate::retry::{CancelToken, RetryPolicy, retry};
use crate::transport::{ScannerTransport, TransportError};

pub struct CommandChannel<T: ScannerTransport> {
    transport: T,
    table: CommandTable,
    response_policy: RetryPolicy,
}

impl<T: ScannerTransport> CommandChannel<T> {
    pub fn new(transport: T, table: CommandTable, response_policy: RetryPolicy) -> Self {
        Self {
            transport,
            table,
            response_policy,
        }
    }

    pub fn table(&self) -> &CommandTable {
        &self.table
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Encode and write a command.
    pub fn send(&self, cmd: &Command) -> Result<(), DriverError> {
        let frame = cmd.encode(&self.table.frame)?;
        trace!(opcode = %format!("0x{:04X}", cmd.opcode), len = frame.len(), "Command");
        self.transport.write_all(&frame)?;
        Ok(())
    }

    /// Read one response chunk, retrying on timeouts.
    ///
    /// `cancel` is checked before every attempt; pass a fresh token for
    /// teardown traffic that must not be interrupted.
    pub fn receive(&self, max_len: usize, cancel: &CancelToken) -> Result<Vec<u8>, DriverError> {
        retry(
            &self.response_policy,
            cancel,
            "response",
            |e| e.kind() == ErrorKind::Timeout,
            |_| Ok(self.transport.read(max_len)?),
        )
    }

    /// Single read without retries.
    pub fn read_raw(&self, max_len: usize) -> Result<Vec<u8>, DriverError> {
        Ok(self.transport.read(max_len)?)
    }

    /// Full transaction. Non-OK status codes become errors; a successful
    /// response with missing data is a protocol error.
    pub fn transact(&self, cmd: &Command, cancel: &CancelToken) -> Result<Response, DriverError> {
        cancel.check()?;
        self.send(cmd)?;
        let frame = self.receive(self.table.frame.response_header_len + cmd.response_len, cancel)?;
        let response = decode_response(&self.table.frame, &frame, cmd.response_len)?;
        if let Some(err) = DriverError::from_status(response.status) {
            debug!(
                opcode = %format!("0x{:04X}", cmd.opcode),
                status = %response.status,
                "Command refused"
            );
            return Err(err);
        }
        if response.truncated {
            return Err(DriverError::Protocol(format!(
                "response to 0x{:04X} carried {} of {} bytes",
                cmd.opcode,
                response.data.len(),
                cmd.response_len
            )));
        }
        Ok(response)
    }

    /// Run a command and return its response data.
    pub fn exec(&self, cmd: &Command, cancel: &CancelToken) -> Result<Vec<u8>, DriverError> {
        self.transact(cmd, cancel).map(|r| r.data)
    }

    /// Discard whatever the device still has queued on the command channel.
    pub fn drain(&self, max_reads: u32) -> usize {
        let mut discarded = 0;
        for _ in 0..max_reads {
            match self.transport.read(self.table.block.max_block) {
                Ok(data) if !data.is_empty() => discarded += data.len(),
                Ok(_) | Err(TransportError::Timeout { .. }) => break,
                Err(e) => {
                    warn!(error = %e, "Drain stopped");
                    break;
                }
            }
        }
        if discarded > 0 {
            debug!(bytes = discarded, "Drained stale data");
        }
        discarded
    }
}
