//! Simulated scanner.
//!
//! Decodes command frames with the same codec the session uses and answers
//! them like a device of the given profile would, streaming a synthetic
//! test image. Used by `--simulate` in the CLI and by end-to-end tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, trace};

use super::traits::{ScannerTransport, TransportError};
use crate::profile::DeviceProfile;
use crate::protocol::commands::{CommandTable, parse_scan_param};
use crate::protocol::frame::{DecodedCommand, decode_command, encode_block, encode_response};
use crate::protocol::status::StatusCode;
use crate::reader::BlockFlags;

/// Sample value of raw line `line`, byte `index`.
pub fn test_pattern(line: u32, index: usize) -> u8 {
    (line as usize * 7 + index) as u8
}

#[derive(Debug)]
struct SimState {
    table: CommandTable,
    vid: u16,
    pid: u16,
    connected: bool,
    /// Bytes waiting on the bulk-in endpoint.
    outbox: VecDeque<u8>,
    interrupts: VecDeque<Vec<u8>>,
    opcodes: Vec<u16>,
    reads: usize,

    paper: bool,
    /// Start requests still answered busy.
    busy_starts: u32,
    /// Answers busy to every start until aborted.
    wedged: bool,
    /// Ready polls before calibration reports done.
    calibration_polls: u32,
    calibrated: bool,
    empty_blocks: u32,
    /// Fail the transfer after this many data blocks.
    fail_after_blocks: Option<u32>,
    /// Image lines the device stops short of.
    missing_lines: u32,

    session_open: bool,
    aborts: u32,
    line_bytes: usize,
    lines_total: u32,
    /// Next raw line and byte within it.
    cursor_line: u32,
    cursor_byte: usize,
    data_blocks: u32,
    last_sent: bool,
    last_time: Option<String>,
}

impl SimState {
    fn respond(&mut self, status: StatusCode, data: &[u8]) {
        let frame = encode_response(&self.table.frame, status, data);
        self.outbox.extend(frame);
    }

    fn ok(&mut self, len: usize) {
        self.respond(StatusCode::OK, &vec![0u8; len]);
    }

    fn status_record(&self, len: usize) -> Vec<u8> {
        let mut record = vec![0u8; len];
        let layout = &self.table.status_layout;
        set(&mut record, layout.paper_present.offset, if self.paper { 0 } else { 1 });
        if let Some(back) = layout.paper_present_back {
            set(&mut record, back.offset, if self.paper { 0 } else { 1 });
        }
        set(&mut record, layout.calibrated.offset, self.calibrated as u8);
        if let Some(lamp) = layout.lamp_on {
            set(&mut record, lamp.offset, 1);
        }
        record
    }

    fn handle(&mut self, cmd: DecodedCommand) {
        let table = self.table.clone();
        let op = cmd.opcode;
        trace!(opcode = %format!("0x{:04X}", op), "Simulated command");

        if op == table.start_session {
            if self.wedged || self.busy_starts > 0 {
                self.busy_starts = self.busy_starts.saturating_sub(1);
                self.respond(StatusCode::BUSY, &[]);
            } else {
                self.session_open = true;
                self.calibrated = self.calibration_polls == 0;
                self.ok(0);
            }
        } else if op == table.abort_session {
            self.aborts += 1;
            self.wedged = false;
            self.session_open = false;
            self.lines_total = 0;
            self.ok(0);
        } else if op == table.status.opcode || op == table.ready.query.opcode {
            if self.session_open && !self.calibrated {
                self.calibration_polls = self.calibration_polls.saturating_sub(1);
                self.calibrated = self.calibration_polls == 0;
            }
            let data = if op == table.status.opcode {
                self.status_record(cmd.response_len)
            } else {
                let mut data = vec![0u8; cmd.response_len];
                let test = self.table.ready.ready;
                set(&mut data, test.offset, if self.calibrated { test.value } else { 0 });
                data
            };
            self.respond(StatusCode::OK, &data);
        } else if Some(op) == table.calibration.map(|c| c.lamp_poll.opcode) {
            let mut data = vec![0u8; cmd.response_len];
            if let Some(cal) = table.calibration {
                set(&mut data, cal.lamp_ready.offset, cal.lamp_ready.value);
            }
            self.respond(StatusCode::OK, &data);
        } else if op == table.scan_param {
            match parse_scan_param(table.param_layout, &cmd.payload) {
                Some((width, height, bpp)) if self.session_open => {
                    self.line_bytes = width as usize * bpp as usize / 8;
                    self.lines_total = height.saturating_sub(self.missing_lines);
                    self.cursor_line = 0;
                    self.cursor_byte = 0;
                    self.data_blocks = 0;
                    self.last_sent = false;
                    debug!(width, height, bpp, "Simulated scan parameters");
                    self.ok(0);
                }
                _ => self.respond(StatusCode::FAILED, &[]),
            }
        } else if op == table.read_image {
            self.read_image(cmd.response_len);
        } else if Some(op) == table.time {
            let text = String::from_utf8_lossy(&cmd.payload[..14.min(cmd.payload.len())]);
            self.last_time = Some(text.into_owned());
            self.ok(0);
        } else {
            // Select source, gamma, calibration start, begin transfer,
            // error info.
            self.ok(cmd.response_len);
        }
    }

    fn read_image(&mut self, response_len: usize) {
        let layout = self.table.block;
        let request = (response_len + self.table.frame.response_header_len)
            .saturating_sub(layout.header_len);

        if !self.session_open || self.line_bytes == 0 {
            self.respond(StatusCode::FAILED, &[]);
            return;
        }
        if self.fail_after_blocks.is_some_and(|n| self.data_blocks >= n) {
            self.respond(StatusCode::FAILED, &[]);
            return;
        }
        if self.empty_blocks > 0 {
            self.empty_blocks -= 1;
            self.outbox.extend(encode_block(&layout, StatusCode::OK, 0, &[]));
            return;
        }
        if self.last_sent {
            let flags = (BlockFlags::LAST_BLOCK | BlockFlags::END_OF_SCAN).bits();
            self.outbox.extend(encode_block(&layout, StatusCode::OK, flags, &[]));
            return;
        }

        let mut data = Vec::with_capacity(request.min(1 << 20));
        while data.len() < request && self.cursor_line < self.lines_total {
            data.push(test_pattern(self.cursor_line, self.cursor_byte));
            self.cursor_byte += 1;
            if self.cursor_byte == self.line_bytes {
                self.cursor_byte = 0;
                self.cursor_line += 1;
            }
        }
        let mut flags = BlockFlags::empty();
        if self.cursor_line >= self.lines_total {
            flags |= BlockFlags::LAST_BLOCK;
            self.last_sent = true;
        }
        self.data_blocks += 1;
        self.outbox
            .extend(encode_block(&layout, StatusCode::OK, flags.bits(), &data));
    }
}

fn set(buf: &mut [u8], offset: usize, value: u8) {
    if let Some(b) = buf.get_mut(offset) {
        *b = value;
    }
}

/// In-memory device. Clones share state.
#[derive(Clone)]
pub struct SimulatedScanner {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedScanner {
    pub fn new(profile: &DeviceProfile) -> Self {
        let state = SimState {
            table: profile.command_table(),
            vid: profile.vendor_id,
            pid: profile.product_id,
            connected: true,
            outbox: VecDeque::new(),
            interrupts: VecDeque::new(),
            opcodes: Vec::new(),
            reads: 0,
            paper: true,
            busy_starts: 0,
            wedged: false,
            calibration_polls: 3,
            calibrated: false,
            empty_blocks: 1,
            fail_after_blocks: None,
            missing_lines: 0,
            session_open: false,
            aborts: 0,
            line_bytes: 0,
            lines_total: 0,
            cursor_line: 0,
            cursor_byte: 0,
            data_blocks: 0,
            last_sent: false,
            last_time: None,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn set_paper(&self, present: bool) {
        self.with(|s| s.paper = present);
    }

    /// Answer the next `count` start requests with busy.
    pub fn set_busy_starts(&self, count: u32) {
        self.with(|s| s.busy_starts = count);
    }

    /// Stay busy until an abort arrives, like a device left mid-session.
    pub fn set_wedged(&self, wedged: bool) {
        self.with(|s| s.wedged = wedged);
    }

    pub fn set_calibration_polls(&self, polls: u32) {
        self.with(|s| s.calibration_polls = polls);
    }

    /// Empty blocks before the first data block.
    pub fn set_empty_blocks(&self, count: u32) {
        self.with(|s| s.empty_blocks = count);
    }

    pub fn fail_after_blocks(&self, blocks: u32) {
        self.with(|s| s.fail_after_blocks = Some(blocks));
    }

    /// End the image this many raw lines early.
    pub fn set_missing_lines(&self, lines: u32) {
        self.with(|s| s.missing_lines = lines);
    }

    pub fn press_button(&self, button: u8, target: u8) {
        let mut packet = vec![0u8; self.with(|s| s.table.interrupt.packet_len)];
        packet[0] = if button == 2 { 0x02 } else { 0x01 };
        packet[1] = target;
        self.with(|s| s.interrupts.push_back(packet));
    }

    pub fn request_time_sync(&self) {
        self.with(|s| {
            let mut packet = vec![0u8; s.table.interrupt.packet_len];
            let bit = s.table.interrupt.time_request;
            packet[bit.offset] |= bit.mask;
            s.interrupts.push_back(packet);
        });
    }

    pub fn disconnect(&self) {
        self.with(|s| s.connected = false);
    }

    pub fn aborts(&self) -> u32 {
        self.with(|s| s.aborts)
    }

    pub fn is_session_open(&self) -> bool {
        self.with(|s| s.session_open)
    }

    pub fn opcodes(&self) -> Vec<u16> {
        self.with(|s| s.opcodes.clone())
    }

    pub fn count_opcode(&self, opcode: u16) -> usize {
        self.with(|s| s.opcodes.iter().filter(|&&op| op == opcode).count())
    }

    pub fn read_count(&self) -> usize {
        self.with(|s| s.reads)
    }

    pub fn last_time(&self) -> Option<String> {
        self.with(|s| s.last_time.clone())
    }
}

impl ScannerTransport for SimulatedScanner {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        self.with(|s| {
            if !s.connected {
                return Err(TransportError::Disconnected);
            }
            match decode_command(&s.table.frame, data) {
                Ok(cmd) => {
                    s.opcodes.push(cmd.opcode);
                    s.handle(cmd);
                }
                Err(e) => {
                    debug!(error = %e, "Simulated device rejected frame");
                    s.respond(StatusCode::FAILED, &[]);
                }
            }
            Ok(data.len())
        })
    }

    /// Returns an empty buffer, like a zero-length packet, when nothing
    /// is queued.
    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        self.with(|s| {
            if !s.connected {
                return Err(TransportError::Disconnected);
            }
            s.reads += 1;
            let n = max_len.min(s.outbox.len());
            Ok(s.outbox.drain(..n).collect())
        })
    }

    /// Never sleeps; an empty queue reads as an elapsed timeout.
    fn read_interrupt(
        &self,
        _max_len: usize,
        _timeout: Duration,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        self.with(|s| {
            if !s.connected {
                return Err(TransportError::Disconnected);
            }
            Ok(s.interrupts.pop_front())
        })
    }

    fn is_connected(&self) -> bool {
        self.with(|s| s.connected)
    }

    fn vendor_id(&self) -> u16 {
        self.with(|s| s.vid)
    }

    fn product_id(&self) -> u16 {
        self.with(|s| s.pid)
    }
}
