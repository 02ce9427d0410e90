//! Command tables for the supported protocol families.
//!
//! A `CommandTable` is pure data: frame layout, opcodes and payload shapes.
//! The session controller only ever asks the table to build a command, so
//! supporting another family means adding a table, not a code path.

use byteorder::{BigEndian, ByteOrder};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::constants::*;
use super::frame::{BlockLayout, Command, FrameLayout};
use crate::request::PaperSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolFamily {
    /// First generation: 12-byte status, full 4096-entry gamma table.
    Legacy,
    /// 16-byte status, packed gamma table.
    Standard,
    /// Dedicated calibration and begin-transfer commands, 0x38-byte parameters.
    Extended,
}

/// Test a masked byte of a status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteTest {
    pub offset: usize,
    pub mask: u8,
    pub value: u8,
    #[serde(default)]
    pub negate: bool,
}

impl ByteTest {
    pub const fn equals(offset: usize, value: u8) -> Self {
        Self {
            offset,
            mask: 0xFF,
            value,
            negate: false,
        }
    }

    pub const fn bit(offset: usize, mask: u8) -> Self {
        Self {
            offset,
            mask,
            value: mask,
            negate: false,
        }
    }

    pub const fn nonzero(offset: usize) -> Self {
        Self {
            offset,
            mask: 0xFF,
            value: 0,
            negate: true,
        }
    }

    /// Bytes past the end of `data` never match.
    pub fn matches(&self, data: &[u8]) -> bool {
        data.get(self.offset)
            .is_some_and(|b| ((b & self.mask) == self.value) != self.negate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusQuery {
    pub opcode: u16,
    /// Response data length, checksum included.
    pub len: usize,
}

impl StatusQuery {
    pub fn command(&self) -> Command {
        Command::new(self.opcode).expect_response(self.len)
    }
}

/// Where the fields of the general status record live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusLayout {
    pub paper_present: ByteTest,
    /// Back-side sensor of duplex feeders.
    pub paper_present_back: Option<ByteTest>,
    pub calibrated: ByteTest,
    pub lamp_on: Option<ByteTest>,
    #[serde(default)]
    pub jammed: Option<ByteTest>,
    #[serde(default)]
    pub cover_open: Option<ByteTest>,
}

/// Photometric calibration commands of the extended family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationCommands {
    pub start: u16,
    pub start_flag: u8,
    /// Polled while the transparency lamp settles.
    pub lamp_poll: StatusQuery,
    pub lamp_ready: ByteTest,
}

/// Readiness poll run at the end of warm-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyQuery {
    pub query: StatusQuery,
    pub ready: ByteTest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GammaFormat {
    /// 4096 one-byte entries.
    Full,
    /// 1024 duplicated byte pairs sampled from the 4096-entry curve.
    Packed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GammaUpload {
    pub opcode: u16,
    pub format: GammaFormat,
    /// Some models only apply the curve after it was sent several times.
    pub repeat: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamLayout {
    /// 0x30-byte parameter block.
    Legacy,
    /// 0x38-byte parameter block.
    Extended,
}

/// Models that report a single button code byte instead of button bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonCode {
    pub offset: usize,
    /// Code of the second (stop) button; every other non-zero code is
    /// button 1. The high nibble is the target.
    pub button_2: u8,
}

/// Bit positions inside interrupt packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptLayout {
    pub packet_len: usize,
    pub read_len: usize,
    pub time_request: ByteTest,
    pub status_changed: ByteTest,
    pub button_1: ByteTest,
    pub button_2: ByteTest,
    pub target_offset: usize,
    /// High nibble of this byte carries the original-size selection.
    pub original_offset: usize,
    #[serde(default)]
    pub button_code: Option<ButtonCode>,
}

impl Default for InterruptLayout {
    fn default() -> Self {
        Self {
            packet_len: INTERRUPT_PACKET_LEN,
            read_len: INTERRUPT_READ_LEN,
            time_request: ByteTest::bit(3, 0x01),
            status_changed: ByteTest::bit(9, 0x02),
            button_1: ByteTest::bit(0, 0x01),
            button_2: ByteTest::bit(0, 0x02),
            target_offset: 1,
            original_offset: 0,
            button_code: None,
        }
    }
}

/// Values written into the scan parameter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanParams {
    pub source: PaperSource,
    pub infrared: bool,
    pub xdpi: u32,
    pub ydpi: u32,
    /// Left edge sent to the device, already moved back to the alignment grid.
    pub x: u32,
    pub y: u32,
    pub raw_width: u32,
    pub raw_height: u32,
    /// Device delivers one sample per pixel.
    pub single_channel: bool,
    pub bits_per_pixel: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTable {
    pub family: ProtocolFamily,
    pub frame: FrameLayout,
    pub block: BlockLayout,
    pub interrupt: InterruptLayout,
    pub start_session: u16,
    pub abort_session: u16,
    pub select_source: Option<u16>,
    pub scan_param: u16,
    pub param_layout: ParamLayout,
    pub gamma: Option<GammaUpload>,
    pub status: StatusQuery,
    pub status_layout: StatusLayout,
    pub ready: ReadyQuery,
    pub calibration: Option<CalibrationCommands>,
    pub begin_transfer: Option<u16>,
    pub read_image: u16,
    pub error_info: Option<StatusQuery>,
    pub time: Option<u16>,
}

impl CommandTable {
    pub fn for_family(family: ProtocolFamily) -> Self {
        let status_len = match family {
            ProtocolFamily::Legacy => 12,
            _ => 16,
        };
        let status = StatusQuery {
            opcode: CMD_STATUS,
            len: status_len,
        };
        let calibrated = match family {
            ProtocolFamily::Legacy => ByteTest::equals(8, 1),
            _ => ByteTest::equals(9, 1),
        };
        let ready = match family {
            ProtocolFamily::Extended => ReadyQuery {
                query: StatusQuery {
                    opcode: CMD_STATUS_EXT,
                    len: 8,
                },
                ready: ByteTest::bit(0, 0x01),
            },
            _ => ReadyQuery {
                query: status,
                ready: calibrated,
            },
        };
        let extended = family == ProtocolFamily::Extended;

        Self {
            family,
            frame: FrameLayout::default(),
            block: BlockLayout::default(),
            interrupt: InterruptLayout::default(),
            start_session: CMD_START_SESSION,
            abort_session: CMD_ABORT_SESSION,
            select_source: (!extended).then_some(CMD_SELECT_SOURCE),
            scan_param: if extended {
                CMD_SCAN_PARAM_EXT
            } else {
                CMD_SCAN_PARAM
            },
            param_layout: if extended {
                ParamLayout::Extended
            } else {
                ParamLayout::Legacy
            },
            gamma: Some(GammaUpload {
                opcode: CMD_GAMMA,
                format: match family {
                    ProtocolFamily::Legacy => GammaFormat::Full,
                    _ => GammaFormat::Packed,
                },
                repeat: if extended { 3 } else { 1 },
            }),
            status,
            status_layout: StatusLayout {
                paper_present: ByteTest::equals(1, 0),
                paper_present_back: Some(ByteTest::equals(2, 0)),
                calibrated,
                lamp_on: Some(ByteTest::nonzero(7)),
                jammed: None,
                cover_open: None,
            },
            ready,
            calibration: extended.then_some(CalibrationCommands {
                start: CMD_CALIBRATE_START,
                start_flag: 0x01,
                lamp_poll: StatusQuery {
                    opcode: CMD_CALIBRATE_POLL,
                    len: 8,
                },
                lamp_ready: ByteTest::equals(0, 3),
            }),
            begin_transfer: extended.then_some(CMD_BEGIN_TRANSFER),
            read_image: CMD_READ_IMAGE,
            error_info: Some(StatusQuery {
                opcode: CMD_ERROR_INFO,
                len: ERROR_INFO_LEN,
            }),
            time: Some(CMD_TIME),
        }
    }

    pub fn start_session(&self, tpu: bool) -> Command {
        Command::new(self.start_session).with_flag(tpu as u8)
    }

    pub fn abort_session(&self) -> Command {
        Command::new(self.abort_session)
    }

    pub fn select_source(&self, source: PaperSource) -> Option<Command> {
        let opcode = self.select_source?;
        let mut data = vec![0u8; SELECT_SOURCE_LEN];
        data[5] = (self.family == ProtocolFamily::Standard) as u8;
        match source {
            PaperSource::Flatbed => {
                data[0] = 1;
                data[1] = 1;
            }
            PaperSource::Adf => {
                data[0] = 2;
                data[5] = 1;
                data[6] = 1;
            }
            PaperSource::AdfDuplex => {
                data[0] = 2;
                data[5] = 3;
                data[6] = 3;
            }
            PaperSource::Tpu => {
                data[0] = 4;
                data[1] = 2;
            }
        }
        Some(Command::new(opcode).with_payload(data))
    }

    pub fn scan_param(&self, p: &ScanParams) -> Command {
        let data = match self.param_layout {
            ParamLayout::Legacy => legacy_params(p),
            ParamLayout::Extended => extended_params(p),
        };
        Command::new(self.scan_param).with_payload(data)
    }

    /// Upload command for a 4096-entry tone curve.
    pub fn gamma(&self, lut: &[u8], channels: u8) -> Option<Command> {
        let upload = self.gamma?;
        let data = match upload.format {
            GammaFormat::Full => {
                let mut data = vec![0u8; GAMMA_FULL_LEN];
                data[0] = if channels == 3 { 0x10 } else { 0x01 };
                BigEndian::write_u16(&mut data[2..], 0x1004);
                let n = lut.len().min(4096);
                data[4..4 + n].copy_from_slice(&lut[..n]);
                data
            }
            GammaFormat::Packed => {
                let mut data = vec![0u8; GAMMA_PACKED_LEN];
                data[0] = 0x10;
                BigEndian::write_u16(&mut data[2..], 0x0804);
                for i in 0..1024 {
                    let j = (i << 2) + (i >> 8);
                    let v = lut.get(j).copied().unwrap_or(0xFF);
                    data[4 + 2 * i] = v;
                    data[4 + 2 * i + 1] = v;
                }
                data
            }
        };
        Some(Command::new(upload.opcode).with_payload(data))
    }

    pub fn status_query(&self) -> Command {
        self.status.command()
    }

    pub fn ready_query(&self) -> Command {
        self.ready.query.command()
    }

    pub fn begin_transfer(&self, tpu: bool) -> Option<Command> {
        self.begin_transfer
            .map(|op| Command::new(op).with_flag(tpu as u8))
    }

    /// Read-image request for up to `request` data bytes.
    pub fn read_image(&self, request: usize) -> Command {
        Command::new(self.read_image)
            .expect_response(request + self.block.header_len - self.frame.response_header_len)
    }

    pub fn error_info(&self) -> Option<Command> {
        self.error_info.map(|q| q.command())
    }

    pub fn time_sync(&self, now: NaiveDateTime) -> Option<Command> {
        let opcode = self.time?;
        let mut data = vec![0u8; TIME_PAYLOAD_LEN];
        let text = now.format("%y/%m/%d %H:%M").to_string();
        let n = text.len().min(TIME_PAYLOAD_LEN - 2);
        data[..n].copy_from_slice(&text.as_bytes()[..n]);
        Some(Command::new(opcode).with_payload(data))
    }
}

fn legacy_params(p: &ScanParams) -> Vec<u8> {
    let mut data = vec![0u8; SCAN_PARAM_LEN];
    BigEndian::write_u16(&mut data[0x04..], p.xdpi as u16 | DPI_MARKER);
    BigEndian::write_u16(&mut data[0x06..], p.ydpi as u16 | DPI_MARKER);
    BigEndian::write_u32(&mut data[0x08..], p.x);
    BigEndian::write_u32(&mut data[0x0C..], p.y);
    BigEndian::write_u32(&mut data[0x10..], p.raw_width);
    BigEndian::write_u32(&mut data[0x14..], p.raw_height);
    data[0x18] = if p.single_channel { 0x04 } else { 0x08 };
    data[0x19] = p.bits_per_pixel;
    data[0x1A] = (p.source == PaperSource::Tpu) as u8;
    data[0x20] = 0xFF;
    data[0x23] = 0x81;
    data[0x26] = 0x02;
    data[0x27] = 0x01;
    data
}

fn extended_params(p: &ScanParams) -> Vec<u8> {
    let mut data = vec![0u8; SCAN_PARAM_EXT_LEN];
    data[0x00] = if p.source.is_feeder() { 0x02 } else { 0x01 };
    data[0x01] = 0x01;
    if p.source == PaperSource::Tpu {
        data[0x00] = if p.infrared { 0x03 } else { 0x04 };
        data[0x01] = 0x02;
        data[0x1E] = 0x02;
    }
    data[0x02] = 0x01;
    if p.source == PaperSource::AdfDuplex {
        data[0x02] = 0x03;
        data[0x03] = 0x03;
    }
    data[0x05] = 0x01;
    BigEndian::write_u16(&mut data[0x08..], p.xdpi as u16 | DPI_MARKER);
    BigEndian::write_u16(&mut data[0x0A..], p.ydpi as u16 | DPI_MARKER);
    BigEndian::write_u32(&mut data[0x0C..], p.x);
    BigEndian::write_u32(&mut data[0x10..], p.y);
    BigEndian::write_u32(&mut data[0x14..], p.raw_width);
    BigEndian::write_u32(&mut data[0x18..], p.raw_height);
    data[0x1C] = if p.single_channel { 0x04 } else { 0x08 };
    data[0x1D] = p.bits_per_pixel;
    data[0x1F] = 0x01;
    data[0x20] = 0xFF;
    data[0x21] = 0x81;
    data[0x23] = 0x02;
    data[0x24] = 0x01;
    data[0x30] = 0x01;
    data
}

/// Read the geometry back out of an encoded parameter block.
///
/// Returns `(raw_width, raw_height, bits_per_pixel)`.
pub fn parse_scan_param(layout: ParamLayout, payload: &[u8]) -> Option<(u32, u32, u8)> {
    let (w, h, bpp) = match layout {
        ParamLayout::Legacy => (0x10, 0x14, 0x19),
        ParamLayout::Extended => (0x14, 0x18, 0x1D),
    };
    if payload.len() <= bpp {
        return None;
    }
    Some((
        BigEndian::read_u32(&payload[w..]),
        BigEndian::read_u32(&payload[h..]),
        payload[bpp],
    ))
}
