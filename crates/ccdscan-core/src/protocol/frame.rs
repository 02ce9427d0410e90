//! Command and response frame codec.
//!
//! A command frame is a fixed header (opcode, flag byte, big-endian length
//! of "bytes out + bytes expected back") followed by an optional payload
//! whose last byte is a checksum. Responses carry a status header and an
//! optional checksummed data area. Block responses to the read-image
//! command use their own header with flags and a declared size.
//!
//! Everything here is a pure transform over byte slices; the session
//! decides what a short or failed response means.

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use thiserror::Error;

use super::constants::*;
use super::status::StatusCode;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("Frame of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },
    #[error("Checksum mismatch: data sums to 0x{sum:02X}")]
    Checksum { sum: u8 },
    #[error("Length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Byte positions of the fixed frame fields for one device family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLayout {
    pub command_header_len: usize,
    pub response_header_len: usize,
    pub opcode_offset: usize,
    pub flag_offset: usize,
    /// Big-endian u32 "payload + expected response" length.
    pub length_offset: usize,
    pub command_checksum: bool,
    pub response_checksum: bool,
    pub max_frame_len: usize,
}

impl Default for FrameLayout {
    fn default() -> Self {
        Self {
            command_header_len: COMMAND_HEADER_LEN,
            response_header_len: RESPONSE_HEADER_LEN,
            opcode_offset: 0,
            flag_offset: FLAG_OFFSET,
            length_offset: LENGTH_FIELD_OFFSET,
            command_checksum: true,
            response_checksum: true,
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

/// Header layout of image block responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLayout {
    pub header_len: usize,
    pub flags_offset: usize,
    pub size_offset: usize,
    /// Upper bound for a single block.
    pub max_block: usize,
    /// Requests are rounded down to a multiple of this.
    pub granule: usize,
    pub first_read: usize,
    pub tail_request: usize,
}

impl Default for BlockLayout {
    fn default() -> Self {
        Self {
            header_len: BLOCK_HEADER_LEN,
            flags_offset: BLOCK_FLAGS_OFFSET,
            size_offset: BLOCK_SIZE_OFFSET,
            max_block: IMAGE_BLOCK_SIZE,
            granule: IMAGE_BLOCK_GRANULE,
            first_read: BLOCK_FIRST_READ,
            tail_request: BLOCK_TAIL_REQUEST,
        }
    }
}

/// Wrapping sum of all bytes.
pub fn sum_bytes(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Store the two's complement of the preceding bytes in the last byte so
/// the whole slice sums to zero.
pub fn fill_checksum(data: &mut [u8]) {
    if let Some((last, rest)) = data.split_last_mut() {
        *last = 0u8.wrapping_sub(sum_bytes(rest));
    }
}

/// A command ready to be encoded.
///
/// The payload already has its final length; when the layout requires a
/// checksum, the last payload byte is overwritten on encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub opcode: u16,
    pub flag: u8,
    pub payload: Vec<u8>,
    /// Data bytes expected back after the response header, checksum included.
    pub response_len: usize,
}

impl Command {
    pub fn new(opcode: u16) -> Self {
        Self {
            opcode,
            flag: 0,
            payload: Vec::new(),
            response_len: 0,
        }
    }

    pub fn with_flag(mut self, flag: u8) -> Self {
        self.flag = flag;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn expect_response(mut self, len: usize) -> Self {
        self.response_len = len;
        self
    }

    pub fn encode(&self, layout: &FrameLayout) -> Result<Vec<u8>, FrameError> {
        let len = layout.command_header_len + self.payload.len();
        if len > layout.max_frame_len {
            return Err(FrameError::TooLarge {
                len,
                max: layout.max_frame_len,
            });
        }
        let mut frame = vec![0u8; layout.command_header_len];
        BigEndian::write_u16(&mut frame[layout.opcode_offset..], self.opcode);
        frame[layout.flag_offset] = self.flag;
        BigEndian::write_u32(
            &mut frame[layout.length_offset..],
            (self.payload.len() + self.response_len) as u32,
        );
        frame.extend_from_slice(&self.payload);
        if layout.command_checksum && !self.payload.is_empty() {
            fill_checksum(&mut frame[layout.command_header_len..]);
        }
        Ok(frame)
    }
}

/// Decoded response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub data: Vec<u8>,
    /// Fewer data bytes than expected arrived; `data` holds what did.
    pub truncated: bool,
}

/// Decode a response to a command expecting `expected` data bytes.
///
/// A short response is returned as its available prefix with `truncated`
/// set, because failure responses often carry only the header. A complete
/// response has its checksum verified.
pub fn decode_response(
    layout: &FrameLayout,
    frame: &[u8],
    expected: usize,
) -> Result<Response, FrameError> {
    if frame.len() < layout.response_header_len {
        return Err(FrameError::BufferTooSmall {
            expected: layout.response_header_len,
            actual: frame.len(),
        });
    }
    // Checked above, cannot fail.
    let status = StatusCode::from_bytes(frame).unwrap_or(StatusCode::new(0));
    let data = &frame[layout.response_header_len..];

    if data.len() > expected {
        return Err(FrameError::LengthMismatch {
            expected: layout.response_header_len + expected,
            actual: frame.len(),
        });
    }
    let truncated = data.len() < expected;
    if !truncated && expected > 0 && layout.response_checksum {
        let sum = sum_bytes(data);
        if sum != 0 {
            return Err(FrameError::Checksum { sum });
        }
    }
    Ok(Response {
        status,
        data: data.to_vec(),
        truncated,
    })
}

/// A command as seen from the device side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCommand {
    pub opcode: u16,
    pub flag: u8,
    pub payload: Vec<u8>,
    pub response_len: usize,
}

/// Parse a command frame. Used by the simulated device and tests.
pub fn decode_command(layout: &FrameLayout, frame: &[u8]) -> Result<DecodedCommand, FrameError> {
    if frame.len() < layout.command_header_len {
        return Err(FrameError::BufferTooSmall {
            expected: layout.command_header_len,
            actual: frame.len(),
        });
    }
    let opcode = BigEndian::read_u16(&frame[layout.opcode_offset..]);
    let total = BigEndian::read_u32(&frame[layout.length_offset..]) as usize;
    let payload = &frame[layout.command_header_len..];
    if payload.len() > total {
        return Err(FrameError::LengthMismatch {
            expected: total,
            actual: payload.len(),
        });
    }
    if layout.command_checksum && !payload.is_empty() {
        let sum = sum_bytes(payload);
        if sum != 0 {
            return Err(FrameError::Checksum { sum });
        }
    }
    Ok(DecodedCommand {
        opcode,
        flag: frame[layout.flag_offset],
        payload: payload.to_vec(),
        response_len: total - payload.len(),
    })
}

/// Build a response frame. `data` has its final length; its last byte is
/// replaced by the checksum when the layout requires one.
pub fn encode_response(layout: &FrameLayout, status: StatusCode, data: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; layout.response_header_len];
    BigEndian::write_u16(&mut frame, status.value());
    frame.extend_from_slice(data);
    if layout.response_checksum && !data.is_empty() {
        fill_checksum(&mut frame[layout.response_header_len..]);
    }
    frame
}

/// Parsed header of an image block response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub status: StatusCode,
    pub flags: u8,
    pub declared: usize,
}

pub fn decode_block_header(layout: &BlockLayout, bytes: &[u8]) -> Result<BlockHeader, FrameError> {
    if bytes.len() < layout.header_len {
        return Err(FrameError::BufferTooSmall {
            expected: layout.header_len,
            actual: bytes.len(),
        });
    }
    let mut cursor = Cursor::new(&bytes[layout.size_offset..layout.size_offset + 4]);
    let declared = cursor.read_u32::<BigEndian>()? as usize;
    Ok(BlockHeader {
        status: StatusCode::from_bytes(bytes).unwrap_or(StatusCode::new(0)),
        flags: bytes[layout.flags_offset],
        declared,
    })
}

/// Build an image block response (header + data, no checksum).
pub fn encode_block(layout: &BlockLayout, status: StatusCode, flags: u8, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(layout.header_len + data.len());
    frame.resize(layout.header_len, 0);
    BigEndian::write_u16(&mut frame, status.value());
    frame[layout.flags_offset] = flags;
    BigEndian::write_u32(&mut frame[layout.size_offset..], data.len() as u32);
    frame.extend_from_slice(data);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_header_fields() {
        let layout = FrameLayout::default();
        let frame = Command::new(CMD_STATUS)
            .expect_response(16)
            .encode(&layout)
            .unwrap();
        assert_eq!(frame.len(), 16);
        assert_eq!(&frame[0..2], &[0xF3, 0x20]);
        assert_eq!(&frame[12..16], &[0, 0, 0, 16]);
    }

    #[test]
    fn test_encode_payload_checksum() {
        let layout = FrameLayout::default();
        let mut payload = vec![0u8; 12];
        payload[0] = 1;
        payload[1] = 1;
        let frame = Command::new(CMD_SELECT_SOURCE)
            .with_flag(1)
            .with_payload(payload)
            .encode(&layout)
            .unwrap();
        assert_eq!(frame[3], 1);
        assert_eq!(BigEndian::read_u32(&frame[12..]), 12);
        assert_eq!(frame[16 + 11], 0xFE);
        assert_eq!(sum_bytes(&frame[16..]), 0);
    }

    #[test]
    fn test_encode_rejects_oversized() {
        let layout = FrameLayout::default();
        let cmd = Command::new(CMD_GAMMA).with_payload(vec![0; MAX_FRAME_LEN]);
        assert!(matches!(cmd.encode(&layout), Err(FrameError::TooLarge { .. })));
    }

    #[test]
    fn test_decode_full_response() {
        let layout = FrameLayout::default();
        let frame = encode_response(&layout, StatusCode::OK, &[0, 1, 2, 3, 0]);
        let resp = decode_response(&layout, &frame, 5).unwrap();
        assert!(resp.status.is_ok());
        assert!(!resp.truncated);
        assert_eq!(&resp.data[..4], &[0, 1, 2, 3]);
    }

    #[test]
    fn test_decode_checksum_mismatch() {
        let layout = FrameLayout::default();
        let mut frame = encode_response(&layout, StatusCode::OK, &[7, 7, 7, 0]);
        frame[9] ^= 0x01;
        assert!(matches!(
            decode_response(&layout, &frame, 4),
            Err(FrameError::Checksum { .. })
        ));
    }

    #[test]
    fn test_decode_returns_available_prefix() {
        let layout = FrameLayout::default();
        let frame = encode_response(&layout, StatusCode::BUSY, &[]);
        let resp = decode_response(&layout, &frame, 16).unwrap();
        assert!(resp.truncated);
        assert!(resp.data.is_empty());
        assert_eq!(resp.status, StatusCode::BUSY);
    }

    #[test]
    fn test_decode_too_short_or_long() {
        let layout = FrameLayout::default();
        assert!(matches!(
            decode_response(&layout, &[0x06, 0x06, 0], 0),
            Err(FrameError::BufferTooSmall { .. })
        ));
        let frame = encode_response(&layout, StatusCode::OK, &[0; 8]);
        assert!(matches!(
            decode_response(&layout, &frame, 4),
            Err(FrameError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_device_side_decode() {
        let layout = FrameLayout::default();
        let frame = Command::new(CMD_SCAN_PARAM)
            .with_payload(vec![0x42; SCAN_PARAM_LEN])
            .expect_response(0)
            .encode(&layout)
            .unwrap();
        let cmd = decode_command(&layout, &frame).unwrap();
        assert_eq!(cmd.opcode, CMD_SCAN_PARAM);
        assert_eq!(cmd.payload.len(), SCAN_PARAM_LEN);
        assert_eq!(cmd.response_len, 0);
    }

    #[test]
    fn test_block_header() {
        let layout = BlockLayout::default();
        let frame = encode_block(&layout, StatusCode::OK, 0x28, &[1, 2, 3]);
        let header = decode_block_header(&layout, &frame).unwrap();
        assert_eq!(header.flags, 0x28);
        assert_eq!(header.declared, 3);
        assert_eq!(&frame[16..], &[1, 2, 3]);
    }
}
