//! Protocol constants for the Canon PIXMA / CanoScan USB scanner family.

// ============================================================================
// Device Identification
// ============================================================================

/// Canon Inc. Vendor ID
pub const CANON_VENDOR_ID: u16 = 0x04A9;

// Contact image sensor models
pub const MP150_PID: u16 = 0x1709;
pub const MX850_PID: u16 = 0x172C;

// CCD models
pub const MP810_PID: u16 = 0x171A;
pub const MP960_PID: u16 = 0x171B;
pub const MP970_PID: u16 = 0x1726;
pub const MP990_PID: u16 = 0x1740;
pub const CS8800F_PID: u16 = 0x1901;
pub const CS9000F_PID: u16 = 0x1908;

// ============================================================================
// Status Codes (first two bytes of every response, big-endian)
// ============================================================================

pub const STATUS_OK: u16 = 0x0606;
pub const STATUS_BUSY: u16 = 0x1414;
/// Device rejected or cancelled the request.
pub const STATUS_FAILED: u16 = 0x1515;

// ============================================================================
// Opcodes (Host -> Device)
// ============================================================================

pub const CMD_START_SESSION: u16 = 0xDB20;
pub const CMD_SELECT_SOURCE: u16 = 0xDD20;
pub const CMD_GAMMA: u16 = 0xEE20;
pub const CMD_SCAN_PARAM: u16 = 0xDE20;
pub const CMD_STATUS: u16 = 0xF320;
pub const CMD_ABORT_SESSION: u16 = 0xEF20;
pub const CMD_TIME: u16 = 0xEB80;
pub const CMD_READ_IMAGE: u16 = 0xD420;
pub const CMD_ERROR_INFO: u16 = 0xFF20;

// Extended family
pub const CMD_CALIBRATE_START: u16 = 0xD520;
pub const CMD_CALIBRATE_POLL: u16 = 0xD720;
pub const CMD_SCAN_PARAM_EXT: u16 = 0xD820;
pub const CMD_BEGIN_TRANSFER: u16 = 0xD920;
pub const CMD_STATUS_EXT: u16 = 0xDA20;

// ============================================================================
// Frame Sizes
// ============================================================================

/// Command header length.
pub const COMMAND_HEADER_LEN: usize = 16;
/// Response header length (status + reserved).
pub const RESPONSE_HEADER_LEN: usize = 8;
/// Offset of the big-endian "out + in" length field in a command header.
pub const LENGTH_FIELD_OFFSET: usize = 12;
/// Offset of the per-command flag byte.
pub const FLAG_OFFSET: usize = 3;

/// Largest command or response frame the device accepts.
pub const MAX_FRAME_LEN: usize = 4096 + 24;

// ============================================================================
// Image Blocks
// ============================================================================

/// Largest image block the device returns in one transaction.
pub const IMAGE_BLOCK_SIZE: usize = 512 * 1024;
/// Block requests are issued in multiples of this granularity.
pub const IMAGE_BLOCK_GRANULE: usize = 64 * 1024;
/// Block response header: status (8) + flags/size (8).
pub const BLOCK_HEADER_LEN: usize = 16;
pub const BLOCK_FLAGS_OFFSET: usize = 8;
pub const BLOCK_SIZE_OFFSET: usize = 12;
/// Size of the first read of every block.
pub const BLOCK_FIRST_READ: usize = 512;
/// Request size used once the device flagged the last block.
pub const BLOCK_TAIL_REQUEST: usize = 32;

/// Error record returned by the error-info command.
pub const ERROR_INFO_LEN: usize = 16;

// ============================================================================
// Interrupt Packets
// ============================================================================

/// Interrupt packets arrive in multiples of this size.
pub const INTERRUPT_PACKET_LEN: usize = 16;
pub const INTERRUPT_READ_LEN: usize = 64;

// ============================================================================
// Payload Sizes
// ============================================================================

pub const SELECT_SOURCE_LEN: usize = 12;
pub const SCAN_PARAM_LEN: usize = 0x30;
pub const SCAN_PARAM_EXT_LEN: usize = 0x38;
pub const TIME_PAYLOAD_LEN: usize = 20;
/// Full 4096-entry gamma table plus header.
pub const GAMMA_FULL_LEN: usize = 4096 + 8;
/// Packed 1024-pair gamma table plus header.
pub const GAMMA_PACKED_LEN: usize = 2048 + 8;

/// Resolution values in the parameter block carry this marker bit.
pub const DPI_MARKER: u16 = 0x8000;

/// Geometry in device tables is expressed in 1/75 inch.
pub const BASE_DPI: u32 = 75;
