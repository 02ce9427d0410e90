//! Protocol module - wire format of the scanner command channel.

pub mod commands;
pub mod constants;
pub mod frame;
pub mod status;

pub use commands::{CommandTable, ProtocolFamily, ScanParams};
pub use constants::*;
pub use frame::{Command, FrameError, FrameLayout, Response};
pub use status::{StatusClass, StatusCode};
