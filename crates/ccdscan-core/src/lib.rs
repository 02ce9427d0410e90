//! ccdscan-core: USB protocol driver for Canon PIXMA and CanoScan scanners.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Frame codec, status codes and per-family command tables
//! - **Transport**: USB communication abstraction (nusb, mock, simulator)
//! - **Channel / Reader**: Request/response transactions and image blocks
//! - **Negotiate**: Turns a scan request into device parameters
//! - **Pipeline**: De-shift, reorder, crop and convert raw lines
//! - **Monitor**: Interrupt packets and status tracking
//! - **Session**: Lifecycle orchestrator with retry and teardown
//! - **Events**: Observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ccdscan_core::{DeviceProfile, Scanner, ScanRequest, SessionConfig, TracingObserver};
//!
//! let profile = DeviceProfile::find("MP810").expect("known model");
//! let mut scanner = Scanner::open_usb(profile, SessionConfig::default(), Arc::new(TracingObserver))
//!     .expect("open failed");
//! scanner.configure(&ScanRequest::default()).expect("bad request");
//! scanner.start().expect("start failed");
//! for line in scanner.lines() {
//!     let line = line.expect("scan failed");
//!     // ...
//! #   drop(line);
//! }
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod monitor;
pub mod negotiate;
pub mod pipeline;
pub mod profile;
pub mod protocol;
pub mod reader;
pub mod request;
pub mod retry;
pub mod scanner;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use config::SessionConfig;
pub use error::{DriverError, ErrorKind, Phase, ScanError};
pub use events::{LogLevel, NullObserver, ScanEvent, ScanObserver, TracingObserver};
pub use monitor::{DeviceEvent, DeviceStatus};
pub use negotiate::{OutputFormat, RawGeometry, ScanPlan, resolve};
pub use profile::{DeviceProfile, builtin_profiles};
pub use request::{ColorMode, LineartParams, PaperSource, ScanArea, ScanRequest};
pub use retry::CancelToken;
pub use scanner::Scanner;
pub use session::SessionController;
pub use state::SessionState;
pub use transport::{
    MockTransport, NusbTransport, ScannerTransport, SimulatedScanner, TransportError,
};
