//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod observed;
pub mod sim;
pub mod traits;

pub use mock::{MockReply, MockTransport};
pub use nusb::{NusbTransport, UsbTimeouts};
pub use observed::ObservedTransport;
pub use sim::SimulatedScanner;
pub use traits::{DeviceCondition, ScannerTransport, TransportError};
