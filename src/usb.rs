// Based on USB 2.0 specifications
// https://www.usb.org/document-library/usb-20-specification
// especially usb_20.pdf

pub mod bits;
pub mod engine;
pub mod error;
pub mod packet;
pub mod protocol;
pub mod request;
pub mod session;
pub mod signal;
pub mod sim;
pub mod timing;
pub mod transport;
pub mod types;

pub use engine::{Endpoint, Pipe, Status, TransferKind, TransferOutcome};
pub use error::{DecodeError, FramingError, TransferError};
pub use packet::Packet;
pub use session::{AbortHandle, BusSession};
pub use signal::LineSymbol;
pub use timing::{BusConfig, Speed, Ticks};
pub use transport::LineTransport;
