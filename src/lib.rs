//! Model of the USB 2.0 low and full speed link layer.
//!
//! [`usb::BusSession`] turns transfer requests into line symbols driven through a
//! [`usb::LineTransport`], and decodes what comes back. The same codecs back the trace
//! decoding stages used by the command line tool.

pub mod pipeline;
pub mod sink;
pub mod source;
pub mod usb;
