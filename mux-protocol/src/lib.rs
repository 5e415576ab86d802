//! Wire framing for the host-side USB mux protocol.
//!
//! This crate is purely computational: it has no knowledge of USB
//! transports, sockets, or the event loop that drives them. It exposes
//! two independent wire formats:
//!
//! - [`mux_frame`]: the USB-side mux protocol (VERSION/CONTROL/SETUP/TCP).
//! - [`envelope`]: the loopback client command envelope and legacy
//!   binary message bodies.
//!
//! [`plist_ext`] adds typed accessors over `plist::Value` for the
//! version-1 (plist) client protocol.

pub mod envelope;
pub mod mux_frame;
pub mod plist_ext;

pub use envelope::{Envelope, EnvelopeError};
pub use mux_frame::{FramingError, MuxHeader, MuxProtocol, MuxSeq, MuxVersion, TcpSubHeader, VersionHeader};
