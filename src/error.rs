//! Error types for the mux core. Each module gets its own `thiserror`
//! enum; nothing here ever needs to unwind the reactor (§7) — these are
//! the types that let the call site decide how to recover locally.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("usb error: {0}")]
    Usb(String),
    #[error("device disconnected")]
    Disconnected,
    #[error("endpoint stalled")]
    Stalled,
    #[error("transfer cancelled")]
    Cancelled,
    #[error("short write (wrote {wrote}, wanted {wanted})")]
    ShortWrite { wrote: usize, wanted: usize },
    #[error("no suitable mux interface on device")]
    NoMuxInterface,
}

#[derive(Debug, Error)]
pub enum ConfigStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("plist error: {0}")]
    Plist(#[from] plist::Error),
    #[error("pair record missing required key: {0}")]
    MissingKey(&'static str),
    #[error("no such record")]
    NotFound,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("flow control violation: inbound buffer overflow")]
    InboundOverflow,
    #[error("peer reset the connection")]
    PeerReset,
    #[error("unexpected handshake reply")]
    BadHandshake,
    #[error("client socket error")]
    ClientIoError,
    #[error("no free source port")]
    PortsExhausted,
}

#[derive(Debug, Error)]
pub enum ClientProtocolError {
    #[error("bad command")]
    BadCommand,
    #[error("unsupported wire version {0}")]
    BadVersion(u32),
    #[error("frame too large for inbound buffer")]
    FrameTooLarge,
    #[error("malformed plist body: {0}")]
    Plist(#[from] plist::Error),
    #[error(transparent)]
    Envelope(#[from] mux_protocol::EnvelopeError),
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    ConfigStore(#[from] ConfigStoreError),
    #[error(transparent)]
    ClientProtocol(#[from] ClientProtocolError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
