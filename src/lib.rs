//! Host-side USB mux protocol engine and virtual-connection fabric.
//!
//! [`dispatcher::MuxCore`] is the entry point: it owns every attached
//! device's session state and every client's command session, and drives
//! them from a single `tokio::select!` reactor (§4.5).

pub mod client;
pub mod config;
pub mod connection;
pub mod control;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod preflight;
pub mod transport;
pub mod util;

pub use dispatcher::{MuxConfig, MuxCore, DEFAULT_LISTEN_PORT};
pub use error::CoreError;
