//! Unix socket server
//!
//! A listener plus a dense table of buffered client connections, driven by
//! one `mio` readiness loop. Transport and protocol failures close only
//! the connection they happen on; closing a connection releases every area
//! and mapping it held.

mod connection;
mod listener;
pub mod multiplexer;

pub use multiplexer::{shutdown_on_signals, Server, ShutdownHandle};
