//! A multi-threaded TLS-terminating TCP tunnel.
//!
//! The server accepts TLS connections on a configured bind address,
//! terminates TLS, opens a paired plaintext TCP connection to a configured
//! destination and shuttles bytes in both directions until either side is
//! done. Connections are distributed round-robin over a fixed pool of
//! worker threads, each running its own non-blocking event loop.

#![warn(missing_docs)]

pub mod fifo;
pub mod tunnel_config;
pub mod tunnel_error;

mod session;
mod timer;
mod tls_engine;
mod tunnel_server;
mod util;
mod worker;

pub use fifo::RingFifo;
pub use tunnel_config::TunnelConfig;
pub use tunnel_error::{ConfigError, TunnelError, TunnelResult};
pub use tunnel_server::{Server, ShutdownHandle};
