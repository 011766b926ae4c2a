//! Non-blocking relay core for an encrypted SOCKS5 tunnel.
//!
//! A single-threaded, readiness-driven dispatcher (`server`) drives a
//! table of per-connection state machines (`handler`) through a SOCKS5
//! handshake and a bidirectional byte pump, encrypting or decrypting
//! each direction through a pluggable [`cipher::StreamCipher`]. Idle
//! connections are reclaimed by an amortised sweep (`timeout`). Both
//! the local (SOCKS5-facing) and remote (upstream-facing) roles share
//! this core; only their address codec entry points differ.

pub mod cipher;
pub mod config;
pub mod error;
pub mod handler;
pub mod logging;
pub mod resolver;
pub mod server;
pub mod socks;
pub mod timeout;

pub use config::Config;
pub use server::{HandlerId, Server};

/// Seconds since the Unix epoch, the clock both `Handler` and
/// `TimeoutQueue` measure activity against.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs()
}
