//! Transport Layer for Connection-Daemon IPC
//!
//! Provides the pieces a [`Connection`](crate::Connection) is built from:
//! - [`TransportHandle`]: the exclusively owned socket to the bus daemon
//! - [`frame`]: length-prefixed, CRC32-checked framing of [`Envelope`]s
//! - [`config`]: bus addresses, bus kind selection and timeouts
//!
//! # Security
//!
//! - Only Unix domain sockets are supported; no network exposure
//! - The bus daemon validates peers with `SO_PEERCRED`
//!
//! [`Envelope`]: crate::protocol::Envelope

pub mod config;
mod error;
pub mod frame;
pub(crate) mod handle;

pub use config::{BusConfig, BusKind, ConfigError};
pub use error::TransportError;
pub use frame::{encode, FrameDecoder};
pub use handle::{FrameReader, Greeting, TransportHandle};
