//! Busway Daemon - Message Bus Server
//!
//! The daemon side of a busway bus: it accepts connections from
//! [`busway_core::Connection`]s, hands out unique names, arbitrates
//! well-known names and routes frames between peers.
//!
//! # Module Overview
//!
//! - [`server`]: Accept loop, per-peer handlers and routing
//! - [`names`]: Name ownership queues and peer identifiers

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod names;
pub mod server;

pub use names::{ConnectionId, NameTable, Promotion};
pub use server::{BusDaemon, ConnectionStats, ServerConfig};
