//! Busway Core - Bus Connections and Processing Loops
//!
//! This crate connects an application to a busway bus daemon (a D-Bus style
//! message bus on a Unix socket), manages the well-known names it owns, and
//! pumps incoming frames to a dispatch callback either on the caller's
//! thread or on a background thread.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Connection                            │
//! │  ┌──────────────┐  ┌───────────────┐  ┌────────────────────┐ │
//! │  │ NameRegistry │  │  LoopControl  │  │  DispatchHandler   │ │
//! │  │ (owned names)│  │ Idle/Sync/Async│ │ (frame callback)   │ │
//! │  └──────────────┘  └───────┬───────┘  └─────────▲──────────┘ │
//! │                            │ run()              │ dispatch   │
//! │                     ┌──────▼─────────────────────┴──────┐    │
//! │                     │               Engine               │    │
//! │                     └──────────────────┬─────────────────┘    │
//! │                                        │                      │
//! │                     ┌──────────────────▼─────────────────┐    │
//! │                     │ TransportHandle (Unix socket, CRC) │    │
//! │                     └──────────────────┬─────────────────┘    │
//! └────────────────────────────────────────┼──────────────────────┘
//!                                          │
//!                                   busway-daemon
//! ```
//!
//! # Key Types
//!
//! - [`Connection`]: Owns the transport, the name registry and the loop
//! - [`BusConnection`]: Capability trait implemented by [`Connection`]
//! - [`DispatchHandler`]: Receives every incoming [`Frame`]
//! - [`LoopStopper`]: Leaves a processing loop from any thread
//! - [`BusError`]: Failure taxonomy of all operations
//!
//! # Quick Start
//!
//! ```ignore
//! use busway_core::{create_session_bus_connection_with_name, Frame};
//!
//! let connection = create_session_bus_connection_with_name("org.example.Echo")?;
//! connection.set_dispatch_handler(|delivery| match delivery {
//!     Ok(frame) => println!("received {:?}", frame.member),
//!     Err(e) => eprintln!("skipped: {e}"),
//! });
//!
//! connection.enter_processing_loop_async()?;
//! // ... later
//! connection.leave_processing_loop()?;
//! ```
//!
//! # Module Overview
//!
//! - [`connection`]: The connection façade and loop entry points
//! - [`dispatch`]: The callback surface
//! - [`error`]: Error kinds
//! - [`factory`]: System/session connection factories
//! - [`names`]: Name registry and name validation
//! - [`processing_loop`]: Loop state machine and loop body
//! - [`protocol`]: Wire envelopes and frames
//! - [`transport`]: Socket, framing and configuration

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod connection;
pub mod dispatch;
pub mod error;
pub mod factory;
pub mod names;
pub mod processing_loop;
pub mod protocol;
pub mod transport;

// Re-exports for convenience
pub use connection::{BusConnection, Connection, LoopStopper};
pub use dispatch::{Delivery, DiscardHandler, DispatchHandler};
pub use error::{BusError, ErrorKind};
pub use names::{validate_bus_name, NameEntry, NameRegistry, NameStatus};
pub use processing_loop::LoopState;
pub use protocol::{
    error_names, Envelope, Frame, MessageKind, NameFlags, ReleaseNameReply, RequestNameReply,
};

// Factory exports
pub use factory::{
    create_connection, create_connection_with_name, create_session_bus_connection,
    create_session_bus_connection_with_name, create_system_bus_connection,
    create_system_bus_connection_with_name, open_connection,
};

// Transport exports
pub use transport::{BusConfig, BusKind, ConfigError, TransportError};
