//! Connection Factory
//!
//! Factory functions for creating connections to the system or session bus,
//! optionally acquiring a well-known name right away.
//!
//! The `create_*` functions read addresses and timeouts from the environment
//! (see [`BusConfig::from_env`]). Use [`open_connection`] to pass an explicit
//! configuration.
//!
//! [`create_connection`] always targets the system bus: the environment never
//! sets [`BusConfig::default_bus`]. To make the default bus a configuration
//! choice, load a [`BusConfig`] (e.g. with [`BusConfig::load`]) and call
//! `open_connection(&config, config.default_bus, None)`.

use tracing::debug;

use crate::connection::Connection;
use crate::error::BusError;
use crate::transport::{BusConfig, BusKind};

/// Open a connection to `bus`, requesting `name` if one is given
///
/// If the name request fails the connection is closed before the error is
/// returned; no partially set-up connection escapes.
///
/// # Errors
///
/// - `Transport` if the daemon cannot be reached
/// - `InvalidName` / `NameUnavailable` from the name request
///
/// # Example
///
/// ```ignore
/// use busway_core::{open_connection, BusConfig, BusKind};
///
/// let config = BusConfig::with_socket("/tmp/busway-test.sock");
/// let connection = open_connection(&config, BusKind::Session, Some("org.example.Demo"))?;
/// connection.enter_processing_loop_async()?;
/// ```
pub fn open_connection(
    config: &BusConfig,
    bus: BusKind,
    name: Option<&str>,
) -> Result<Connection, BusError> {
    // Reject a bad name before touching the socket
    if let Some(name) = name {
        crate::names::validate_bus_name(name)?;
    }

    let connection = Connection::open(config, bus)?;
    if let Some(name) = name {
        if let Err(e) = connection.request_name(name) {
            debug!(name, error = %e, "Name request failed, closing new connection");
            return Err(e);
        }
    }
    Ok(connection)
}

/// Connection to the default bus
///
/// Always [`BusKind::System`], since [`BusConfig::from_env`] never changes
/// `default_bus`. See the module docs for a configurable default.
pub fn create_connection() -> Result<Connection, BusError> {
    let config = BusConfig::from_env();
    open_connection(&config, config.default_bus, None)
}

/// Connection to the default bus, owning `name`
pub fn create_connection_with_name(name: &str) -> Result<Connection, BusError> {
    let config = BusConfig::from_env();
    open_connection(&config, config.default_bus, Some(name))
}

/// Anonymous connection to the system bus
pub fn create_system_bus_connection() -> Result<Connection, BusError> {
    open_connection(&BusConfig::from_env(), BusKind::System, None)
}

/// Connection to the system bus, owning `name`
pub fn create_system_bus_connection_with_name(name: &str) -> Result<Connection, BusError> {
    open_connection(&BusConfig::from_env(), BusKind::System, Some(name))
}

/// Anonymous connection to the session bus
pub fn create_session_bus_connection() -> Result<Connection, BusError> {
    open_connection(&BusConfig::from_env(), BusKind::Session, None)
}

/// Connection to the session bus, owning `name`
pub fn create_session_bus_connection_with_name(name: &str) -> Result<Connection, BusError> {
    open_connection(&BusConfig::from_env(), BusKind::Session, Some(name))
}
