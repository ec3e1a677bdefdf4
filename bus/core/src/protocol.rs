//! Wire Envelopes
//!
//! Everything exchanged between a connection and the bus daemon is one
//! [`Envelope`]. Control envelopes (hello, name requests and their replies)
//! are handled by this crate; [`Envelope::Message`] carries a [`Frame`] that
//! is handed to the dispatch surface untouched.
//!
//! Frame bodies are opaque bytes. Marshalling them is the job of the layer
//! above the connection.

use serde::{Deserialize, Serialize};

/// Well-known name of the bus daemon itself
pub const BUS_DAEMON_NAME: &str = "org.freedesktop.DBus";

/// Object path the bus daemon emits its signals from
pub const BUS_DAEMON_PATH: &str = "/org/freedesktop/DBus";

/// Interface of the bus daemon signals
pub const BUS_DAEMON_INTERFACE: &str = "org.freedesktop.DBus";

/// Signal sent to a connection that was promoted to owner of a queued name
pub const NAME_ACQUIRED_SIGNAL: &str = "NameAcquired";

/// D-Bus style error names
pub mod error_names {
    /// Generic failure
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    /// Invalid arguments, including malformed names
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    /// I/O failure
    pub const IO_ERROR: &str = "org.freedesktop.DBus.Error.IOError";
    /// Name is owned by someone else
    pub const NAME_EXISTS: &str = "org.freedesktop.DBus.Error.NameExists";
    /// Name has no owner
    pub const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
    /// Destination could not be resolved
    pub const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
}

/// Type of a [`Frame`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Call expecting a return or error
    MethodCall,
    /// Successful reply to a call
    MethodReturn,
    /// Error reply to a call
    Error,
    /// Broadcast or unicast notification
    Signal,
}

/// One complete unit of IPC data as delivered by the transport
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// What kind of message this is
    pub kind: MessageKind,
    /// Serial assigned by the sending connection
    pub serial: u32,
    /// Serial of the call this frame answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_serial: Option<u32>,
    /// Unique name of the sender, stamped by the bus daemon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Unique or well-known name of the recipient; `None` broadcasts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    /// Object path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Interface name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    /// Method or signal name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
    /// Error name, for [`MessageKind::Error`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_name: Option<String>,
    /// Marshalled body
    #[serde(default)]
    pub body: Vec<u8>,
}

impl Frame {
    fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            serial: 0,
            reply_serial: None,
            sender: None,
            destination: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            body: Vec::new(),
        }
    }

    /// Create a method call addressed to `destination`
    #[must_use]
    pub fn method_call(destination: &str, path: &str, interface: &str, member: &str) -> Self {
        Self {
            destination: Some(destination.to_string()),
            path: Some(path.to_string()),
            interface: Some(interface.to_string()),
            member: Some(member.to_string()),
            ..Self::new(MessageKind::MethodCall)
        }
    }

    /// Create a broadcast signal
    #[must_use]
    pub fn signal(path: &str, interface: &str, member: &str) -> Self {
        Self {
            path: Some(path.to_string()),
            interface: Some(interface.to_string()),
            member: Some(member.to_string()),
            ..Self::new(MessageKind::Signal)
        }
    }

    /// Create the successful reply to `call`
    #[must_use]
    pub fn method_return(call: &Frame) -> Self {
        Self {
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            ..Self::new(MessageKind::MethodReturn)
        }
    }

    /// Create an error reply to `call`; the message travels as UTF-8 body
    #[must_use]
    pub fn error(call: &Frame, error_name: &str, message: &str) -> Self {
        Self {
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            error_name: Some(error_name.to_string()),
            body: message.as_bytes().to_vec(),
            ..Self::new(MessageKind::Error)
        }
    }

    /// Set the body
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Set the destination
    #[must_use]
    pub fn with_destination(mut self, destination: &str) -> Self {
        self.destination = Some(destination.to_string());
        self
    }

    /// Whether this is the given signal from the bus daemon itself
    #[must_use]
    pub fn is_bus_signal(&self, member: &str) -> bool {
        self.kind == MessageKind::Signal
            && self.sender.as_deref() == Some(BUS_DAEMON_NAME)
            && self.member.as_deref() == Some(member)
    }
}

/// Flags for a name request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameFlags {
    /// Wait in the owner queue instead of failing when the name is taken
    #[serde(default)]
    pub allow_queue: bool,
}

impl NameFlags {
    /// Flags that queue behind the current owner
    #[must_use]
    pub fn queue() -> Self {
        Self { allow_queue: true }
    }
}

/// Daemon answer to a name request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestNameReply {
    /// The caller now owns the name
    PrimaryOwner,
    /// The name is taken; the caller was queued
    InQueue,
    /// The name is taken and queueing was not requested
    Exists,
    /// The caller already owned the name
    AlreadyOwner,
}

/// Daemon answer to a name release
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseNameReply {
    /// The caller released ownership or left the queue
    Released,
    /// Nobody owns the name
    NonExistent,
    /// Someone else owns the name and the caller is not queued
    NotOwner,
}

/// Unit of exchange on the transport
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// First envelope on a new connection
    Hello {
        /// Request serial
        serial: u32,
    },
    /// Daemon greeting
    HelloReply {
        /// Serial of the hello
        reply_serial: u32,
        /// Unique name assigned to the connection
        unique_name: String,
        /// Identity of the bus daemon instance
        bus_id: String,
    },
    /// Ask for ownership of a well-known name
    RequestName {
        /// Request serial
        serial: u32,
        /// Name to acquire
        name: String,
        /// Request flags
        #[serde(default)]
        flags: NameFlags,
    },
    /// Answer to [`Envelope::RequestName`]
    RequestNameReply {
        /// Serial of the request
        reply_serial: u32,
        /// Outcome
        reply: RequestNameReply,
    },
    /// Give up a well-known name
    ReleaseName {
        /// Request serial
        serial: u32,
        /// Name to release
        name: String,
    },
    /// Answer to [`Envelope::ReleaseName`]
    ReleaseNameReply {
        /// Serial of the request
        reply_serial: u32,
        /// Outcome
        reply: ReleaseNameReply,
    },
    /// The daemon rejected a control request
    ControlError {
        /// Serial of the request
        reply_serial: u32,
        /// D-Bus style error name
        name: String,
        /// Human-readable explanation
        message: String,
    },
    /// A frame for the dispatch surface
    Message(Frame),
}

impl Envelope {
    /// Serial of the control request this envelope answers
    #[must_use]
    pub fn reply_serial(&self) -> Option<u32> {
        match self {
            Self::HelloReply { reply_serial, .. }
            | Self::RequestNameReply { reply_serial, .. }
            | Self::ReleaseNameReply { reply_serial, .. }
            | Self::ControlError { reply_serial, .. } => Some(*reply_serial),
            _ => None,
        }
    }
}
