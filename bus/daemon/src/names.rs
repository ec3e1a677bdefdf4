//! Daemon Name Table
//!
//! Which peer owns each well-known name, and who waits in line for it.
//!
//! ```text
//!   "org.example.Service" ──► [ :1.3 (owner), :1.7, :1.9 ]
//!   "org.example.Other"   ──► [ :1.4 (owner) ]
//! ```
//!
//! The table is plain data. The server wraps it in a mutex and turns the
//! promotions it reports into `NameAcquired` signals.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use busway_core::{NameFlags, ReleaseNameReply, RequestNameReply};

/// Identifier of one peer connection, shown as its unique bus name
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a connection ID from a raw counter value
    #[must_use]
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":1.{}", self.0)
    }
}

impl FromStr for ConnectionId {
    type Err = ();

    /// Parse a unique name (`:1.N`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix(":1.")
            .and_then(|n| n.parse().ok())
            .map(Self)
            .ok_or(())
    }
}

/// A name that changed primary owner because its previous owner left
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Promotion {
    /// The well-known name
    pub name: String,
    /// The new primary owner
    pub owner: ConnectionId,
}

/// Ownership queues of all well-known names on the bus
#[derive(Debug, Default)]
pub struct NameTable {
    queues: HashMap<String, VecDeque<ConnectionId>>,
}

impl NameTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle a name request from `peer`
    pub fn request(&mut self, name: &str, peer: ConnectionId, flags: NameFlags) -> RequestNameReply {
        let queue = self.queues.entry(name.to_string()).or_default();

        match queue.iter().position(|id| *id == peer) {
            Some(0) => RequestNameReply::AlreadyOwner,
            Some(_) => RequestNameReply::InQueue,
            None if queue.is_empty() => {
                queue.push_back(peer);
                RequestNameReply::PrimaryOwner
            }
            None if flags.allow_queue => {
                queue.push_back(peer);
                RequestNameReply::InQueue
            }
            None => RequestNameReply::Exists,
        }
    }

    /// Handle a name release from `peer`
    ///
    /// Returns the reply and, if `peer` was the owner and someone was
    /// waiting, the promotion that follows.
    pub fn release(&mut self, name: &str, peer: ConnectionId) -> (ReleaseNameReply, Option<Promotion>) {
        let Some(queue) = self.queues.get_mut(name) else {
            return (ReleaseNameReply::NonExistent, None);
        };
        let Some(position) = queue.iter().position(|id| *id == peer) else {
            return (ReleaseNameReply::NotOwner, None);
        };

        queue.remove(position);
        let promotion = match queue.front() {
            Some(next) if position == 0 => Some(Promotion {
                name: name.to_string(),
                owner: *next,
            }),
            _ => None,
        };
        if queue.is_empty() {
            self.queues.remove(name);
        }
        (ReleaseNameReply::Released, promotion)
    }

    /// Drop `peer` from every queue, returning the resulting promotions
    pub fn remove_peer(&mut self, peer: ConnectionId) -> Vec<Promotion> {
        let mut promotions = Vec::new();

        self.queues.retain(|name, queue| {
            if let Some(position) = queue.iter().position(|id| *id == peer) {
                queue.remove(position);
                if position == 0 {
                    if let Some(next) = queue.front() {
                        promotions.push(Promotion {
                            name: name.clone(),
                            owner: *next,
                        });
                    }
                }
            }
            !queue.is_empty()
        });

        promotions.sort_by(|a, b| a.name.cmp(&b.name));
        promotions
    }

    /// Current primary owner of `name`
    #[must_use]
    pub fn owner(&self, name: &str) -> Option<ConnectionId> {
        self.queues.get(name).and_then(|queue| queue.front().copied())
    }

    /// Names whose primary owner is `peer`, sorted
    #[must_use]
    pub fn owned_by(&self, peer: ConnectionId) -> Vec<String> {
        let mut names: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.front() == Some(&peer))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Number of names with an owner
    #[must_use]
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    /// Whether no name is owned
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
