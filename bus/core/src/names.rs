//! Name Registry
//!
//! Bookkeeping of the well-known names a connection holds or waits for.
//! The registry has no state machine of its own: the connection records an
//! entry after the daemon confirms a request and forgets it on release.
//!
//! Also home of well-known name validation, shared with the bus daemon.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::error::BusError;

/// Maximum length of a bus name in bytes
pub const MAX_NAME_LEN: usize = 255;

/// Check that `name` is a valid well-known bus name
///
/// Rules: 1 to 255 bytes, at least two dot-separated elements, no empty
/// elements, only `[A-Za-z0-9_-]`, no element starting with a digit. Unique
/// names (leading `:`) are assigned by the daemon and cannot be requested.
pub fn validate_bus_name(name: &str) -> Result<(), BusError> {
    if name.is_empty() {
        return Err(BusError::invalid_name(name, "name is empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(BusError::invalid_name(
            name,
            format!("name is longer than {MAX_NAME_LEN} bytes"),
        ));
    }
    if name.starts_with(':') {
        return Err(BusError::invalid_name(
            name,
            "unique names are assigned by the bus",
        ));
    }

    let mut elements = 0;
    for element in name.split('.') {
        elements += 1;
        let Some(first) = element.chars().next() else {
            return Err(BusError::invalid_name(name, "empty element"));
        };
        if first.is_ascii_digit() {
            return Err(BusError::invalid_name(
                name,
                format!("element {element:?} starts with a digit"),
            ));
        }
        if let Some(bad) = element
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
        {
            return Err(BusError::invalid_name(
                name,
                format!("invalid character {bad:?}"),
            ));
        }
    }

    if elements < 2 {
        return Err(BusError::invalid_name(
            name,
            "name must contain at least two elements",
        ));
    }
    Ok(())
}

/// Whether a registry entry is owned or still waiting in the daemon's queue
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NameStatus {
    /// This connection is the primary owner
    Owner,
    /// Queued behind another owner
    Queued,
}

/// A name recorded for this connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameEntry {
    /// The well-known name
    pub name: String,
    /// Unique name of the owning transport
    pub owner: String,
    /// Logical acquisition order within this registry
    pub sequence: u64,
    /// Wall-clock time of acquisition (or queueing)
    pub acquired_at: DateTime<Utc>,
    /// Owned or queued
    pub status: NameStatus,
}

/// Names held by one connection
#[derive(Debug)]
pub struct NameRegistry {
    owner: String,
    entries: HashMap<String, NameEntry>,
    next_sequence: u64,
}

impl NameRegistry {
    /// Create an empty registry for the transport with unique name `owner`
    #[must_use]
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            entries: HashMap::new(),
            next_sequence: 1,
        }
    }

    /// Record that this connection owns `name`
    ///
    /// Promotes a queued entry, leaves an owned one untouched.
    pub fn record_owner(&mut self, name: &str) -> &NameEntry {
        self.record(name, NameStatus::Owner)
    }

    /// Record that this connection waits in the queue for `name`
    pub fn record_queued(&mut self, name: &str) -> &NameEntry {
        self.record(name, NameStatus::Queued)
    }

    fn record(&mut self, name: &str, status: NameStatus) -> &NameEntry {
        let sequence = &mut self.next_sequence;
        let owner = &self.owner;
        let entry = self.entries.entry(name.to_string()).or_insert_with(|| {
            let entry = NameEntry {
                name: name.to_string(),
                owner: owner.clone(),
                sequence: *sequence,
                acquired_at: Utc::now(),
                status,
            };
            *sequence += 1;
            entry
        });

        if entry.status == NameStatus::Queued && status == NameStatus::Owner {
            entry.status = NameStatus::Owner;
            entry.sequence = *sequence;
            entry.acquired_at = Utc::now();
            *sequence += 1;
        }
        entry
    }

    /// Remove `name`, returning its entry if it was recorded
    pub fn forget(&mut self, name: &str) -> Option<NameEntry> {
        self.entries.remove(name)
    }

    /// Drop every entry, returning them in acquisition order
    ///
    /// Used when the transport closes: names do not outlive the handle.
    pub fn clear(&mut self) -> Vec<NameEntry> {
        let entries = self.entries();
        self.entries.clear();
        entries
    }

    /// Look up an entry
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&NameEntry> {
        self.entries.get(name)
    }

    /// Whether this connection is the primary owner of `name`
    #[must_use]
    pub fn is_owner(&self, name: &str) -> bool {
        self.get(name)
            .is_some_and(|entry| entry.status == NameStatus::Owner)
    }

    /// Whether `name` is recorded at all (owned or queued)
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// All entries in acquisition order
    #[must_use]
    pub fn entries(&self) -> Vec<NameEntry> {
        let mut entries: Vec<NameEntry> = self.entries.values().cloned().collect();
        entries.sort_by_key(|entry| entry.sequence);
        entries
    }

    /// Owned names in acquisition order
    #[must_use]
    pub fn owned_names(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.status == NameStatus::Owner)
            .map(|entry| entry.name)
            .collect()
    }

    /// Number of recorded entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
