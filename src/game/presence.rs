//! Online presence directory
//!
//! One entry per account that is in game anywhere in the cluster, recording
//! where it currently lives. A forced disconnect of an account sitting on a
//! map server arms a deadline; the entry is cleared either when the map
//! server confirms the character went offline or when the deadline passes.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, trace};

use crate::net::session::ConnId;

/// Where an online account currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// On this char server, behind the given connection
    Here(ConnId),
    /// On the map server occupying this slot
    MapServer(usize),
    /// Its map server went away; the account may still be in game
    Unknown,
}

/// An online account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub account_id: u32,
    /// Character in use, once a map server reported one
    pub char_id: Option<u32>,
    pub location: Location,
    disconnect_deadline: Option<Instant>,
}

impl PresenceEntry {
    fn new(account_id: u32, char_id: Option<u32>, location: Location) -> Self {
        Self {
            account_id,
            char_id,
            location,
            disconnect_deadline: None,
        }
    }

    /// Deadline of a pending forced disconnect
    pub fn disconnect_deadline(&self) -> Option<Instant> {
        self.disconnect_deadline
    }
}

/// Account id to presence entry
#[derive(Debug, Default)]
pub struct PresenceDirectory {
    entries: HashMap<u32, PresenceEntry>,
}

impl PresenceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, account_id: u32) -> Option<&PresenceEntry> {
        self.entries.get(&account_id)
    }

    pub fn location(&self, account_id: u32) -> Option<Location> {
        self.entries.get(&account_id).map(|e| e.location)
    }

    pub fn is_online(&self, account_id: u32) -> bool {
        self.entries.contains_key(&account_id)
    }

    /// Create or move an entry; any pending forced disconnect is cancelled.
    /// Returns true when the account was not present before.
    pub fn set_online(&mut self, account_id: u32, char_id: Option<u32>, location: Location) -> bool {
        match self.entries.get_mut(&account_id) {
            Some(entry) => {
                if char_id.is_some() {
                    entry.char_id = char_id;
                }
                entry.location = location;
                entry.disconnect_deadline = None;
                trace!(account_id, ?location, "Presence updated");
                false
            }
            None => {
                self.entries
                    .insert(account_id, PresenceEntry::new(account_id, char_id, location));
                debug!(account_id, ?char_id, ?location, "Account online");
                true
            }
        }
    }

    /// Remove the entry, cancelling any pending forced disconnect
    pub fn set_offline(&mut self, account_id: u32) -> Option<PresenceEntry> {
        let entry = self.entries.remove(&account_id)?;
        debug!(account_id, char_id = ?entry.char_id, "Account offline");
        Some(entry)
    }

    /// Arm the forced-disconnect deadline of an entry.
    /// Returns false when the account is absent or a deadline is already armed.
    pub fn arm_disconnect(&mut self, account_id: u32, deadline: Instant) -> bool {
        match self.entries.get_mut(&account_id) {
            Some(entry) if entry.disconnect_deadline.is_none() => {
                entry.disconnect_deadline = Some(deadline);
                debug!(account_id, "Forced disconnect armed");
                true
            }
            _ => false,
        }
    }

    pub fn is_disconnect_armed(&self, account_id: u32) -> bool {
        self.entries
            .get(&account_id)
            .is_some_and(|e| e.disconnect_deadline.is_some())
    }

    /// Accounts whose forced-disconnect deadline has passed
    pub fn expired(&self, now: Instant) -> Vec<u32> {
        let mut accounts: Vec<u32> = self
            .entries
            .values()
            .filter(|e| e.disconnect_deadline.is_some_and(|d| d <= now))
            .map(|e| e.account_id)
            .collect();
        accounts.sort_unstable();
        accounts
    }

    /// Accounts located on a map server slot
    pub fn accounts_on_server(&self, index: usize) -> Vec<u32> {
        let mut accounts: Vec<u32> = self
            .entries
            .values()
            .filter(|e| e.location == Location::MapServer(index))
            .map(|e| e.account_id)
            .collect();
        accounts.sort_unstable();
        accounts
    }

    /// A map server slot went away; its accounts move to `Unknown`
    pub fn mark_server_lost(&mut self, index: usize) -> usize {
        let mut count = 0;
        for entry in self.entries.values_mut() {
            if entry.location == Location::MapServer(index) {
                entry.location = Location::Unknown;
                count += 1;
            }
        }
        count
    }

    /// All online account ids, ascending
    pub fn online_accounts(&self) -> Vec<u32> {
        let mut accounts: Vec<u32> = self.entries.keys().copied().collect();
        accounts.sort_unstable();
        accounts
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
