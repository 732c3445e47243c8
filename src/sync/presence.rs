//! Presence tracking for participants.
//!
//! Presence is a multiset of identities: each name carries the number of live
//! joined connections using it, so one connection leaving does not evict a
//! name another connection still holds.

use std::collections::BTreeMap;

use super::Identity;

/// Reference-counted set of active identities
#[derive(Debug, Default)]
pub struct PresenceTracker {
    /// Map of identity -> live joined connections under that name
    counts: BTreeMap<Identity, usize>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more connection under `identity`.
    /// Returns true if the name was not present before.
    pub fn add(&mut self, identity: &str) -> bool {
        let count = self.counts.entry(identity.to_string()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Drop one connection under `identity`.
    /// Returns true if the name is no longer present.
    pub fn remove(&mut self, identity: &str) -> bool {
        match self.counts.get_mut(identity) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.counts.remove(identity);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.counts.contains_key(identity)
    }

    /// Connections currently holding `identity`
    pub fn connections_for(&self, identity: &str) -> usize {
        self.counts.get(identity).copied().unwrap_or(0)
    }

    /// Number of distinct present identities
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Present identities in sorted order
    pub fn list(&self) -> Vec<Identity> {
        self.counts.keys().cloned().collect()
    }
}
