//! Registry of game servers known to the master
//!
//! Maps a server's identity, the (address, port) the transport observed it
//! registering from, to a TTL-governed entry holding its description, optional
//! addressing hints, and a bounded queue of NAT punch candidates waiting to be
//! drained by that server.
//!
//! Every operation takes the caller's `now` so the registry itself never reads
//! the clock; the dispatch loop captures one timestamp per iteration and unit
//! tests supply synthetic ones.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::wire::{Endpoint, ServerListing};

// ============================================================================
// Constants
// ============================================================================

/// How long a registered server stays listed without a refresh
pub const ENTRY_TTL: Duration = Duration::from_secs(60);

/// How long a NAT punch candidate waits to be drained by its target
pub const NAT_CANDIDATE_TTL: Duration = Duration::from_secs(50);

/// Most live NAT candidates one server accumulates; further distinct
/// candidates are dropped silently
pub const NAT_CANDIDATE_CAP: usize = 10;

// ============================================================================
// Entry types
// ============================================================================

/// One endpoint waiting for a hole punch toward a server: the public
/// (address, port) the master observed, plus whatever local endpoint the
/// candidate reported about itself (zero when it reported none).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NatCandidate {
    pub public: Endpoint,
    pub local: Endpoint,
}

/// The master's record of one registered game server
#[derive(Debug)]
pub struct ServerEntry {
    /// Kept consistent with the registry key on every refresh
    pub endpoint: Endpoint,
    pub description: String,
    /// Addressing hints a server may supply so a matched client can pick
    /// which of its addresses to dial first
    pub local_hint: Option<Endpoint>,
    pub public_hint: Option<Endpoint>,
    pub needs_nat: bool,
    valid_until: Instant,
    /// One-way "already reported expired" flag; cleared only by a refresh
    deleted: bool,
    nat_candidates: HashMap<NatCandidate, Instant>,
}

impl ServerEntry {
    fn new(endpoint: Endpoint, now: Instant) -> Self {
        ServerEntry {
            endpoint,
            description: String::new(),
            local_hint: None,
            public_hint: None,
            needs_nat: false,
            valid_until: now + ENTRY_TTL,
            deleted: false,
            nat_candidates: HashMap::new(),
        }
    }

    fn register_nat_candidate(&mut self, candidate: NatCandidate, now: Instant) -> bool {
        let expiry = now + NAT_CANDIDATE_TTL;
        if let Some(slot) = self.nat_candidates.get_mut(&candidate) {
            // a repeat of a known candidate renews it even at the cap
            *slot = expiry;
            return true;
        }
        let live = self.nat_candidates.values().filter(|e| **e >= now).count();
        if live >= NAT_CANDIDATE_CAP {
            return false;
        }
        self.nat_candidates.insert(candidate, expiry);
        true
    }
}

// ============================================================================
// Registry
// ============================================================================

/// All registered servers, keyed by identity
pub struct Registry {
    entries: HashMap<Endpoint, ServerEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, identity: Endpoint) -> bool {
        self.entries.contains_key(&identity)
    }

    /// Create or revive the entry for `identity` and give it a fresh lifetime.
    pub fn refresh_or_insert(&mut self, identity: Endpoint, now: Instant) {
        let entry = self
            .entries
            .entry(identity)
            .or_insert_with(|| ServerEntry::new(identity, now));
        entry.valid_until = now + ENTRY_TTL;
        entry.deleted = false;
        entry.endpoint = identity;
    }

    /// Overwrite the description, creating the entry with a fresh lifetime
    /// when absent. Last value wins.
    pub fn update_description(&mut self, identity: Endpoint, description: &str, now: Instant) {
        let entry = self
            .entries
            .entry(identity)
            .or_insert_with(|| ServerEntry::new(identity, now));
        entry.description = description.to_string();
    }

    /// As [`Registry::update_description`], also recording the server's
    /// addressing hints.
    #[allow(clippy::too_many_arguments)]
    pub fn update_full(
        &mut self,
        identity: Endpoint,
        description: &str,
        local_hint: Endpoint,
        public_hint: Endpoint,
        needs_nat: bool,
        now: Instant,
    ) {
        let entry = self
            .entries
            .entry(identity)
            .or_insert_with(|| ServerEntry::new(identity, now));
        entry.description = description.to_string();
        entry.local_hint = Some(local_hint);
        entry.public_hint = Some(public_hint);
        entry.needs_nat = needs_nat;
    }

    /// Queue a NAT punch candidate for `identity`. Returns whether the
    /// candidate was stored (or renewed). An unknown identity is a silent
    /// no-op, so the requester learns nothing about which servers exist, and
    /// a server already holding [`NAT_CANDIDATE_CAP`] live candidates drops
    /// the insertion.
    pub fn register_nat_candidate(
        &mut self,
        identity: Endpoint,
        candidate: NatCandidate,
        now: Instant,
    ) -> bool {
        match self.entries.get_mut(&identity) {
            Some(entry) => entry.register_nat_candidate(candidate, now),
            None => false,
        }
    }

    /// Hand over every queued candidate for `identity` exactly once,
    /// leaving its queue empty.
    pub fn drain_nat_candidates(&mut self, identity: Endpoint) -> Vec<NatCandidate> {
        match self.entries.get_mut(&identity) {
            Some(entry) => entry.nat_candidates.drain().map(|(c, _)| c).collect(),
            None => Vec::new(),
        }
    }

    /// Drop expired NAT candidates, then delete entries whose lifetime has
    /// passed. Deletion here reclaims memory outright; the listing tombstone
    /// is a separate, report-once concept.
    pub fn reap(&mut self, now: Instant) {
        self.entries.retain(|_, entry| {
            entry.nat_candidates.retain(|_, expiry| *expiry >= now);
            entry.valid_until >= now
        });
    }

    /// Every entry that is alive and not yet reported expired. An entry seen
    /// expired here gets its tombstone set and is omitted, so each server's
    /// disappearance is reported, by omission, exactly once. Iteration order
    /// is unspecified.
    pub fn list_active(&mut self, now: Instant) -> Vec<ServerListing> {
        let mut active = Vec::new();
        for entry in self.entries.values_mut() {
            if entry.deleted {
                continue;
            }
            if entry.valid_until < now {
                entry.deleted = true;
                continue;
            }
            active.push(ServerListing {
                endpoint: entry.endpoint,
                description: entry.description.clone(),
            });
        }
        active
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
