//! A single routing table, encapsulating a channel/pattern → subscribers
//! map together with its inverse (subscriber → channels/patterns) index.
//!
//! The original source keeps four parallel maps (`pubsub_channel_`,
//! `client_channel_`, `pubsub_pattern_`, `client_pattern_`) and updates
//! them in separate, non-atomic steps — the exact "double indexing"
//! hazard spec.md's REDESIGN FLAGS calls out. `RoutingTable` is the fix:
//! every public method here re-establishes the bidirectional invariant
//! (every `(key, fd)` pair appears in both directions, or in neither)
//! before returning. The engine holds one instance for exact channels
//! and a second, separately-locked instance for patterns (`channel_mtx`
//! / `pattern_mtx` in spec.md's lock table).
//!
//! Connections themselves are never stored here — only their file
//! descriptors. Ownership of the `Connection` trait object lives
//! exclusively in `registry::ConnRegistry`; see spec.md §9's note on
//! raw non-owning handles.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

#[derive(Default)]
pub struct RoutingTable {
    forward: HashMap<Vec<u8>, Vec<RawFd>>,
    inverse: HashMap<RawFd, Vec<Vec<u8>>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `fd` to `key`, a no-op if already subscribed. Returns
    /// the connection's total subscription count within *this* table
    /// after the mutation.
    pub fn subscribe(&mut self, key: &[u8], fd: RawFd) -> usize {
        let subs = self.forward.entry(key.to_vec()).or_default();
        if !subs.contains(&fd) {
            subs.push(fd);
        }
        let keys = self.inverse.entry(fd).or_default();
        if !keys.iter().any(|k| k.as_slice() == key) {
            keys.push(key.to_vec());
        }
        keys.len()
    }

    /// Unsubscribes `fd` from `key`. Returns the connection's remaining
    /// subscription count within this table — unchanged if `fd` was not
    /// actually subscribed to `key`, per spec.md §4.4's receipt rule.
    pub fn unsubscribe(&mut self, key: &[u8], fd: RawFd) -> usize {
        if let Some(subs) = self.forward.get_mut(key) {
            subs.retain(|&s| s != fd);
            if subs.is_empty() {
                // Lazy cleanup is permitted (spec.md invariant 4); keep the
                // entry so a concurrent reader never needs to special-case it.
            }
        }
        match self.inverse.get_mut(&fd) {
            Some(keys) => {
                keys.retain(|k| k.as_slice() != key);
                let remaining = keys.len();
                if keys.is_empty() {
                    self.inverse.remove(&fd);
                }
                remaining
            }
            None => 0,
        }
    }

    /// Unsubscribes `fd` from everything it holds in this table,
    /// returning `(key, remaining)` receipts in original subscription
    /// order with `remaining` counting down to zero.
    pub fn unsubscribe_all(&mut self, fd: RawFd) -> Vec<(Vec<u8>, usize)> {
        let keys = match self.inverse.remove(&fd) {
            Some(keys) => keys,
            None => return Vec::new(),
        };
        let mut remaining = keys.len();
        let mut receipts = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(subs) = self.forward.get_mut(&key) {
                subs.retain(|&s| s != fd);
            }
            remaining -= 1;
            receipts.push((key, remaining));
        }
        receipts
    }

    /// Purges `fd` from every forward sequence and drops its inverse
    /// entry, without emitting receipts. Used by `remove_connection`
    /// when a write fails mid-fan-out or the connection errors out.
    pub fn remove_conn(&mut self, fd: RawFd) {
        self.inverse.remove(&fd);
        for subs in self.forward.values_mut() {
            subs.retain(|&s| s != fd);
        }
    }

    /// The connection's current subscription count within this table.
    pub fn subscriber_count(&self, fd: RawFd) -> usize {
        self.inverse.get(&fd).map_or(0, |k| k.len())
    }

    /// Subscribers of an exact key, insertion order, possibly empty.
    pub fn subscribers(&self, key: &[u8]) -> &[RawFd] {
        self.forward.get(key).map_or(&[], |v| v.as_slice())
    }

    /// Iterates every `(key, subscribers)` entry — used by the
    /// dispatcher to do the exact-match scan and the pattern-match scan
    /// described in spec.md §4.2.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[RawFd])> {
        self.forward.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// A point-in-time copy, for `PubSub::snapshot`.
    pub fn snapshot(&self) -> HashMap<Vec<u8>, Vec<RawFd>> {
        self.forward.clone()
    }

    /// Asserts the bidirectional invariant and the no-duplicates
    /// invariant from spec.md §3/§8. Intended for tests, not hot paths.
    #[cfg(test)]
    pub fn assert_consistent(&self) {
        for (key, subs) in &self.forward {
            let mut seen = std::collections::HashSet::new();
            for &fd in subs {
                assert!(seen.insert(fd), "duplicate subscriber {fd} under key {key:?}");
                let keys = self
                    .inverse
                    .get(&fd)
                    .unwrap_or_else(|| panic!("fd {fd} subscribed to {key:?} but absent from inverse index"));
                assert!(
                    keys.iter().any(|k| k.as_slice() == key.as_slice()),
                    "inverse index for fd {fd} missing key {key:?}"
                );
            }
        }
        for (&fd, keys) in &self.inverse {
            for key in keys {
                let subs = self
                    .forward
                    .get(key)
                    .unwrap_or_else(|| panic!("inverse index references missing key {key:?}"));
                assert!(subs.contains(&fd), "forward table for {key:?} missing fd {fd}");
            }
        }
    }
}
