//! Writer membership rules.
//!
//! The writer set only ever changes through linearized `add-writer` /
//! `remove-writer` ops. Both the view (authoritative fold state) and the
//! linearizer's merge simulation hold a `WriterSet` and mutate it through
//! the same two rule methods, so the two can never disagree about who is
//! admitted at a given position.

use std::collections::BTreeMap;

use pearsync_core::keys::PublicKey;

/// Current writer membership: key → view version at admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterSet {
    bootstrap: PublicKey,
    members: BTreeMap<PublicKey, u64>,
}

impl WriterSet {
    /// A fresh set: the bootstrap writer is a member from version 0.
    pub fn new(bootstrap: PublicKey) -> Self {
        let mut members = BTreeMap::new();
        members.insert(bootstrap, 0);
        Self { bootstrap, members }
    }

    pub fn bootstrap(&self) -> PublicKey {
        self.bootstrap
    }

    pub fn is_member(&self, key: &PublicKey) -> bool {
        self.members.contains_key(key)
    }

    /// Members in key order, with their admission version.
    pub fn members(&self) -> impl Iterator<Item = (&PublicKey, &u64)> {
        self.members.iter()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Apply `add-writer{writer}` authored by `author` at `version`.
    ///
    /// Valid iff the author is a current member and the subject is not
    /// already one (re-adds are no-ops). Returns whether the set changed.
    pub fn apply_add(&mut self, author: &PublicKey, writer: PublicKey, version: u64) -> bool {
        if !self.is_member(author) || self.is_member(&writer) {
            return false;
        }
        self.members.insert(writer, version);
        true
    }

    /// Apply `remove-writer{writer}` authored by `author`.
    ///
    /// Valid iff self-authored and the subject is a member. The bootstrap
    /// writer cannot remove itself: the workspace key must stay
    /// authoritative. Returns whether the set changed, paired with the
    /// removed admission version (needed to undo).
    pub fn apply_remove(&mut self, author: &PublicKey, writer: &PublicKey) -> Option<u64> {
        if author != writer || *writer == self.bootstrap {
            return None;
        }
        self.members.remove(writer)
    }

    /// Re-insert a member with a known admission version (undo path).
    pub fn restore(&mut self, writer: PublicKey, version: u64) {
        self.members.insert(writer, version);
    }

    /// Drop a member unconditionally (undo path).
    pub fn evict(&mut self, writer: &PublicKey) {
        self.members.remove(writer);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
