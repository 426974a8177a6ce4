//! Cache handles and the prefix they cover.

use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::context::ContextSnapshot;

/// Identity of a cached prefix: the pinned instruction plus a leading run of
/// snapshot items, fingerprinted item by item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixFingerprint {
    pub instruction: String,
    pub items: Vec<String>,
    /// SHA-256 over every fingerprint above, in order.
    pub combined: String,
    /// Canonical byte length of the covered content.
    pub bytes: usize,
}

impl PrefixFingerprint {
    /// Fingerprint the instruction and the first `covered_items` items.
    pub fn of(snapshot: &ContextSnapshot, covered_items: usize) -> Self {
        let covered = &snapshot.items[..covered_items.min(snapshot.items.len())];
        let instruction = snapshot.pinned_instruction.fingerprint.clone();
        let items: Vec<String> = covered.iter().map(|i| i.fingerprint.clone()).collect();

        let mut hasher = Sha256::new();
        hasher.update(instruction.as_bytes());
        for fp in &items {
            hasher.update(fp.as_bytes());
        }
        let bytes = snapshot.pinned_instruction.text.len()
            + covered
                .iter()
                .map(|i| i.content.canonical_bytes().len())
                .sum::<usize>();

        Self {
            instruction,
            items,
            combined: hex::encode(hasher.finalize()),
            bytes,
        }
    }

    /// Whether this prefix is still a byte-exact prefix of `snapshot`.
    pub fn is_prefix_of(&self, snapshot: &ContextSnapshot) -> bool {
        self.instruction == snapshot.pinned_instruction.fingerprint
            && self.items.len() <= snapshot.items.len()
            && self
                .items
                .iter()
                .zip(&snapshot.items)
                .all(|(fp, item)| *fp == item.fingerprint)
    }

    pub fn covered_items(&self) -> usize {
        self.items.len()
    }
}

/// A live reference to a remote precomputed prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHandle {
    pub id: String,
    pub covers: PrefixFingerprint,
    pub token_count: usize,
    pub expires_at: Instant,
    pub last_used: Instant,
}

impl CacheHandle {
    pub fn covered_items(&self) -> usize {
        self.covers.covered_items()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry (zero once expired).
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }

    /// Whether the handle may be attached to a request for `snapshot`.
    pub fn is_valid_for(&self, snapshot: &ContextSnapshot, now: Instant) -> bool {
        !self.is_expired(now) && self.covers.is_prefix_of(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextBudget, ContextWindowManager};
    use crate::history::{Role, Turn, TurnContent};

    fn snapshot(pinned: &str, texts: &[&str]) -> ContextSnapshot {
        let turns: Vec<Turn> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                Turn::new(i as u64, role, TurnContent::text(*t), t.len() / 4 + 1)
            })
            .collect();
        ContextWindowManager::new(ContextBudget::new(100_000))
            .compose(pinned, None, &turns)
            .unwrap()
    }

    #[test]
    fn prefix_survives_appended_turns() {
        let first = snapshot("sys", &["hello", "hi"]);
        let fp = PrefixFingerprint::of(&first, 2);
        let later = snapshot("sys", &["hello", "hi", "again"]);
        assert!(fp.is_prefix_of(&later));
        let item_bytes: usize = first
            .items
            .iter()
            .map(|i| i.content.canonical_bytes().len())
            .sum();
        assert_eq!(fp.bytes, "sys".len() + item_bytes);
    }

    #[test]
    fn changed_instruction_or_item_breaks_prefix() {
        let first = snapshot("sys", &["hello", "hi"]);
        let fp = PrefixFingerprint::of(&first, 1);
        assert!(!fp.is_prefix_of(&snapshot("sys v2", &["hello", "hi"])));
        assert!(!fp.is_prefix_of(&snapshot("sys", &["hellO", "hi"])));
        assert!(!fp.is_prefix_of(&snapshot("sys", &[])));
    }

    #[test]
    fn expired_handle_is_invalid() {
        let snap = snapshot("sys", &["hello"]);
        let now = Instant::now();
        let handle = CacheHandle {
            id: "c1".into(),
            covers: PrefixFingerprint::of(&snap, 0),
            token_count: 1,
            expires_at: now,
            last_used: now,
        };
        assert!(handle.is_expired(now));
        assert!(!handle.is_valid_for(&snap, now));
        assert_eq!(handle.remaining(now), Duration::ZERO);
    }
}
