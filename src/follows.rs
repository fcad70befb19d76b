//! Follow graph: the set of public keys whose events we subscribe to.

use std::collections::BTreeSet;

use crate::error::{Error, Result};

/// Ordered set of followed public keys. Keys are validated and lowercased at
/// the boundary so everything downstream can assume 64 lowercase hex
/// characters.
#[derive(Debug, Default)]
pub struct FollowSet {
    keys: BTreeSet<String>,
}

/// True for a 64-character hex string, the x-only pubkey form. Either case
/// is accepted; [`normalize_pubkey`] folds to the lowercase wire form.
pub fn valid_pubkey(key: &str) -> bool {
    key.len() == 64 && key.chars().all(|c| c.is_ascii_hexdigit())
}

/// Lowercase a hex key. Events and filters carry the lowercase form, so any
/// user-supplied key is folded before it is compared, stored, or subscribed.
pub fn normalize_pubkey(key: &str) -> String {
    key.to_ascii_lowercase()
}

impl FollowSet {
    /// Empty set.
    pub fn new() -> FollowSet {
        FollowSet::default()
    }

    /// Rehydrate from persisted keys. Invalid entries are dropped rather
    /// than poisoning the whole set.
    pub fn from_keys(keys: Vec<String>) -> FollowSet {
        FollowSet {
            keys: keys
                .into_iter()
                .filter(|k| valid_pubkey(k))
                .map(|k| normalize_pubkey(&k))
                .collect(),
        }
    }

    /// Add a key, folding it to lowercase. Rejects malformed keys and
    /// duplicates.
    pub fn follow(&mut self, key: &str) -> Result<()> {
        if !valid_pubkey(key) {
            return Err(Error::InvalidKey);
        }
        let key = normalize_pubkey(key);
        if !self.keys.insert(key.clone()) {
            return Err(Error::AlreadyFollowing(key));
        }
        Ok(())
    }

    /// Remove a key, matching case-insensitively.
    pub fn unfollow(&mut self, key: &str) -> Result<()> {
        let key = normalize_pubkey(key);
        if !self.keys.remove(&key) {
            return Err(Error::NotFollowing(key));
        }
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(&normalize_pubkey(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }

    /// Keys as an owned list, for persistence and filter construction.
    pub fn to_vec(&self) -> Vec<String> {
        self.keys.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
