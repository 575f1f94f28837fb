//! In-memory keychain indices.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::model::{KeyId, KeyInfo};

/// Keys indexed by primary ID and by every primary-or-subkey ID.
///
/// A private record is reachable from both the private and the public index, so
/// the owner's own keys can be used as encryption recipients and binding targets.
/// A public record never displaces an ID already held by a private record.
#[derive(Debug, Default, Clone)]
pub struct KeychainStore {
    keys_by_id: HashMap<KeyId, Arc<KeyInfo>>,
    private_by_any_id: HashMap<KeyId, Arc<KeyInfo>>,
    public_by_any_id: HashMap<KeyId, Arc<KeyInfo>>,
}

impl KeychainStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.keys_by_id.clear();
        self.private_by_any_id.clear();
        self.public_by_any_id.clear();
    }

    /// Indexes one record, replacing any earlier record with the same primary ID.
    ///
    /// Returns `false` when a public record is skipped because a private copy is known.
    pub fn insert(&mut self, key: KeyInfo) -> bool {
        let primary = key.key_id().clone();

        if !key.private && self.private_by_any_id.contains_key(&primary) {
            debug!(key_id = %primary, "skipping public copy of a private key");
            return false;
        }

        if let Some(previous) = self.keys_by_id.remove(&primary) {
            self.unindex(&previous);
        }

        let key = Arc::new(key);
        for id in key.all_key_ids() {
            if key.private {
                self.private_by_any_id.insert(id.clone(), Arc::clone(&key));
                self.public_by_any_id.insert(id.clone(), Arc::clone(&key));
            } else if !self.private_by_any_id.contains_key(id) {
                self.public_by_any_id.insert(id.clone(), Arc::clone(&key));
            }
        }
        self.keys_by_id.insert(primary, key);
        true
    }

    /// Indexes a source in order. Later records win over earlier ones.
    pub fn extend(&mut self, keys: impl IntoIterator<Item = KeyInfo>) -> usize {
        keys.into_iter()
            .map(|key| self.insert(key))
            .filter(|added| *added)
            .count()
    }

    fn unindex(&mut self, previous: &Arc<KeyInfo>) {
        for id in previous.all_key_ids() {
            for index in [&mut self.private_by_any_id, &mut self.public_by_any_id] {
                if index.get(id).is_some_and(|held| Arc::ptr_eq(held, previous)) {
                    index.remove(id);
                }
            }
        }
    }

    pub fn get(&self, primary_id: &KeyId) -> Option<&KeyInfo> {
        self.keys_by_id.get(primary_id).map(Arc::as_ref)
    }

    pub fn private_key(&self, any_id: &KeyId) -> Option<&KeyInfo> {
        self.private_by_any_id.get(any_id).map(Arc::as_ref)
    }

    pub fn public_key(&self, any_id: &KeyId) -> Option<&KeyInfo> {
        self.public_by_any_id.get(any_id).map(Arc::as_ref)
    }

    /// Looks in the private index first, then the public one.
    pub fn any_key(&self, any_id: &KeyId) -> Option<&KeyInfo> {
        self.private_key(any_id).or_else(|| self.public_key(any_id))
    }

    pub fn len(&self) -> usize {
        self.keys_by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys_by_id.is_empty()
    }

    /// All primary records, sorted by primary key ID.
    pub fn keys(&self) -> Vec<KeyInfo> {
        let mut keys: Vec<KeyInfo> = self.keys_by_id.values().map(|key| (**key).clone()).collect();
        keys.sort_by(|a, b| a.key_id().cmp(b.key_id()));
        keys
    }
}
