//! Conversation identity to public key bindings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ChatPgpError, Result};
use crate::model::KeyId;
use crate::store::KeychainStore;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyBinding {
    #[serde(alias = "uin")]
    pub identity: i64,
    #[serde(rename = "keyID")]
    pub key_id: KeyId,
}

impl KeyBinding {
    pub fn new(identity: i64, key_id: impl Into<KeyId>) -> Self {
        Self {
            identity,
            key_id: key_id.into(),
        }
    }
}

/// Rejects lists containing a non-positive identity.
pub fn validate_bindings(bindings: &[KeyBinding]) -> Result<()> {
    match bindings.iter().find(|binding| binding.identity <= 0) {
        Some(bad) => Err(ChatPgpError::InvalidInput(format!(
            "binding identity must be positive, got {}",
            bad.identity
        ))),
        None => Ok(()),
    }
}

/// Resolved bindings: each identity maps to the primary IDs of its bound keys.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BindingRegistry {
    bound: BTreeMap<i64, Vec<KeyId>>,
}

impl BindingRegistry {
    /// Resolves `entries` against the public index.
    ///
    /// Entries with a non-positive identity or an unknown key are dropped. The
    /// surviving entries are returned sorted by `(identity, key_id)` and deduplicated,
    /// ready to be persisted.
    pub fn reconcile(entries: &[KeyBinding], store: &KeychainStore) -> (Self, Vec<KeyBinding>) {
        let mut valid: Vec<KeyBinding> = entries
            .iter()
            .filter(|binding| {
                let known = store.public_key(&binding.key_id).is_some();
                if binding.identity <= 0 || !known {
                    debug!(identity = binding.identity, key_id = %binding.key_id, "dropping binding");
                    return false;
                }
                true
            })
            .cloned()
            .collect();
        valid.sort();
        valid.dedup();

        let mut bound: BTreeMap<i64, Vec<KeyId>> = BTreeMap::new();
        for binding in &valid {
            let Some(key) = store.public_key(&binding.key_id) else {
                continue;
            };
            let keys = bound.entry(binding.identity).or_default();
            if !keys.contains(key.key_id()) {
                keys.push(key.key_id().clone());
            }
        }

        (Self { bound }, valid)
    }

    /// Primary IDs bound to `identity`, or `None` when it has no bindings.
    pub fn get(&self, identity: i64) -> Option<&[KeyId]> {
        self.bound.get(&identity).map(Vec::as_slice)
    }

    pub fn clear(&mut self) {
        self.bound.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.bound.is_empty()
    }
}
