//! The keychain orchestrator.
//!
//! `Keychain` owns the store, the binding registry, the signing-key selection and
//! the decrypt cache, and is the only thing that talks to a [`Backend`]. Reloads
//! build a fresh store off to the side and swap it in, so readers only ever see a
//! complete keychain.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::backend::{
    Backend, BackendKind, DecryptOutput, DecryptRequest, EncryptRequest, KeyListing,
    SignatureCheck,
};
use crate::bindings::{BindingRegistry, KeyBinding, validate_bindings};
use crate::cache::DecryptCache;
use crate::colons::parse_colon_listing;
use crate::config::{ConfigStore, KeychainOptions, PluginConfig};
use crate::error::{ChatPgpError, Result};
use crate::model::{KeyId, KeyInfo, KeySummary, UserId};
use crate::store::KeychainStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    Empty,
    Loading,
    Ready,
}

/// Outcome of [`Keychain::decrypt`]. Failures are reported in `error`, never raised.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DecryptResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "keyIDs", skip_serializing_if = "Vec::is_empty")]
    pub key_ids: Vec<KeyId>,
    pub signatures: Vec<SignatureCheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Marks a reload in progress. Dropping it without [`LoadingPhase::finish`]
/// (a cancelled reload) puts the previous phase back.
struct LoadingPhase<'a> {
    phase: &'a parking_lot::Mutex<LoadPhase>,
    previous: LoadPhase,
    finished: bool,
}

impl<'a> LoadingPhase<'a> {
    fn enter(phase: &'a parking_lot::Mutex<LoadPhase>) -> Self {
        let previous = std::mem::replace(&mut *phase.lock(), LoadPhase::Loading);
        Self {
            phase,
            previous,
            finished: false,
        }
    }

    fn finish(mut self) {
        *self.phase.lock() = LoadPhase::Ready;
        self.finished = true;
    }
}

impl Drop for LoadingPhase<'_> {
    fn drop(&mut self) {
        if !self.finished {
            *self.phase.lock() = self.previous;
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Source {
    Public,
    Secret,
}

impl Source {
    fn label(self) -> &'static str {
        match self {
            Source::Public => "public",
            Source::Secret => "secret",
        }
    }
}

#[derive(Debug)]
struct KeychainState {
    store: KeychainStore,
    bindings: BindingRegistry,
    /// Primary ID of the private key used for signing.
    signing_key: Option<KeyId>,
}

impl KeychainState {
    fn empty() -> Self {
        Self {
            store: KeychainStore::new(),
            bindings: BindingRegistry::default(),
            signing_key: None,
        }
    }
}

pub struct Keychain {
    backend: Arc<dyn Backend>,
    config: Arc<dyn ConfigStore>,
    options: KeychainOptions,
    state: RwLock<KeychainState>,
    phase: parking_lot::Mutex<LoadPhase>,
    /// Held by reloads and config writes so they never interleave.
    writer: Mutex<()>,
    cache: DecryptCache<DecryptOutput, ChatPgpError>,
}

impl Keychain {
    pub fn new(
        backend: Arc<dyn Backend>,
        config: Arc<dyn ConfigStore>,
        options: KeychainOptions,
    ) -> Self {
        let cache = DecryptCache::new(options.cache_capacity);
        Self {
            backend,
            config,
            options,
            state: RwLock::new(KeychainState::empty()),
            phase: parking_lot::Mutex::new(LoadPhase::Empty),
            writer: Mutex::new(()),
            cache,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn phase(&self) -> LoadPhase {
        *self.phase.lock()
    }

    async fn call<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = self.options.backend_timeout;
        tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| ChatPgpError::Timeout(limit))?
    }

    async fn list(&self, source: Source) -> Vec<KeyInfo> {
        let listing = match source {
            Source::Public => self.call(self.backend.list_public_keys()).await,
            Source::Secret => self.call(self.backend.list_secret_keys()).await,
        };
        let keys = match listing {
            Ok(KeyListing::Colons(text)) => parse_colon_listing(&text),
            Ok(KeyListing::Keys(keys)) => Ok(keys),
            Err(err) => Err(err),
        };
        match keys {
            Ok(keys) => {
                debug!(source = source.label(), count = keys.len(), "listed keys");
                keys
            }
            Err(err) => {
                warn!(source = source.label(), backend = self.backend.name(), %err, "key listing failed");
                Vec::new()
            }
        }
    }

    /// Rebuilds the keychain from the backend.
    ///
    /// Backend failures leave the corresponding part of the keychain empty. An
    /// unreadable configuration is treated as the default one for this load and is
    /// left on disk untouched.
    pub async fn load_keychain(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        let (mut config, config_readable) = match self.config.load() {
            Ok(config) => (config, true),
            Err(err) => {
                warn!(%err, "config unreadable, loading keys without bindings or signing key");
                (PluginConfig::default(), false)
            }
        };

        let loading = LoadingPhase::enter(&self.phase);
        let previous = loading.previous;

        let mut store = KeychainStore::new();
        let public = self.list(Source::Public).await;
        store.extend(public);
        let secret = self.list(Source::Secret).await;
        store.extend(secret);

        let (bindings, _) = BindingRegistry::reconcile(&config.key_binding, &store);
        let signing_key = config
            .sign_key_id
            .as_ref()
            .and_then(|id| store.private_key(id))
            .map(|key| key.key_id().clone());

        if config_readable
            && signing_key.is_none()
            && let Some(stale) = config.sign_key_id.take()
        {
            info!(key_id = %stale, "configured signing key is gone, clearing it");
            if let Err(err) = self.config.save(&config) {
                warn!(%err, "failed to persist cleared signing key");
            }
        }

        let mut state = self.state.write().await;
        info!(
            keys = store.len(),
            previous = ?previous,
            backend = self.backend.name(),
            "keychain loaded"
        );
        *state = KeychainState {
            store,
            bindings,
            signing_key,
        };
        loading.finish();
        Ok(())
    }

    /// Every indexed key, sorted by primary key ID.
    pub async fn get_keychain(&self) -> Vec<KeyInfo> {
        self.state.read().await.store.keys()
    }

    /// User IDs of the key owning `key_id`, private keys first.
    pub async fn get_user_ids(&self, key_id: &KeyId) -> Option<Vec<UserId>> {
        let state = self.state.read().await;
        state.store.any_key(key_id).map(|key| key.user_ids.clone())
    }

    pub async fn get_config(&self) -> Result<PluginConfig> {
        self.config.load()
    }

    /// Selects the signing key. An ID that is not a known private key clears the
    /// selection, and the persisted value follows either way.
    pub async fn set_signing_key(&self, key_id: &KeyId) -> Result<Option<KeySummary>> {
        let _writer = self.writer.lock().await;
        let mut config = self.config.load()?;
        let mut state = self.state.write().await;

        let resolved = state.store.private_key(key_id).map(KeyInfo::summary);
        match &resolved {
            Some(summary) => {
                state.signing_key = Some(summary.key_id.clone());
                config.sign_key_id = Some(key_id.clone());
            }
            None => {
                debug!(key_id = %key_id, "signing key is not a private key, clearing selection");
                state.signing_key = None;
                config.sign_key_id = None;
            }
        }
        self.config.save(&config)?;
        Ok(resolved)
    }

    pub async fn get_signing_key(&self) -> Option<KeySummary> {
        let state = self.state.read().await;
        let id = state.signing_key.as_ref()?;
        state.store.private_key(id).map(KeyInfo::summary)
    }

    /// Replaces every binding. Lists containing a non-positive identity are
    /// rejected whole; entries naming unknown keys are dropped.
    pub async fn set_bindings(&self, entries: &[KeyBinding]) -> Result<Vec<KeyBinding>> {
        validate_bindings(entries)?;

        let _writer = self.writer.lock().await;
        let mut config = self.config.load()?;
        let mut state = self.state.write().await;

        let (registry, persisted) = BindingRegistry::reconcile(entries, &state.store);
        config.key_binding = persisted.clone();
        self.config.save(&config)?;
        state.bindings = registry;
        Ok(persisted)
    }

    /// Keys bound to `identity`, or `None` when it has no bindings.
    pub async fn get_bindings(&self, identity: i64) -> Option<Vec<KeySummary>> {
        let state = self.state.read().await;
        let ids = state.bindings.get(identity)?;
        let keys: Vec<KeySummary> = ids
            .iter()
            .filter_map(|id| state.store.public_key(id))
            .map(KeyInfo::summary)
            .collect();
        (!keys.is_empty()).then_some(keys)
    }

    /// Persists the backend choice. It applies the next time a keychain is built.
    pub async fn set_use_system_gpg(&self, enabled: bool) -> Result<()> {
        let _writer = self.writer.lock().await;
        let mut config = self.config.load()?;
        config.use_system_gpg = enabled;
        self.config.save(&config)
    }

    pub fn clear_decrypt_cache(&self) {
        self.cache.clear();
    }

    pub async fn decrypt(&self, armored: &str) -> DecryptResult {
        let mut result = DecryptResult::default();
        let outcome = match self.backend.kind() {
            BackendKind::ExternalProcess => self.decrypt_external(armored).await,
            BackendKind::Embedded => self.decrypt_embedded(armored, &mut result.key_ids).await,
        };
        match outcome {
            Ok(output) => {
                result.data = Some(output.plaintext);
                result.output = output.diagnostics;
                result.signatures = output.signatures;
            }
            Err(err) => {
                debug!(%err, "decrypt failed");
                result.error = Some(err.to_string());
            }
        }
        result
    }

    async fn decrypt_external(&self, armored: &str) -> Result<DecryptOutput> {
        self.cache
            .get_or_fetch(armored, || {
                self.call(self.backend.decrypt(DecryptRequest {
                    ciphertext: armored.to_string(),
                    decryption_key: None,
                }))
            })
            .await
    }

    async fn decrypt_embedded(
        &self,
        armored: &str,
        key_ids: &mut Vec<KeyId>,
    ) -> Result<DecryptOutput> {
        *key_ids = self.call(self.backend.message_recipients(armored)).await?;

        let key = {
            let state = self.state.read().await;
            key_ids
                .iter()
                .find_map(|id| state.store.private_key(id))
                .map(|key| key.key_id().clone())
        };
        let Some(key) = key else {
            return Err(ChatPgpError::Decryption(
                "no private key for any recipient of the message".into(),
            ));
        };

        self.call(self.backend.decrypt(DecryptRequest {
            ciphertext: armored.to_string(),
            decryption_key: Some(key),
        }))
        .await
    }

    /// Encrypts to `targets` plus the signing key, and signs when one is selected.
    pub async fn encrypt(&self, targets: &[KeyId], plaintext: &str) -> Result<String> {
        let (recipients, signer) = {
            let state = self.state.read().await;
            let mut recipients: Vec<KeyId> = Vec::with_capacity(targets.len() + 1);
            for target in targets {
                let key = state
                    .store
                    .public_key(target)
                    .ok_or_else(|| ChatPgpError::Resolution(target.to_string()))?;
                if !recipients.contains(key.key_id()) {
                    recipients.push(key.key_id().clone());
                }
            }
            let signer = state.signing_key.clone();
            if let Some(signer) = &signer
                && !recipients.contains(signer)
            {
                recipients.push(signer.clone());
            }
            (recipients, signer)
        };

        if recipients.is_empty() {
            return Err(ChatPgpError::InvalidInput("no recipients".into()));
        }

        let armored = self
            .call(self.backend.encrypt(EncryptRequest {
                recipients,
                signer,
                plaintext: plaintext.to_string(),
            }))
            .await?;

        Ok(match self.backend.kind() {
            BackendKind::ExternalProcess => trim_line_ends(&armored),
            BackendKind::Embedded => armored,
        })
    }

    /// Encrypts to every key bound to `identity`.
    pub async fn encrypt_for(&self, identity: i64, plaintext: &str) -> Result<String> {
        let targets: Vec<KeyId> = {
            let state = self.state.read().await;
            state
                .bindings
                .get(identity)
                .map(<[KeyId]>::to_vec)
                .ok_or_else(|| ChatPgpError::Resolution(format!("no keys bound to {identity}")))?
        };
        self.encrypt(&targets, plaintext).await
    }
}

fn trim_line_ends(text: &str) -> String {
    let mut out = text.lines().map(str::trim_end).collect::<Vec<_>>().join("\n");
    if text.ends_with('\n') {
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_trailing_whitespace_per_line() {
        let armored = "-----BEGIN PGP MESSAGE-----  \r\n\r\nabc \t\n-----END PGP MESSAGE-----\n";
        assert_eq!(
            trim_line_ends(armored),
            "-----BEGIN PGP MESSAGE-----\n\nabc\n-----END PGP MESSAGE-----\n"
        );
        assert_eq!(trim_line_ends("x  "), "x");
    }

    #[test]
    fn decrypt_result_serializes_like_the_plugin() {
        let result = DecryptResult {
            error: None,
            key_ids: vec![KeyId::new("AB")],
            signatures: vec![SignatureCheck {
                key_id: KeyId::new("cd"),
                verified: true,
            }],
            data: Some("hi".into()),
            output: None,
        };
        let json = serde_json::to_string(&result).expect("serialize");
        assert_eq!(
            json,
            r#"{"keyIDs":["ab"],"signatures":[{"keyID":"cd","verified":true}],"data":"hi"}"#
        );
    }
}
