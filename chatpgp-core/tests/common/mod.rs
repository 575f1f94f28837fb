#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chatpgp_core::{
    Backend, BackendKind, ChatPgpError, DecryptOutput, DecryptRequest, EncryptRequest, KeyId,
    KeyListing, Keychain, KeychainOptions, MemoryConfigStore, PluginConfig, Result,
    SignatureCheck,
};
use parking_lot::Mutex;

pub const K1: &str = "aaaa000000000001";
pub const K1_SUB: &str = "aaaa0000000000e1";
pub const K2: &str = "bbbb000000000002";
pub const K2_SUB: &str = "bbbb0000000000e2";

/// `gpg --list-keys` style output: the owner's key K1 and a contact's key K2.
pub fn public_listing() -> String {
    let (k1, k1s, k2, k2s) = (
        K1.to_uppercase(),
        K1_SUB.to_uppercase(),
        K2.to_uppercase(),
        K2_SUB.to_uppercase(),
    );
    format!(
        "tru::1:1700000000:0:3:1:5\n\
         pub:u:255:22:{k1}:1700000000:::u:::scESC:::::ed25519:::0:\n\
         uid:u::::1700000000::HASH1::Alice (me) <alice@example.com>::::::::::0:\n\
         sub:u:255:18:{k1s}:1700000000::::::e:::::cv25519::\n\
         pub:f:255:22:{k2}:1700000100:1900000000::-:::scESC:::::ed25519:::0:\n\
         uid:f::::1700000100::HASH2::Bob <bob@example.org>::::::::::0:\n\
         sub:f:255:18:{k2s}:1700000100::::::e:::::cv25519::\n"
    )
}

/// `gpg --list-secret-keys` style output holding only K1.
pub fn secret_listing() -> String {
    let (k1, k1s) = (K1.to_uppercase(), K1_SUB.to_uppercase());
    format!(
        "sec:u:255:22:{k1}:1700000000:::u:::scESC:::+:::ed25519:::0:\n\
         uid:u::::1700000000::HASH1::Alice (me) <alice@example.com>::::::::::0:\n\
         ssb:u:255:18:{k1s}:1700000000::::::e:::+::cv25519::\n"
    )
}

pub enum Listing {
    Text(String),
    Fail,
    Hang,
}

/// Scripted backend that records every call it receives.
pub struct FakeBackend {
    pub kind: BackendKind,
    pub public: Mutex<Listing>,
    pub secret: Mutex<Listing>,
    pub recipients: Mutex<Vec<KeyId>>,
    pub decrypt_delay: Duration,
    pub decrypt_failures: AtomicUsize,
    pub decrypt_calls: AtomicUsize,
    pub decrypts: Mutex<Vec<DecryptRequest>>,
    pub encrypts: Mutex<Vec<EncryptRequest>>,
}

impl FakeBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            public: Mutex::new(Listing::Text(public_listing())),
            secret: Mutex::new(Listing::Text(secret_listing())),
            recipients: Mutex::new(Vec::new()),
            decrypt_delay: Duration::ZERO,
            decrypt_failures: AtomicUsize::new(0),
            decrypt_calls: AtomicUsize::new(0),
            decrypts: Mutex::new(Vec::new()),
            encrypts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.decrypt_calls.load(Ordering::SeqCst)
    }

    async fn listing(&self, which: &Mutex<Listing>) -> Result<KeyListing> {
        let text = match &*which.lock() {
            Listing::Text(text) => Some(text.clone()),
            Listing::Fail => return Err(ChatPgpError::backend("scripted listing failure")),
            Listing::Hang => None,
        };
        match text {
            Some(text) => Ok(KeyListing::Colons(text)),
            None => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ChatPgpError::backend("unreachable"))
            }
        }
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn list_public_keys(&self) -> Result<KeyListing> {
        self.listing(&self.public).await
    }

    async fn list_secret_keys(&self) -> Result<KeyListing> {
        self.listing(&self.secret).await
    }

    async fn message_recipients(&self, _armored: &str) -> Result<Vec<KeyId>> {
        Ok(self.recipients.lock().clone())
    }

    async fn decrypt(&self, req: DecryptRequest) -> Result<DecryptOutput> {
        self.decrypt_calls.fetch_add(1, Ordering::SeqCst);
        self.decrypts.lock().push(req.clone());
        if !self.decrypt_delay.is_zero() {
            tokio::time::sleep(self.decrypt_delay).await;
        }
        let failing = self
            .decrypt_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ChatPgpError::Decryption("scripted failure".into()));
        }
        Ok(DecryptOutput {
            plaintext: format!("plain:{}", req.ciphertext),
            diagnostics: Some("gpg: encrypted with cv25519 key".into()),
            signatures: vec![SignatureCheck {
                key_id: KeyId::new(K2),
                verified: true,
            }],
        })
    }

    async fn encrypt(&self, req: EncryptRequest) -> Result<String> {
        self.encrypts.lock().push(req);
        Ok("-----BEGIN PGP MESSAGE-----   \n\nwcBMA \n-----END PGP MESSAGE-----\n".into())
    }
}

pub struct Harness {
    pub backend: Arc<FakeBackend>,
    pub config: Arc<MemoryConfigStore>,
    pub keychain: Keychain,
}

pub fn harness(backend: FakeBackend, config: PluginConfig) -> Harness {
    harness_with(backend, config, KeychainOptions::default())
}

pub fn harness_with(backend: FakeBackend, config: PluginConfig, options: KeychainOptions) -> Harness {
    let backend = Arc::new(backend);
    let config = Arc::new(MemoryConfigStore::new(config));
    let keychain = Keychain::new(backend.clone(), config.clone(), options);
    Harness {
        backend,
        config,
        keychain,
    }
}
