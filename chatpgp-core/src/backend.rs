use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ChatPgpError, Result};
use crate::model::{KeyId, KeyInfo};

/// How a backend performs decryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// In-process OpenPGP: the caller picks the decryption key from its private index.
    Embedded,
    /// External program: it finds a usable secret key itself.
    ExternalProcess,
}

/// Key material as a backend reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyListing {
    /// GnuPG `--with-colons` text, to be run through the colon parser.
    Colons(String),
    /// Records already built from typed key objects.
    Keys(Vec<KeyInfo>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureCheck {
    #[serde(rename = "keyID")]
    pub key_id: KeyId,
    pub verified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptOutput {
    pub plaintext: String,
    /// Human-readable backend output (GnuPG's stderr), when there is any.
    pub diagnostics: Option<String>,
    pub signatures: Vec<SignatureCheck>,
}

#[derive(Debug, Clone)]
pub struct DecryptRequest {
    pub ciphertext: String,
    /// Primary ID of the private key to decrypt with. `None` lets the backend choose.
    pub decryption_key: Option<KeyId>,
}

#[derive(Debug, Clone)]
pub struct EncryptRequest {
    /// Primary IDs of the recipient keys.
    pub recipients: Vec<KeyId>,
    /// Primary ID of the private key to sign with.
    pub signer: Option<KeyId>,
    pub plaintext: String,
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;
    fn kind(&self) -> BackendKind;

    async fn list_public_keys(&self) -> Result<KeyListing>;
    async fn list_secret_keys(&self) -> Result<KeyListing>;

    /// Key IDs a message is encrypted to, in packet order.
    async fn message_recipients(&self, _armored: &str) -> Result<Vec<KeyId>> {
        Err(ChatPgpError::not_implemented(
            "recipient inspection is not supported by this backend",
        ))
    }

    async fn decrypt(&self, req: DecryptRequest) -> Result<DecryptOutput>;
    /// Returns the armored ciphertext.
    async fn encrypt(&self, req: EncryptRequest) -> Result<String>;
}
