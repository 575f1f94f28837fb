//! Backend-independent representation of primary keys and their subkeys.
//!
//! Both backends produce these records: the external `gpg` backend through the
//! colon-list parser, the embedded backend by summarizing certificates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Hex key identifier, stored lowercase.
///
/// Lookups are exact. Unlike GnuPG there is no short-ID or suffix matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct KeyId(String);

impl KeyId {
    pub fn new(id: impl AsRef<str>) -> Self {
        KeyId(id.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for KeyId {
    fn from(id: String) -> Self {
        KeyId::new(id)
    }
}

impl From<&str> for KeyId {
    fn from(id: &str) -> Self {
        KeyId::new(id)
    }
}

impl From<KeyId> for String {
    fn from(id: KeyId) -> Self {
        id.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Public-key algorithm identifiers from the OpenPGP registry (RFC 9580, section 9.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum KeyAlgorithm {
    Reserved,
    RsaEncryptSign,
    RsaEncryptOnly,
    RsaSignOnly,
    Elgamal,
    Dsa,
    Ecdh,
    Ecdsa,
    EdDsaLegacy,
    X25519,
    X448,
    Ed25519,
    Ed448,
    Unknown(u8),
}

impl KeyAlgorithm {
    pub fn name(self) -> String {
        match self {
            KeyAlgorithm::Reserved => "reserved".to_string(),
            KeyAlgorithm::RsaEncryptSign => "RSA".to_string(),
            KeyAlgorithm::RsaEncryptOnly => "RSA (encrypt only)".to_string(),
            KeyAlgorithm::RsaSignOnly => "RSA (sign only)".to_string(),
            KeyAlgorithm::Elgamal => "Elgamal".to_string(),
            KeyAlgorithm::Dsa => "DSA".to_string(),
            KeyAlgorithm::Ecdh => "ECDH".to_string(),
            KeyAlgorithm::Ecdsa => "ECDSA".to_string(),
            KeyAlgorithm::EdDsaLegacy => "EdDSA".to_string(),
            KeyAlgorithm::X25519 => "X25519".to_string(),
            KeyAlgorithm::X448 => "X448".to_string(),
            KeyAlgorithm::Ed25519 => "Ed25519".to_string(),
            KeyAlgorithm::Ed448 => "Ed448".to_string(),
            KeyAlgorithm::Unknown(code) => format!("algo-{code}"),
        }
    }
}

impl From<u8> for KeyAlgorithm {
    fn from(code: u8) -> Self {
        match code {
            0 => KeyAlgorithm::Reserved,
            1 => KeyAlgorithm::RsaEncryptSign,
            2 => KeyAlgorithm::RsaEncryptOnly,
            3 => KeyAlgorithm::RsaSignOnly,
            16 => KeyAlgorithm::Elgamal,
            17 => KeyAlgorithm::Dsa,
            18 => KeyAlgorithm::Ecdh,
            19 => KeyAlgorithm::Ecdsa,
            22 => KeyAlgorithm::EdDsaLegacy,
            25 => KeyAlgorithm::X25519,
            26 => KeyAlgorithm::X448,
            27 => KeyAlgorithm::Ed25519,
            28 => KeyAlgorithm::Ed448,
            other => KeyAlgorithm::Unknown(other),
        }
    }
}

impl From<KeyAlgorithm> for u8 {
    fn from(algo: KeyAlgorithm) -> Self {
        match algo {
            KeyAlgorithm::Reserved => 0,
            KeyAlgorithm::RsaEncryptSign => 1,
            KeyAlgorithm::RsaEncryptOnly => 2,
            KeyAlgorithm::RsaSignOnly => 3,
            KeyAlgorithm::Elgamal => 16,
            KeyAlgorithm::Dsa => 17,
            KeyAlgorithm::Ecdh => 18,
            KeyAlgorithm::Ecdsa => 19,
            KeyAlgorithm::EdDsaLegacy => 22,
            KeyAlgorithm::X25519 => 25,
            KeyAlgorithm::X448 => 26,
            KeyAlgorithm::Ed25519 => 27,
            KeyAlgorithm::Ed448 => 28,
            KeyAlgorithm::Unknown(code) => code,
        }
    }
}

/// Key validity, ordered from least to most trusted.
///
/// See field 2 of GnuPG's `doc/DETAILS`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(from = "i8", into = "i8")]
pub enum KeyValidity {
    Invalid = -3,
    Revoked = -2,
    Expired = -1,
    #[default]
    Unknown = 0,
    Never = 1,
    Marginal = 2,
    Full = 3,
    Ultimate = 4,
}

impl KeyValidity {
    /// Maps a GnuPG validity letter. Anything unrecognized is `Unknown`.
    pub fn from_code(code: &str) -> Self {
        match code {
            "i" => KeyValidity::Invalid,
            "r" => KeyValidity::Revoked,
            "e" => KeyValidity::Expired,
            "n" => KeyValidity::Never,
            "m" => KeyValidity::Marginal,
            "f" => KeyValidity::Full,
            "u" => KeyValidity::Ultimate,
            _ => KeyValidity::Unknown,
        }
    }
}

impl From<i8> for KeyValidity {
    fn from(value: i8) -> Self {
        match value {
            -3 => KeyValidity::Invalid,
            -2 => KeyValidity::Revoked,
            -1 => KeyValidity::Expired,
            1 => KeyValidity::Never,
            2 => KeyValidity::Marginal,
            3 => KeyValidity::Full,
            4 => KeyValidity::Ultimate,
            _ => KeyValidity::Unknown,
        }
    }
}

impl From<KeyValidity> for i8 {
    fn from(validity: KeyValidity) -> Self {
        validity as i8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub sign: bool,
    pub certify: bool,
    pub encrypt: bool,
    pub authentication: bool,
}

impl Capabilities {
    /// Reads the lowercase (per-key) letters of a GnuPG capability field.
    pub fn from_key_field(field: &str) -> Self {
        Self {
            sign: field.contains('s'),
            certify: field.contains('c'),
            encrypt: field.contains('e'),
            authentication: field.contains('a'),
        }
    }

    /// Reads the uppercase (whole-key) letters of a GnuPG capability field.
    pub fn from_primary_field(field: &str) -> Self {
        Self {
            sign: field.contains('S'),
            certify: field.contains('C'),
            encrypt: field.contains('E'),
            authentication: field.contains('A'),
        }
    }

    pub fn union(self, other: Capabilities) -> Self {
        Self {
            sign: self.sign || other.sign,
            certify: self.certify || other.certify,
            encrypt: self.encrypt || other.encrypt,
            authentication: self.authentication || other.authentication,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserId {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubKeyInfo {
    pub validity: KeyValidity,
    pub algorithm: KeyAlgorithm,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub curve: Option<String>,
    pub key_length: u32,
    #[serde(rename = "keyID")]
    pub key_id: KeyId,
    pub creation_date: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_date: Option<u64>,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyInfo {
    #[serde(flatten)]
    pub primary: SubKeyInfo,
    pub private: bool,
    #[serde(rename = "userIDs")]
    pub user_ids: Vec<UserId>,
    pub primary_capabilities: Capabilities,
    pub subkeys: Vec<SubKeyInfo>,
}

impl KeyInfo {
    pub fn key_id(&self) -> &KeyId {
        &self.primary.key_id
    }

    /// The primary key ID followed by every subkey ID.
    pub fn all_key_ids(&self) -> impl Iterator<Item = &KeyId> {
        std::iter::once(&self.primary.key_id).chain(self.subkeys.iter().map(|sub| &sub.key_id))
    }

    pub fn summary(&self) -> KeySummary {
        KeySummary {
            user_ids: self.user_ids.clone(),
            key_id: self.primary.key_id.clone(),
        }
    }
}

/// The identity view of a key handed to callers of signing-key and binding lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySummary {
    #[serde(rename = "userIDs")]
    pub user_ids: Vec<UserId>,
    #[serde(rename = "keyID")]
    pub key_id: KeyId,
}
