//! Keychain indexing and key resolution for PGP-encrypted chat.
//!
//! The OpenPGP work itself happens behind the [`Backend`] trait; this crate turns
//! whatever a backend reports into an indexed keychain, keeps conversation key
//! bindings and the signing-key choice consistent with it, and drives encrypt
//! and decrypt requests through [`Keychain`].

pub mod backend;
pub mod bindings;
pub mod cache;
pub mod colons;
pub mod config;
pub mod error;
pub mod keychain;
pub mod model;
pub mod store;
pub mod userid;

pub use backend::{
    Backend, BackendKind, DecryptOutput, DecryptRequest, EncryptRequest, KeyListing,
    SignatureCheck,
};
pub use bindings::{BindingRegistry, KeyBinding, validate_bindings};
pub use cache::DecryptCache;
pub use colons::parse_colon_listing;
pub use config::{ConfigStore, JsonConfigStore, KeychainOptions, MemoryConfigStore, PluginConfig};
pub use error::{ChatPgpError, Result};
pub use keychain::{DecryptResult, Keychain, LoadPhase};
pub use model::{
    Capabilities, KeyAlgorithm, KeyId, KeyInfo, KeySummary, KeyValidity, SubKeyInfo, UserId,
};
pub use store::KeychainStore;
pub use userid::{display_user_id, parse_user_id, sanitize_for_terminal};
