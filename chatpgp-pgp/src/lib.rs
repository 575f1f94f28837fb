//! OpenPGP backends for the chatpgp keychain.
//!
//! [`GpgBackend`] drives an installed `gpg` binary. [`NativeBackend`] does the same
//! work in-process with sequoia-openpgp over a folder of key files.

mod gpg;
mod native;

use std::path::PathBuf;
use std::sync::Arc;

use chatpgp_core::{Backend, PluginConfig};

pub use gpg::{GpgBackend, GpgConfig, PinentryMode, StatusReport};
pub use native::{NativeBackend, key_info_from_cert};

/// Which backend a keychain should run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendChoice {
    Native,
    Gpg,
}

impl BackendChoice {
    /// The persisted `useSystemGPG` flag picks the external backend.
    pub fn from_config(config: &PluginConfig) -> Self {
        if config.use_system_gpg {
            BackendChoice::Gpg
        } else {
            BackendChoice::Native
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub choice: BackendChoice,
    pub gpg: GpgConfig,
    /// Folder scanned by the native backend.
    pub keychain_dir: PathBuf,
    pub passphrase: Option<String>,
    /// Native backend only: import the GnuPG keyring before scanning the folder.
    pub import_gnupg: bool,
}

pub fn build_backend(options: BackendOptions) -> Arc<dyn Backend> {
    match options.choice {
        BackendChoice::Gpg => Arc::new(GpgBackend::new(options.gpg)),
        BackendChoice::Native => {
            let mut native =
                NativeBackend::new(options.keychain_dir).with_passphrase(options.passphrase);
            if options.import_gnupg {
                native = native.with_gnupg_import(GpgBackend::new(options.gpg));
            }
            Arc::new(native)
        }
    }
}
