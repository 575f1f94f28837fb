#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use chatpgp_core::{Backend, KeyId, Keychain, KeychainOptions, MemoryConfigStore, PluginConfig};
use openpgp::cert::prelude::*;
use openpgp::policy::StandardPolicy;
use openpgp::serialize::SerializeInto;
use openpgp::Cert;
use sequoia_openpgp as openpgp;
use tempfile::TempDir;

pub fn generate(uid: &str) -> Cert {
    CertBuilder::general_purpose(Some(uid))
        .generate()
        .expect("generate")
        .0
}

pub fn primary_id(cert: &Cert) -> KeyId {
    KeyId::new(cert.keyid().to_hex())
}

pub fn encryption_subkey_id(cert: &Cert) -> KeyId {
    let policy = StandardPolicy::new();
    cert.keys()
        .with_policy(&policy, None)
        .for_transport_encryption()
        .next()
        .map(|ka| KeyId::new(ka.key().keyid().to_hex()))
        .expect("encryption subkey")
}

/// A scratch keychain folder holding one private and one public key.
pub struct Fixture {
    pub dir: TempDir,
    pub k1: Cert,
    pub k2: Cert,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("keychain")).expect("keychain dir");
        let fixture = Self {
            dir,
            k1: generate("Alice (me) <alice@example.com>"),
            k2: generate("Bob <bob@example.org>"),
        };
        write_secret(&fixture.k1_path(), &fixture.k1);
        write_public(&fixture.k2_path(), &fixture.k2);
        fixture
    }

    pub fn keychain_dir(&self) -> PathBuf {
        self.dir.path().join("keychain")
    }

    pub fn k1_path(&self) -> PathBuf {
        self.keychain_dir().join("alice.asc")
    }

    pub fn k2_path(&self) -> PathBuf {
        self.keychain_dir().join("bob.asc")
    }
}

pub fn write_secret(path: &Path, cert: &Cert) {
    let bytes = cert.as_tsk().armored().to_vec().expect("serialize");
    std::fs::write(path, bytes).expect("write key");
}

pub fn write_public(path: &Path, cert: &Cert) {
    let bytes = cert.armored().to_vec().expect("serialize");
    std::fs::write(path, bytes).expect("write key");
}

pub fn keychain(
    backend: Arc<dyn Backend>,
    config: PluginConfig,
) -> (Keychain, Arc<MemoryConfigStore>) {
    let store = Arc::new(MemoryConfigStore::new(config));
    let keychain = Keychain::new(backend, store.clone(), KeychainOptions::default());
    (keychain, store)
}

pub fn gpg_available() -> bool {
    Command::new("gpg")
        .arg("--version")
        .output()
        .is_ok_and(|output| output.status.success())
}

/// A throwaway GnuPG home. The agent it starts is stopped on drop.
pub struct GnupgHome {
    pub dir: TempDir,
}

impl GnupgHome {
    pub fn new() -> Self {
        let dir = tempfile::Builder::new()
            .prefix("gpg")
            .tempdir()
            .expect("tempdir");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700))
                .expect("chmod");
        }
        Self { dir }
    }

    pub fn path(&self) -> String {
        self.dir.path().to_string_lossy().to_string()
    }

    pub fn gpg(&self, args: &[&str]) -> std::process::Output {
        let home = self.path();
        Command::new("gpg")
            .args(["--homedir", home.as_str(), "--batch", "--pinentry-mode", "loopback"])
            .args(args)
            .output()
            .expect("run gpg")
    }

    /// Creates an unprotected key and returns its long key ID.
    pub fn generate(&self, uid: &str) -> KeyId {
        let output = self.gpg(&[
            "--passphrase",
            "",
            "--quick-gen-key",
            uid,
            "default",
            "default",
            "never",
        ]);
        assert!(
            output.status.success(),
            "gpg keygen failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        let listing = self.gpg(&["--with-colons", "--list-secret-keys", uid]);
        let text = String::from_utf8_lossy(&listing.stdout);
        text.lines()
            .find(|line| line.starts_with("sec:"))
            .and_then(|line| line.split(':').nth(4))
            .map(KeyId::new)
            .expect("generated key in listing")
    }
}

impl Drop for GnupgHome {
    fn drop(&mut self) {
        let home = self.path();
        let _ = Command::new("gpgconf")
            .args(["--homedir", home.as_str(), "--kill", "gpg-agent"])
            .output();
    }
}
