use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chatpgp_core::{
    Backend, BackendKind, Capabilities, ChatPgpError, DecryptOutput, DecryptRequest,
    EncryptRequest, KeyAlgorithm, KeyId, KeyInfo, KeyListing, KeyValidity, Result,
    SignatureCheck, SubKeyInfo, parse_user_id,
};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use openpgp::cert::prelude::*;
use openpgp::crypto::{KeyPair, Password, SessionKey};
use openpgp::crypto::mpi;
use openpgp::packet::{PKESK, SKESK};
use openpgp::parse::stream::{
    DecryptionHelper, DecryptorBuilder, MessageLayer, MessageStructure, VerificationError,
    VerificationHelper,
};
use openpgp::parse::{PacketParser, PacketParserResult, Parse};
use openpgp::policy::{Policy, StandardPolicy};
use openpgp::serialize::stream::{Armorer, Encryptor, LiteralWriter, Message, Recipient, Signer};
use openpgp::types::{KeyFlags, RevocationStatus, SymmetricAlgorithm};
use openpgp::{Cert, KeyHandle, KeyID, Packet};
use sequoia_openpgp as openpgp;

use crate::gpg::GpgBackend;

/// Backend built on sequoia-openpgp over a folder of key files.
///
/// Keys are read from the keychain folder (not recursively), and optionally from
/// the local GnuPG keyring first. The loaded certificates are kept in memory until
/// the next public-key listing reloads them.
#[derive(Clone)]
pub struct NativeBackend {
    keychain_dir: PathBuf,
    passphrase: Option<Password>,
    gnupg: Option<GpgBackend>,
    certs: Arc<RwLock<Option<Arc<Vec<Cert>>>>>,
}

impl NativeBackend {
    pub fn new(keychain_dir: impl Into<PathBuf>) -> Self {
        Self {
            keychain_dir: keychain_dir.into(),
            passphrase: None,
            gnupg: None,
            certs: Arc::new(RwLock::new(None)),
        }
    }

    /// Passphrase used to unlock protected secret keys.
    pub fn with_passphrase(mut self, passphrase: Option<String>) -> Self {
        self.passphrase = passphrase.map(Password::from);
        self
    }

    /// Also import the keyring of this GnuPG installation on every reload.
    pub fn with_gnupg_import(mut self, gnupg: GpgBackend) -> Self {
        self.gnupg = Some(gnupg);
        self
    }

    pub fn keychain_dir(&self) -> &Path {
        &self.keychain_dir
    }

    async fn reload(&self) -> Result<Arc<Vec<Cert>>> {
        let mut exported = Vec::new();
        if let Some(gnupg) = &self.gnupg {
            for secret in [false, true] {
                match gnupg.export_armored(secret).await {
                    Ok(bytes) => exported.push(bytes),
                    Err(err) => warn!(secret, %err, "gnupg export failed"),
                }
            }
        }

        let dir = self.keychain_dir.clone();
        let certs = blocking(move || {
            let mut loaded = Vec::new();
            for bytes in &exported {
                loaded.extend(parse_certs(bytes, "gnupg export"));
            }
            loaded.extend(load_certs_from_dir(&dir));
            Ok(merge_certs(loaded))
        })
        .await?;

        info!(count = certs.len(), dir = %self.keychain_dir.display(), "loaded certificates");
        let certs = Arc::new(certs);
        *self.certs.write() = Some(Arc::clone(&certs));
        Ok(certs)
    }

    async fn snapshot(&self) -> Result<Arc<Vec<Cert>>> {
        let loaded = self.certs.read().clone();
        match loaded {
            Some(certs) => Ok(certs),
            None => self.reload().await,
        }
    }
}

impl std::fmt::Debug for NativeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeBackend")
            .field("keychain_dir", &self.keychain_dir)
            .field("passphrase_set", &self.passphrase.is_some())
            .field("gnupg_import", &self.gnupg.is_some())
            .finish()
    }
}

#[async_trait]
impl Backend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Embedded
    }

    async fn list_public_keys(&self) -> Result<KeyListing> {
        let certs = self.reload().await?;
        let policy = StandardPolicy::new();
        Ok(KeyListing::Keys(
            certs
                .iter()
                .map(|cert| key_info_from_cert(cert, false, &policy))
                .collect(),
        ))
    }

    async fn list_secret_keys(&self) -> Result<KeyListing> {
        let certs = self.snapshot().await?;
        let policy = StandardPolicy::new();
        Ok(KeyListing::Keys(
            certs
                .iter()
                .filter(|cert| cert.is_tsk())
                .map(|cert| key_info_from_cert(cert, true, &policy))
                .collect(),
        ))
    }

    async fn message_recipients(&self, armored: &str) -> Result<Vec<KeyId>> {
        let bytes = armored.as_bytes().to_vec();
        blocking(move || message_recipients(&bytes)).await
    }

    async fn decrypt(&self, req: DecryptRequest) -> Result<DecryptOutput> {
        let certs = self.snapshot().await?;
        let passphrase = self.passphrase.clone();
        blocking(move || decrypt_message(&certs, passphrase, req)).await
    }

    async fn encrypt(&self, req: EncryptRequest) -> Result<String> {
        let certs = self.snapshot().await?;
        let passphrase = self.passphrase.clone();
        blocking(move || encrypt_message(&certs, passphrase.as_ref(), req)).await
    }
}

async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| ChatPgpError::backend(format!("openpgp worker failed: {err}")))?
}

fn parse_certs(bytes: &[u8], origin: &str) -> Vec<Cert> {
    let ppr = match PacketParser::from_bytes(bytes) {
        Ok(ppr) => ppr,
        Err(err) => {
            warn!(file = origin, %err, "skipping unreadable key material");
            return Vec::new();
        }
    };
    let mut certs = Vec::new();
    for cert in CertParser::from(ppr) {
        match cert {
            Ok(cert) => certs.push(cert),
            Err(err) => warn!(file = origin, %err, "skipping invalid certificate"),
        }
    }
    certs
}

/// Reads every regular file directly inside `dir`, in file-name order.
fn load_certs_from_dir(dir: &Path) -> Vec<Cert> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), %err, "cannot read keychain folder");
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(dir = %dir.display(), %err, "skipping folder entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_file()))
        .map(|entry| entry.path())
        .collect();
    paths.sort();

    let mut certs = Vec::new();
    for path in paths {
        let origin = path.display().to_string();
        match fs::read(&path) {
            Ok(bytes) => certs.extend(parse_certs(&bytes, &origin)),
            Err(err) => warn!(file = %origin, %err, "skipping unreadable key file"),
        }
    }
    certs
}

/// Collapses certificates sharing a fingerprint. Secret material survives a
/// later public-only copy.
fn merge_certs(certs: Vec<Cert>) -> Vec<Cert> {
    let mut order = Vec::new();
    let mut by_fpr: HashMap<String, Cert> = HashMap::new();
    for cert in certs {
        let fpr = cert.fingerprint().to_hex();
        match by_fpr.remove(&fpr) {
            Some(existing) => {
                let merged = match existing.merge_public_and_secret(cert.clone()) {
                    Ok(merged) => merged,
                    Err(err) => {
                        debug!(fingerprint = %fpr, %err, "merge failed, keeping later copy");
                        cert
                    }
                };
                by_fpr.insert(fpr, merged);
            }
            None => {
                order.push(fpr.clone());
                by_fpr.insert(fpr, cert);
            }
        }
    }
    order
        .into_iter()
        .filter_map(|fpr| by_fpr.remove(&fpr))
        .collect()
}

/// Builds the keychain record for a certificate.
pub fn key_info_from_cert(cert: &Cert, private: bool, policy: &dyn Policy) -> KeyInfo {
    let fallback = if private {
        KeyValidity::Ultimate
    } else {
        KeyValidity::Unknown
    };

    let (primary_validity, primary_caps, primary_expiry) = match cert.with_policy(policy, None) {
        Ok(valid) => {
            let primary = valid.primary_key();
            let validity = match valid.revocation_status() {
                RevocationStatus::Revoked(_) => KeyValidity::Revoked,
                _ if valid.alive().is_err() => KeyValidity::Expired,
                _ => fallback,
            };
            (
                validity,
                capabilities(primary.key_flags()),
                primary.key_expiration_time(),
            )
        }
        Err(_) => (KeyValidity::Invalid, Capabilities::default(), None),
    };

    let primary = subkey_info(
        cert.primary_key().key().parts_as_public(),
        primary_validity,
        primary_caps,
        primary_expiry,
    );

    let mut subkeys = Vec::new();
    for ka in cert.keys().subkeys() {
        let (validity, caps, expiry) = match ka.clone().with_policy(policy, None) {
            Ok(valid) => {
                let validity = match valid.revocation_status() {
                    RevocationStatus::Revoked(_) => KeyValidity::Revoked,
                    _ if valid.alive().is_err() => KeyValidity::Expired,
                    _ => fallback,
                };
                (validity, capabilities(valid.key_flags()), valid.key_expiration_time())
            }
            Err(_) => (KeyValidity::Invalid, Capabilities::default(), None),
        };
        subkeys.push(subkey_info(ka.key().parts_as_public(), validity, caps, expiry));
    }

    let primary_capabilities = subkeys
        .iter()
        .fold(primary.capabilities, |acc, sub| acc.union(sub.capabilities));

    let user_ids = cert
        .userids()
        .map(|ua| parse_user_id(&String::from_utf8_lossy(ua.userid().value())))
        .collect();

    KeyInfo {
        primary,
        private,
        user_ids,
        primary_capabilities,
        subkeys,
    }
}

fn subkey_info<R: openpgp::packet::key::KeyRole>(
    key: &openpgp::packet::Key<openpgp::packet::key::PublicParts, R>,
    validity: KeyValidity,
    capabilities: Capabilities,
    expiry: Option<SystemTime>,
) -> SubKeyInfo {
    let curve = match key.mpis() {
        mpi::PublicKey::EdDSA { curve, .. }
        | mpi::PublicKey::ECDSA { curve, .. }
        | mpi::PublicKey::ECDH { curve, .. } => Some(curve.to_string()),
        _ => None,
    };
    SubKeyInfo {
        validity,
        algorithm: KeyAlgorithm::from(u8::from(key.pk_algo())),
        curve,
        key_length: key.mpis().bits().unwrap_or(0) as u32,
        key_id: KeyId::new(key.keyid().to_hex()),
        creation_date: unix_seconds(key.creation_time()),
        expiration_date: expiry.map(unix_seconds),
        capabilities,
    }
}

fn capabilities(flags: Option<KeyFlags>) -> Capabilities {
    let Some(flags) = flags else {
        return Capabilities::default();
    };
    Capabilities {
        sign: flags.for_signing(),
        certify: flags.for_certification(),
        encrypt: flags.for_transport_encryption() || flags.for_storage_encryption(),
        authentication: flags.for_authentication(),
    }
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

fn message_recipients(bytes: &[u8]) -> Result<Vec<KeyId>> {
    let mut recipients = Vec::new();
    let mut ppr = PacketParser::from_bytes(bytes)
        .map_err(|err| ChatPgpError::Decryption(format!("parse failed: {err}")))?;
    while let PacketParserResult::Some(pp) = ppr {
        match &pp.packet {
            Packet::PKESK(pkesk) => {
                if let Some(recipient) = pkesk.recipient() {
                    recipients.push(KeyId::new(KeyID::from(recipient).to_hex()));
                }
            }
            Packet::SEIP(_) => break,
            _ => {}
        }
        ppr = pp
            .next()
            .map_err(|err| ChatPgpError::Decryption(format!("parse failed: {err}")))?
            .1;
    }
    Ok(recipients)
}

fn decrypt_message(
    certs: &[Cert],
    passphrase: Option<Password>,
    req: DecryptRequest,
) -> Result<DecryptOutput> {
    let decryption_certs: Vec<Cert> = certs
        .iter()
        .filter(|cert| cert.is_tsk())
        .filter(|cert| {
            req.decryption_key
                .as_ref()
                .is_none_or(|id| KeyId::new(cert.keyid().to_hex()) == *id)
        })
        .cloned()
        .collect();
    if decryption_certs.is_empty() {
        return Err(ChatPgpError::Decryption("no matching secret key".into()));
    }

    let helper = NativeHelper {
        decryption_certs,
        verification_certs: certs.to_vec(),
        passphrase,
        signatures: Vec::new(),
    };
    let policy = StandardPolicy::new();
    let mut decryptor = DecryptorBuilder::from_bytes(req.ciphertext.as_bytes())
        .map_err(|err| ChatPgpError::Decryption(format!("parse failed: {err}")))?
        .with_policy(&policy, None, helper)
        .map_err(|err| ChatPgpError::Decryption(err.to_string()))?;

    let mut plaintext = Vec::new();
    decryptor
        .read_to_end(&mut plaintext)
        .map_err(|err| ChatPgpError::Decryption(format!("read failed: {err}")))?;
    let helper = decryptor.into_helper();

    Ok(DecryptOutput {
        plaintext: String::from_utf8_lossy(&plaintext).into_owned(),
        diagnostics: None,
        signatures: helper.signatures,
    })
}

fn find_cert<'a>(certs: &'a [Cert], id: &KeyId) -> Option<&'a Cert> {
    certs
        .iter()
        .find(|cert| KeyId::new(cert.keyid().to_hex()) == *id)
}

fn signing_keypair(cert: &Cert, passphrase: Option<&Password>) -> Result<KeyPair> {
    let policy = StandardPolicy::new();
    let key = cert
        .keys()
        .secret()
        .with_policy(&policy, None)
        .supported()
        .alive()
        .revoked(false)
        .for_signing()
        .next()
        .ok_or_else(|| ChatPgpError::InvalidInput("no usable signing key".into()))?;
    let mut key = key.key().clone();
    if key.secret().is_encrypted() {
        let passphrase = passphrase.ok_or_else(|| {
            ChatPgpError::InvalidInput("signing key is encrypted; passphrase required".into())
        })?;
        key = key
            .decrypt_secret(passphrase)
            .map_err(|err| ChatPgpError::InvalidInput(format!("key decrypt failed: {err}")))?;
    }
    key.into_keypair()
        .map_err(|err| ChatPgpError::backend(format!("keypair failed: {err}")))
}

fn encrypt_message(
    certs: &[Cert],
    passphrase: Option<&Password>,
    req: EncryptRequest,
) -> Result<String> {
    let policy = StandardPolicy::new();
    let mut recipients: Vec<Recipient<'_>> = Vec::new();
    for id in &req.recipients {
        let cert =
            find_cert(certs, id).ok_or_else(|| ChatPgpError::Resolution(id.to_string()))?;
        let before = recipients.len();
        for key in cert
            .keys()
            .with_policy(&policy, None)
            .supported()
            .alive()
            .revoked(false)
            .for_transport_encryption()
        {
            recipients.push(key.into());
        }
        if recipients.len() == before {
            return Err(ChatPgpError::InvalidInput(format!(
                "key {id} has no usable encryption subkey"
            )));
        }
    }

    let keypair = match &req.signer {
        Some(id) => {
            let cert = find_cert(certs, id)
                .filter(|cert| cert.is_tsk())
                .ok_or_else(|| ChatPgpError::Resolution(id.to_string()))?;
            Some(signing_keypair(cert, passphrase)?)
        }
        None => None,
    };

    let mut sink = Vec::new();
    let message = Message::new(&mut sink);
    let message = Armorer::new(message)
        .build()
        .map_err(|err| ChatPgpError::backend(format!("armor failed: {err}")))?;
    let mut message = Encryptor::for_recipients(message, recipients)
        .build()
        .map_err(|err| ChatPgpError::backend(format!("encryptor failed: {err}")))?;
    if let Some(keypair) = keypair {
        message = Signer::new(message, keypair)
            .map_err(|err| ChatPgpError::backend(format!("signer failed: {err}")))?
            .build()
            .map_err(|err| ChatPgpError::backend(format!("signer build failed: {err}")))?;
    }
    let mut message = LiteralWriter::new(message)
        .build()
        .map_err(|err| ChatPgpError::backend(format!("literal writer failed: {err}")))?;
    message
        .write_all(req.plaintext.as_bytes())
        .map_err(|err| ChatPgpError::Io(format!("write failed: {err}")))?;
    message
        .finalize()
        .map_err(|err| ChatPgpError::backend(format!("finalize failed: {err}")))?;

    String::from_utf8(sink)
        .map_err(|err| ChatPgpError::backend(format!("armored output is not utf-8: {err}")))
}

struct NativeHelper {
    decryption_certs: Vec<Cert>,
    verification_certs: Vec<Cert>,
    passphrase: Option<Password>,
    signatures: Vec<SignatureCheck>,
}

impl VerificationHelper for NativeHelper {
    fn get_certs(&mut self, ids: &[KeyHandle]) -> openpgp::Result<Vec<Cert>> {
        Ok(self
            .verification_certs
            .iter()
            .filter(|cert| {
                cert.keys()
                    .any(|ka| ids.iter().any(|id| ka.key().key_handle().aliases(id)))
            })
            .cloned()
            .collect())
    }

    /// Records every signature. A signature that fails to verify for any reason
    /// is reported as unverified, never as an error.
    fn check(&mut self, structure: MessageStructure) -> openpgp::Result<()> {
        for layer in structure.iter() {
            let MessageLayer::SignatureGroup { results } = layer else {
                continue;
            };
            for result in results {
                let (sig, verified) = match result {
                    Ok(good) => (good.sig, true),
                    Err(VerificationError::MissingKey { sig, .. })
                    | Err(VerificationError::UnboundKey { sig, .. })
                    | Err(VerificationError::BadKey { sig, .. })
                    | Err(VerificationError::BadSignature { sig, .. })
                    | Err(VerificationError::MalformedSignature { sig, .. }) => (*sig, false),
                    Err(_) => continue,
                };
                let Some(issuer) = sig.get_issuers().into_iter().next() else {
                    continue;
                };
                self.signatures.push(SignatureCheck {
                    key_id: KeyId::new(KeyID::from(issuer).to_hex()),
                    verified,
                });
            }
        }
        Ok(())
    }
}

impl DecryptionHelper for NativeHelper {
    fn decrypt(
        &mut self,
        pkesks: &[PKESK],
        _skesks: &[SKESK],
        sym_algo: Option<SymmetricAlgorithm>,
        decrypt: &mut dyn FnMut(Option<SymmetricAlgorithm>, &SessionKey) -> bool,
    ) -> openpgp::Result<Option<Cert>> {
        let policy = StandardPolicy::new();
        for pkesk in pkesks {
            for cert in &self.decryption_certs {
                for key in cert
                    .keys()
                    .secret()
                    .with_policy(&policy, None)
                    .supported()
                    .revoked(false)
                    .for_transport_encryption()
                {
                    let mut key = key.key().clone();
                    if key.secret().is_encrypted() {
                        let Some(passphrase) = self.passphrase.as_ref() else {
                            continue;
                        };
                        match key.decrypt_secret(passphrase) {
                            Ok(decrypted) => key = decrypted,
                            Err(_) => continue,
                        }
                    }
                    let mut keypair = key.into_keypair()?;
                    if let Some((algo, sk)) = pkesk.decrypt(&mut keypair, sym_algo)
                        && decrypt(algo, &sk)
                    {
                        return Ok(Some(cert.clone()));
                    }
                }
            }
        }
        Ok(None)
    }
}
