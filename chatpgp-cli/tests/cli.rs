use openpgp::Cert;
use openpgp::cert::prelude::*;
use openpgp::serialize::SerializeInto;
use sequoia_openpgp as openpgp;
use serde_json::Value;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use tempfile::TempDir;

struct Home {
    dir: TempDir,
    me: Cert,
    peer: Cert,
}

impl Home {
    /// A data directory whose keychain folder holds our secret key and a peer's public key.
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let keychain = dir.path().join("keychain");
        std::fs::create_dir_all(&keychain).expect("keychain dir");
        let me = generate("Alice <alice@example.com>");
        let peer = generate("Bob <bob@example.org>");
        let secret = me.as_tsk().armored().to_vec().expect("serialize");
        std::fs::write(keychain.join("me.asc"), secret).expect("write key");
        let public = peer.armored().to_vec().expect("serialize");
        std::fs::write(keychain.join("peer.asc"), public).expect("write key");
        Self { dir, me, peer }
    }

    fn empty() -> TempDir {
        tempfile::tempdir().expect("tempdir")
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }
}

fn generate(uid: &str) -> Cert {
    CertBuilder::general_purpose(Some(uid))
        .generate()
        .expect("generate")
        .0
}

fn key_id(cert: &Cert) -> String {
    cert.keyid().to_hex().to_lowercase()
}

fn run_cli(args: &[&str], home: &Path, stdin: Option<&[u8]>) -> (i32, String, String) {
    let bin = env!("CARGO_BIN_EXE_chatpgp");
    let mut cmd = Command::new(bin);
    cmd.args(["--backend", "native"])
        .args(args)
        .env("CHATPGP_HOME", home)
        .env_remove("CHATPGP_LOG")
        .env("RUST_BACKTRACE", "0")
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().expect("spawn chatpgp");
    if let Some(input) = stdin {
        let mut handle = child.stdin.take().expect("stdin handle");
        handle.write_all(input).expect("write stdin");
    }
    let output = child.wait_with_output().expect("wait output");
    let code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (code, stdout, stderr)
}

fn json(stdout: &str) -> Value {
    serde_json::from_str(stdout).unwrap_or_else(|err| panic!("bad json ({err}): {stdout}"))
}

#[test]
fn list_keys_reports_private_and_public_keys() {
    let home = Home::new();
    let (code, stdout, stderr) = run_cli(&["list-keys"], home.path(), None);
    assert_eq!(code, 0, "stderr: {stderr}");
    let keys = json(&stdout);
    let keys = keys.as_array().expect("array");
    assert_eq!(keys.len(), 2);

    let (code, stdout, _) = run_cli(&["list-keys", "--secret"], home.path(), None);
    assert_eq!(code, 0);
    let secret = json(&stdout);
    assert_eq!(secret[0]["keyID"], key_id(&home.me));
    assert_eq!(secret[0]["private"], true);
}

#[test]
fn list_keys_on_empty_home_is_empty() {
    let home = Home::empty();
    let (code, stdout, stderr) = run_cli(&["list-keys", "--public"], home.path(), None);
    assert_eq!(code, 0, "stderr: {stderr}");
    assert_eq!(json(&stdout), Value::Array(Vec::new()));
    assert!(home.path().join("keychain").is_dir());
}

#[test]
fn user_ids_print_display_form() {
    let home = Home::new();
    let (code, stdout, _) = run_cli(&["user-ids", &key_id(&home.peer)], home.path(), None);
    assert_eq!(code, 0);
    assert_eq!(stdout.trim(), "Bob <bob@example.org>");

    let (code, _, stderr) = run_cli(&["user-ids", "0123456789abcdef"], home.path(), None);
    assert_ne!(code, 0);
    assert!(stderr.contains("key not found"), "unexpected stderr: {stderr}");
}

#[test]
fn signing_key_is_persisted_in_config() {
    let home = Home::new();
    let me = key_id(&home.me);
    let (code, stdout, stderr) = run_cli(&["set-signing-key", &me], home.path(), None);
    assert_eq!(code, 0, "stderr: {stderr}");
    assert_eq!(json(&stdout)["keyID"], me.as_str());

    let (_, stdout, _) = run_cli(&["config"], home.path(), None);
    assert_eq!(json(&stdout)["signKeyID"], me.as_str());

    let (_, stdout, _) = run_cli(&["signing-key"], home.path(), None);
    assert_eq!(json(&stdout)["userIDs"][0]["email"], "alice@example.com");
}

#[test]
fn public_key_cannot_become_signing_key() {
    let home = Home::new();
    let (code, _, stderr) = run_cli(&["set-signing-key", &key_id(&home.peer)], home.path(), None);
    assert_ne!(code, 0);
    assert!(stderr.contains("signing key cleared"), "unexpected stderr: {stderr}");

    let (_, stdout, _) = run_cli(&["config"], home.path(), None);
    assert_eq!(json(&stdout)["signKeyID"], Value::Null);
}

#[test]
fn encrypt_then_decrypt_round_trips() {
    let home = Home::new();
    let me = key_id(&home.me);
    let peer = key_id(&home.peer);
    run_cli(&["set-signing-key", &me], home.path(), None);

    let (code, armored, stderr) = run_cli(&["encrypt", "-r", &peer], home.path(), Some(b"hi bob"));
    assert_eq!(code, 0, "stderr: {stderr}");
    assert!(armored.starts_with("-----BEGIN PGP MESSAGE-----"));

    let message = home.path().join("message.asc");
    std::fs::write(&message, &armored).expect("write message");
    let path = message.to_string_lossy().to_string();
    let (code, stdout, stderr) = run_cli(&["decrypt", &path], home.path(), None);
    assert_eq!(code, 0, "stderr: {stderr}");
    let result = json(stdout.trim());
    assert_eq!(result["data"], "hi bob");
    assert_eq!(result["signatures"][0]["verified"], true);
    assert_eq!(result["keyIDs"].as_array().map(Vec::len), Some(2));
}

#[test]
fn decrypt_failure_sets_error_and_exit_code() {
    let home = Home::new();
    let peer = key_id(&home.peer);
    let (code, armored, _) = run_cli(&["encrypt", "-r", &peer], home.path(), Some(b"for bob"));
    assert_eq!(code, 0);

    let (code, stdout, _) = run_cli(&["decrypt"], home.path(), Some(armored.as_bytes()));
    assert_eq!(code, 1);
    let result = json(stdout.trim());
    assert!(result["error"].is_string());
    assert!(result.get("data").is_none());
}

#[test]
fn encrypt_requires_a_target() {
    let home = Home::new();
    let (code, _, stderr) = run_cli(&["encrypt"], home.path(), Some(b"hi"));
    assert_ne!(code, 0);
    assert!(
        stderr.contains("at least one -r/--recipient or --identity"),
        "unexpected stderr: {stderr}"
    );
}

#[test]
fn encrypt_to_unknown_key_fails() {
    let home = Home::new();
    let (code, _, stderr) = run_cli(&["encrypt", "-r", "0000000000000000"], home.path(), Some(b"x"));
    assert_ne!(code, 0);
    assert!(stderr.contains("key not found"), "unexpected stderr: {stderr}");
}

#[test]
fn bindings_drive_identity_encryption() {
    let home = Home::new();
    let peer = key_id(&home.peer);
    let pair = format!("77={peer}");
    let (code, stdout, stderr) = run_cli(&["bind", &pair, "78=ffffffffffffffff"], home.path(), None);
    assert_eq!(code, 0, "stderr: {stderr}");
    assert_eq!(json(&stdout).as_array().map(Vec::len), Some(1));
    assert!(stderr.contains("dropped 1"), "unexpected stderr: {stderr}");

    let (_, stdout, _) = run_cli(&["bindings", "77"], home.path(), None);
    assert_eq!(json(&stdout)[0]["keyID"], peer.as_str());
    let (_, stdout, _) = run_cli(&["bindings", "78"], home.path(), None);
    assert_eq!(json(&stdout), Value::Null);

    let (code, armored, stderr) =
        run_cli(&["encrypt", "--identity", "77"], home.path(), Some(b"bound"));
    assert_eq!(code, 0, "stderr: {stderr}");
    assert!(armored.contains("BEGIN PGP MESSAGE"));
}

#[test]
fn bind_rejects_non_positive_identity() {
    let home = Home::new();
    let pair = format!("0={}", key_id(&home.peer));
    let (code, _, stderr) = run_cli(&["bind", &pair], home.path(), None);
    assert_ne!(code, 0);
    assert!(stderr.contains("must be positive"), "unexpected stderr: {stderr}");

    let (_, stdout, _) = run_cli(&["config"], home.path(), None);
    assert_eq!(json(&stdout)["keyBinding"], Value::Array(Vec::new()));
}

#[test]
fn use_system_gpg_toggles_config() {
    let home = Home::empty();
    let (code, stdout, stderr) = run_cli(&["use-system-gpg", "on"], home.path(), None);
    assert_eq!(code, 0, "stderr: {stderr}");
    assert_eq!(json(&stdout)["useSystemGPG"], true);

    let (_, stdout, _) = run_cli(&["use-system-gpg", "off"], home.path(), None);
    assert_eq!(json(&stdout)["useSystemGPG"], false);
}

#[test]
fn corrupt_config_is_reported() {
    let home = Home::empty();
    std::fs::write(home.path().join("config.json"), b"{not json").expect("write config");
    let (code, _, stderr) = run_cli(&["config"], home.path(), None);
    assert_ne!(code, 0);
    assert!(stderr.contains("config.json"), "unexpected stderr: {stderr}");
}

#[test]
fn corrupt_config_does_not_block_key_listing() {
    let home = Home::new();
    let config = home.path().join("config.json");
    std::fs::write(&config, b"{not json").expect("write config");

    let (code, stdout, stderr) = run_cli(&["list-keys"], home.path(), None);
    assert_eq!(code, 0, "stderr: {stderr}");
    assert_eq!(json(&stdout).as_array().map(Vec::len), Some(2));
    assert!(stderr.contains("config.json"), "unexpected stderr: {stderr}");
    assert_eq!(std::fs::read(&config).expect("read config"), b"{not json");
}
