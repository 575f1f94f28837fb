use std::io::Write;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use chatpgp_core::{
    Backend, BackendKind, ChatPgpError, DecryptOutput, DecryptRequest, EncryptRequest, KeyId,
    KeyListing, Result, SignatureCheck,
};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

const STATUS_PREFIX: &str = "[GNUPG:] ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinentryMode {
    Default,
    Ask,
    Loopback,
}

impl PinentryMode {
    fn as_str(self) -> &'static str {
        match self {
            PinentryMode::Default => "default",
            PinentryMode::Ask => "ask",
            PinentryMode::Loopback => "loopback",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GpgConfig {
    pub gpg_path: String,
    pub homedir: Option<String>,
    pub pinentry_mode: PinentryMode,
    pub passphrase: Option<String>,
    pub passphrase_file: Option<String>,
    pub batch: bool,
    /// Passed as `--trust-model` when encrypting, e.g. `always` for unsigned contact keys.
    pub trust_model: Option<String>,
}

impl Default for GpgConfig {
    fn default() -> Self {
        Self {
            gpg_path: "gpg".to_string(),
            homedir: None,
            pinentry_mode: PinentryMode::Default,
            passphrase: None,
            passphrase_file: None,
            batch: false,
            trust_model: None,
        }
    }
}

/// Backend that shells out to a GnuPG binary for every operation.
#[derive(Debug, Clone)]
pub struct GpgBackend {
    config: GpgConfig,
}

impl GpgBackend {
    pub fn new(config: GpgConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GpgConfig {
        &self.config
    }

    fn build_base_args(&self) -> Result<(Vec<String>, Option<NamedTempFile>)> {
        let mut args = Vec::new();
        let mut passphrase_file = None;
        let mut pinentry_mode = self.config.pinentry_mode;
        let mut using_passphrase = false;

        if let Some(homedir) = &self.config.homedir {
            args.push("--homedir".to_string());
            args.push(homedir.clone());
        }

        if let Some(path) = &self.config.passphrase_file {
            args.push("--passphrase-file".to_string());
            args.push(path.clone());
            using_passphrase = true;
        } else if let Some(passphrase) = &self.config.passphrase {
            let mut file = NamedTempFile::new()
                .map_err(|err| ChatPgpError::Io(format!("temp file error: {err}")))?;
            file.write_all(passphrase.as_bytes())
                .map_err(|err| ChatPgpError::Io(format!("temp write error: {err}")))?;
            args.push("--passphrase-file".to_string());
            args.push(file.path().to_string_lossy().to_string());
            passphrase_file = Some(file);
            using_passphrase = true;
        }

        if using_passphrase && pinentry_mode == PinentryMode::Default {
            pinentry_mode = PinentryMode::Loopback;
        }

        if self.config.batch || using_passphrase {
            args.push("--batch".to_string());
        }

        if pinentry_mode != PinentryMode::Default {
            args.push("--pinentry-mode".to_string());
            args.push(pinentry_mode.as_str().to_string());
        }

        Ok((args, passphrase_file))
    }

    async fn run_gpg(&self, args: &[&str], input: Option<&[u8]>) -> Result<CommandOutput> {
        let (base_args, _passphrase_file) = self.build_base_args()?;
        let mut cmd = Command::new(&self.config.gpg_path);
        cmd.args(base_args)
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(gpg = %self.config.gpg_path, ?args, "running gpg");
        let mut child = cmd
            .spawn()
            .map_err(|err| ChatPgpError::backend(format!("failed to spawn gpg: {err}")))?;

        let stdin = child.stdin.take();
        let feed = async move {
            if let (Some(mut stdin), Some(bytes)) = (stdin, input) {
                stdin.write_all(bytes).await?;
                stdin.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(|err| ChatPgpError::backend(format!("gpg failed: {err}")))?;
        if let Err(err) = fed {
            // gpg may exit before reading all of its input; its status says what happened.
            debug!(%err, "gpg stdin write failed");
        }

        Ok(CommandOutput {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn output_or_error(&self, output: CommandOutput) -> Result<Vec<u8>> {
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(ChatPgpError::backend(format!(
                "gpg error: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn list_with_colons(&self, command: &str) -> Result<KeyListing> {
        let output = self
            .run_gpg(&["--with-colons", "--fixed-list-mode", command], None)
            .await?;
        let stdout = self.output_or_error(output)?;
        Ok(KeyListing::Colons(String::from_utf8_lossy(&stdout).into_owned()))
    }

    /// Exports the whole keyring as armored key blocks.
    pub async fn export_armored(&self, secret: bool) -> Result<Vec<u8>> {
        let command = if secret {
            "--export-secret-keys"
        } else {
            "--export"
        };
        let output = self.run_gpg(&["--armor", command], None).await?;
        self.output_or_error(output)
    }
}

impl Default for GpgBackend {
    fn default() -> Self {
        Self::new(GpgConfig::default())
    }
}

#[async_trait]
impl Backend for GpgBackend {
    fn name(&self) -> &'static str {
        "gpg"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::ExternalProcess
    }

    async fn list_public_keys(&self) -> Result<KeyListing> {
        self.list_with_colons("--list-keys").await
    }

    async fn list_secret_keys(&self) -> Result<KeyListing> {
        self.list_with_colons("--list-secret-keys").await
    }

    async fn decrypt(&self, req: DecryptRequest) -> Result<DecryptOutput> {
        let output = self
            .run_gpg(
                &["--status-fd", "2", "--decrypt"],
                Some(req.ciphertext.as_bytes()),
            )
            .await?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        let status = StatusReport::parse(&stderr);
        let decrypted = output.status.success() || status.decryption_okay;
        if !decrypted {
            let reason = if status.diagnostics.is_empty() {
                format!("gpg exited with {}", output.status)
            } else {
                status.diagnostics
            };
            return Err(ChatPgpError::Decryption(reason));
        }

        Ok(DecryptOutput {
            plaintext: String::from_utf8_lossy(&output.stdout).into_owned(),
            diagnostics: Some(status.diagnostics).filter(|text| !text.is_empty()),
            signatures: status.signatures,
        })
    }

    async fn encrypt(&self, req: EncryptRequest) -> Result<String> {
        let mut args = vec!["--armor", "--encrypt"];
        if let Some(model) = &self.config.trust_model {
            args.push("--trust-model");
            args.push(model);
        }
        for recipient in &req.recipients {
            args.push("--recipient");
            args.push(recipient.as_str());
        }
        if let Some(signer) = &req.signer {
            args.push("--sign");
            args.push("--local-user");
            args.push(signer.as_str());
        }
        let output = self.run_gpg(&args, Some(req.plaintext.as_bytes())).await?;
        let stdout = self.output_or_error(output)?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }
}

struct CommandOutput {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// A `--status-fd` stream interleaved with gpg's human-readable messages.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub signatures: Vec<SignatureCheck>,
    pub decryption_okay: bool,
    /// The non-status lines, joined.
    pub diagnostics: String,
}

impl StatusReport {
    pub fn parse(text: &str) -> Self {
        let mut report = StatusReport::default();
        let mut diagnostics = Vec::new();

        for line in text.lines() {
            let Some(status) = line.strip_prefix(STATUS_PREFIX) else {
                if !line.trim().is_empty() {
                    diagnostics.push(line);
                }
                continue;
            };
            let mut words = status.split_whitespace();
            let keyword = words.next().unwrap_or_default();
            let verified = match keyword {
                "GOODSIG" => true,
                "BADSIG" | "ERRSIG" | "EXPSIG" | "EXPKEYSIG" | "REVKEYSIG" => false,
                "DECRYPTION_OKAY" => {
                    report.decryption_okay = true;
                    continue;
                }
                _ => continue,
            };
            if let Some(key_id) = words.next() {
                report.signatures.push(SignatureCheck {
                    key_id: KeyId::new(key_id),
                    verified,
                });
            }
        }

        report.diagnostics = diagnostics.join("\n");
        report
    }
}
