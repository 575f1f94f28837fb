use anyhow::{Context, Result, anyhow};
use chatpgp_core::config::{config_path, keychain_dir, resolve_home};
use chatpgp_core::{
    ConfigStore, DecryptResult, JsonConfigStore, KeyBinding, KeyId, KeyInfo, Keychain,
    KeychainOptions, PluginConfig, display_user_id,
};
use chatpgp_pgp::{BackendChoice, BackendOptions, GpgConfig, PinentryMode, build_backend};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "CHATPGP_LOG";
const MAX_INPUT_ENV: &str = "CHATPGP_MAX_INPUT_BYTES";

#[derive(Parser, Debug)]
#[command(
    name = "chatpgp",
    version,
    about = "PGP keychain and key bindings for encrypted chat"
)]
struct Cli {
    /// Data directory holding `config.json` and the `keychain/` folder.
    #[arg(long, global = true, env = "CHATPGP_HOME")]
    home: Option<PathBuf>,

    /// Overrides the persisted `useSystemGPG` choice.
    #[arg(long, global = true, value_enum)]
    backend: Option<BackendArg>,

    #[arg(long = "gpg-path", global = true, default_value = "gpg")]
    gpg_path: String,

    #[arg(long = "gpg-homedir", global = true)]
    gpg_homedir: Option<String>,

    #[arg(long = "passphrase-file", global = true)]
    passphrase_file: Option<String>,

    /// Native backend: also read keys exported from the GnuPG keyring.
    #[arg(long = "import-gnupg", global = true)]
    import_gnupg: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum BackendArg {
    Native,
    Gpg,
}

impl From<BackendArg> for BackendChoice {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Native => BackendChoice::Native,
            BackendArg::Gpg => BackendChoice::Gpg,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Toggle {
    On,
    Off,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(alias = "ls")]
    ListKeys {
        #[arg(long, conflicts_with = "public")]
        secret: bool,
        #[arg(long, conflicts_with = "secret")]
        public: bool,
    },
    UserIds {
        key_id: String,
    },
    Config,
    SetSigningKey {
        key_id: String,
    },
    SigningKey,
    /// Replaces every binding with the given `IDENTITY=KEYID` pairs.
    Bind {
        #[arg(value_name = "IDENTITY=KEYID", value_parser = parse_binding)]
        bindings: Vec<KeyBinding>,
    },
    Bindings {
        identity: i64,
    },
    #[command(alias = "dec")]
    Decrypt {
        #[arg(value_name = "FILE")]
        inputs: Vec<String>,
    },
    #[command(alias = "enc")]
    Encrypt {
        #[arg(short = 'r', long = "recipient", value_name = "KEYID")]
        recipients: Vec<String>,
        #[arg(long, conflicts_with = "recipients")]
        identity: Option<i64>,
        #[arg(short = 'o', long, alias = "out")]
        output: Option<String>,
        #[arg(value_name = "FILE")]
        input: Option<String>,
    },
    UseSystemGpg {
        #[arg(value_enum)]
        state: Toggle,
    },
}

impl Command {
    fn needs_keys(&self) -> bool {
        !matches!(self, Command::Config | Command::UseSystemGpg { .. })
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    let home = cli.home.clone().unwrap_or_else(resolve_home);
    let keys_dir = keychain_dir(&home);
    fs::create_dir_all(&keys_dir)
        .with_context(|| format!("create keychain folder {}", keys_dir.display()))?;
    let store = JsonConfigStore::new(config_path(&home));
    let config = store.load().unwrap_or_else(|err| {
        eprintln!("warning: {err}; continuing with default settings");
        PluginConfig::default()
    });

    let passphrase = match &cli.passphrase_file {
        Some(path) => Some(read_passphrase_file(path)?),
        None => None,
    };
    let choice = cli
        .backend
        .map(BackendChoice::from)
        .unwrap_or_else(|| BackendChoice::from_config(&config));
    let gpg = GpgConfig {
        gpg_path: cli.gpg_path.clone(),
        homedir: cli.gpg_homedir.clone(),
        pinentry_mode: if cli.passphrase_file.is_some() {
            PinentryMode::Loopback
        } else {
            PinentryMode::Default
        },
        passphrase_file: cli.passphrase_file.clone(),
        batch: cli.passphrase_file.is_some(),
        ..GpgConfig::default()
    };
    let backend = build_backend(BackendOptions {
        choice,
        gpg,
        keychain_dir: keys_dir,
        passphrase,
        import_gnupg: cli.import_gnupg,
    });
    let keychain = Keychain::new(backend, Arc::new(store), KeychainOptions::from_env()?);

    if cli.cmd.needs_keys() {
        keychain.load_keychain().await?;
    }
    run(cli.cmd, &keychain).await
}

async fn run(cmd: Command, keychain: &Keychain) -> Result<ExitCode> {
    match cmd {
        Command::ListKeys { secret, public } => {
            let mut keys: Vec<KeyInfo> = keychain.get_keychain().await;
            if secret {
                keys.retain(|key| key.private);
            } else if public {
                keys.retain(|key| !key.private);
            }
            print_json(&keys)?;
        }
        Command::UserIds { key_id } => {
            let key_id = KeyId::new(key_id);
            let uids = keychain
                .get_user_ids(&key_id)
                .await
                .ok_or_else(|| anyhow!("key not found: {key_id}"))?;
            for uid in &uids {
                println!("{}", display_user_id(uid));
            }
        }
        Command::Config => print_json(&keychain.get_config().await?)?,
        Command::SetSigningKey { key_id } => {
            let key_id = KeyId::new(key_id);
            match keychain.set_signing_key(&key_id).await? {
                Some(summary) => print_json(&summary)?,
                None => return Err(anyhow!("no private key {key_id}; signing key cleared")),
            }
        }
        Command::SigningKey => print_json(&keychain.get_signing_key().await)?,
        Command::Bind { bindings } => {
            let persisted = keychain.set_bindings(&bindings).await?;
            if persisted.len() < bindings.len() {
                eprintln!(
                    "warning: dropped {} duplicate or unknown binding(s)",
                    bindings.len() - persisted.len()
                );
            }
            print_json(&persisted)?;
        }
        Command::Bindings { identity } => print_json(&keychain.get_bindings(identity).await)?,
        Command::Decrypt { inputs } => {
            let results = decrypt_all(keychain, inputs).await?;
            if results.iter().any(|result| result.error.is_some()) {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Encrypt {
            recipients,
            identity,
            output,
            input,
        } => {
            let plaintext = InputLimit::from_env()?.read_message(input.as_deref())?;
            let armored = match identity {
                Some(identity) => keychain.encrypt_for(identity, &plaintext).await?,
                None if recipients.is_empty() => {
                    return Err(anyhow!("at least one -r/--recipient or --identity is required"));
                }
                None => {
                    let targets: Vec<KeyId> = recipients.iter().map(KeyId::new).collect();
                    keychain.encrypt(&targets, &plaintext).await?
                }
            };
            write_armored(output.as_deref(), &armored)?;
        }
        Command::UseSystemGpg { state } => {
            keychain
                .set_use_system_gpg(matches!(state, Toggle::On))
                .await?;
            print_json(&keychain.get_config().await?)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Prints one JSON result per input, in order. No inputs means stdin.
async fn decrypt_all(keychain: &Keychain, inputs: Vec<String>) -> Result<Vec<DecryptResult>> {
    let inputs: Vec<Option<String>> = if inputs.is_empty() {
        vec![None]
    } else {
        inputs.into_iter().map(Some).collect()
    };
    let limit = InputLimit::from_env()?;
    let mut results = Vec::with_capacity(inputs.len());
    for input in inputs {
        let armored = limit.read_message(input.as_deref())?;
        let result = keychain.decrypt(&armored).await;
        println!("{}", serde_json::to_string(&result)?);
        results.push(result);
    }
    Ok(results)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn parse_binding(value: &str) -> Result<KeyBinding> {
    let (identity, key_id) = value
        .split_once('=')
        .ok_or_else(|| anyhow!("binding must look like IDENTITY=KEYID, got {value:?}"))?;
    let identity: i64 = identity
        .trim()
        .parse()
        .map_err(|err| anyhow!("invalid identity {identity:?}: {err}"))?;
    let key_id = KeyId::new(key_id);
    if key_id.is_empty() {
        return Err(anyhow!("binding for {identity} has an empty key ID"));
    }
    Ok(KeyBinding::new(identity, key_id))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let mut stdout = io::stdout();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    stdout.write_all(b"\n")?;
    stdout.flush()?;
    Ok(())
}

/// Upper bound on a single message read from a file or stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InputLimit(usize);

impl InputLimit {
    const DEFAULT: Self = Self(16 * 1024 * 1024);

    fn from_env() -> Result<Self> {
        Self::parse(std::env::var(MAX_INPUT_ENV).ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Result<Self> {
        let Some(value) = value else {
            return Ok(Self::DEFAULT);
        };
        value
            .trim()
            .parse()
            .map(Self)
            .map_err(|err| anyhow!("invalid {MAX_INPUT_ENV} value {value:?}: {err}"))
    }

    fn exceeded(self) -> anyhow::Error {
        anyhow!(
            "input exceeds size limit ({} bytes); set {MAX_INPUT_ENV} to override",
            self.0
        )
    }

    /// Reads a UTF-8 message from `path`, or from stdin when it is absent or `-`.
    fn read_message(self, path: Option<&str>) -> Result<String> {
        let bytes = match path {
            None | Some("-") => self.read_stream(io::stdin().lock())?,
            Some(path) => {
                let file = fs::File::open(path).with_context(|| format!("read {path}"))?;
                self.read_stream(file)?
            }
        };
        String::from_utf8(bytes).map_err(|err| anyhow!("input must be valid UTF-8: {err}"))
    }

    /// Takes one byte past the limit so an exact fit still passes.
    fn read_stream<R: Read>(self, reader: R) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let ceiling = u64::try_from(self.0).unwrap_or(u64::MAX).saturating_add(1);
        reader.take(ceiling).read_to_end(&mut buf)?;
        if buf.len() > self.0 {
            return Err(self.exceeded());
        }
        Ok(buf)
    }
}

fn read_passphrase_file(path: &str) -> Result<String> {
    let raw = fs::read_to_string(path).with_context(|| format!("read passphrase file {path}"))?;
    Ok(raw.trim_end_matches(['\r', '\n']).to_owned())
}

/// Writes an armored message to `path`, or to stdout when none is given.
fn write_armored(path: Option<&str>, armored: &str) -> Result<()> {
    let Some(path) = path else {
        let mut stdout = io::stdout().lock();
        stdout.write_all(armored.as_bytes())?;
        stdout.flush()?;
        return Ok(());
    };
    let mut file = open_owner_only(path).with_context(|| format!("open {path}"))?;
    file.write_all(armored.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

#[cfg(unix)]
fn open_owner_only(path: &str) -> io::Result<fs::File> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // `mode` only applies when the file is created.
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    Ok(file)
}

#[cfg(not(unix))]
fn open_owner_only(path: &str) -> io::Result<fs::File> {
    fs::File::create(path)
}
