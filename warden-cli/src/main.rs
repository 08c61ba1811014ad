//! warden: run a sandboxed plugin under the host.
//!
//! Usage:
//!   warden run notes.plugin --id notes --grant storage
//!   warden --config host.toml export notes > notes.json
//!   warden --config host.toml import notes notes.json
//!
//! Storage keys are derived from `WARDEN_STORAGE_PASSWORD` when it is
//! set; otherwise each run uses throwaway keys.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use warden_plugin_host::{
    Capability, ConsentProvider, HostConfig, PermissionRequest, PluginHostManager, PluginId,
    PluginManifest, RuntimeKind, StaticConsent,
};
use warden_storage::{KeySource, NamespaceSnapshot, StorageEngine, open_backend};

const PASSWORD_ENV: &str = "WARDEN_STORAGE_PASSWORD";

#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(about = "Sandboxed plugin host")]
struct Args {
    /// Host configuration file
    #[arg(short, long, default_value = "host.toml", global = true)]
    config: PathBuf,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load a plugin file and execute it once
    Run {
        /// Plugin source (script, or WAT for wasm)
        file: PathBuf,

        /// Plugin id; defaults to the file stem
        #[arg(long)]
        id: Option<String>,

        /// Isolation runtime; a .wat extension selects wasm
        #[arg(long)]
        runtime: Option<RuntimeKind>,

        /// Capability granted before execution (repeatable)
        #[arg(long = "grant")]
        grants: Vec<Capability>,

        /// Grant every permission request without asking
        #[arg(short, long)]
        yes: bool,
    },
    /// Print a plugin's storage namespace snapshot as JSON
    Export {
        plugin_id: String,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Replace a plugin's storage namespace with a snapshot
    Import { plugin_id: String, snapshot: PathBuf },
}

/// Asks on the terminal. Anything but `y`/`yes` is a denial.
struct TerminalConsent {
    stdin: Mutex<BufReader<tokio::io::Stdin>>,
}

impl TerminalConsent {
    fn new() -> Self {
        Self {
            stdin: Mutex::new(BufReader::new(tokio::io::stdin())),
        }
    }
}

#[async_trait]
impl ConsentProvider for TerminalConsent {
    async fn decide(&self, request: &PermissionRequest) -> Result<bool> {
        // One prompt on screen at a time.
        let mut stdin = self.stdin.lock().await;
        let reason = if request.reason.is_empty() {
            "no reason given"
        } else {
            request.reason.as_str()
        };
        let prompt = format!(
            "\nPlugin '{}' requests the '{}' capability: {}\nAllow? [y/N] ",
            request.plugin_id, request.capability, reason
        );
        let mut stderr = tokio::io::stderr();
        stderr.write_all(prompt.as_bytes()).await?;
        stderr.flush().await?;

        let mut answer = String::new();
        if stdin.read_line(&mut answer).await? == 0 {
            bail!("stdin closed");
        }
        Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let config = HostConfig::load_from(&args.config);
    match args.command {
        Command::Run {
            file,
            id,
            runtime,
            grants,
            yes,
        } => run(config, &file, id, runtime, grants, yes).await,
        Command::Export { plugin_id, output } => export(config, &plugin_id, output.as_deref()),
        Command::Import {
            plugin_id,
            snapshot,
        } => import(config, &plugin_id, &snapshot),
    }
}

fn key_source() -> KeySource {
    match std::env::var(PASSWORD_ENV) {
        Ok(password) if !password.is_empty() => KeySource::Password(password),
        _ => KeySource::Ephemeral,
    }
}

/// Picks the runtime from the file extension. Binary `.wasm` modules are
/// refused: plugin sources travel as text.
fn infer_runtime(file: &Path) -> Result<RuntimeKind> {
    match file.extension().and_then(|e| e.to_str()) {
        Some("wat") => Ok(RuntimeKind::Wasm),
        Some("wasm") => bail!(
            "{} is a binary wasm module; convert it to WAT text (e.g. wasm-tools print)",
            file.display()
        ),
        _ => Ok(RuntimeKind::Script),
    }
}

fn password_engine(config: &HostConfig) -> Result<StorageEngine> {
    let KeySource::Password(password) = key_source() else {
        bail!("{PASSWORD_ENV} must be set to read or write persisted namespaces");
    };
    let backend = open_backend(&config.storage).context("failed to open storage backend")?;
    Ok(StorageEngine::new(
        backend,
        config.storage.clone(),
        KeySource::Password(password),
    ))
}

async fn run(
    config: HostConfig,
    file: &Path,
    id: Option<String>,
    runtime: Option<RuntimeKind>,
    grants: Vec<Capability>,
    yes: bool,
) -> Result<()> {
    let runtime = match runtime {
        Some(runtime) => runtime,
        None => infer_runtime(file)?,
    };
    let bytes = std::fs::read(file)
        .with_context(|| format!("failed to read plugin source {}", file.display()))?;
    let source = String::from_utf8(bytes).with_context(|| {
        format!(
            "plugin source {} is not UTF-8 text (wasm guests are loaded as WAT)",
            file.display()
        )
    })?;
    let id = match id {
        Some(id) => id,
        None => file
            .file_stem()
            .and_then(|s| s.to_str())
            .context("cannot derive a plugin id from the file name; pass --id")?
            .to_string(),
    };
    let plugin_id = PluginId::new(id).context("invalid plugin id")?;

    let key_source = key_source();
    if matches!(key_source, KeySource::Ephemeral) {
        warn!("{PASSWORD_ENV} not set; plugin storage will not be readable after this run");
    }
    let consent: Arc<dyn ConsentProvider> = if yes {
        Arc::new(StaticConsent::grant_all())
    } else {
        Arc::new(TerminalConsent::new())
    };

    let manager = PluginHostManager::open(config, key_source, consent)
        .context("failed to start plugin host")?;
    let sweeper = manager.spawn_sweeper();

    let manifest = PluginManifest::new(plugin_id.clone(), runtime, source).with_permissions(grants);
    manager.load(manifest)?;
    info!(plugin_id = %plugin_id, %runtime, "Executing plugin");
    let outcome = manager.execute(&plugin_id).await;

    manager.shutdown().await;
    sweeper.shutdown();

    let value = outcome.with_context(|| format!("plugin '{plugin_id}' failed"))?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn export(config: HostConfig, plugin_id: &str, output: Option<&Path>) -> Result<()> {
    let plugin_id = PluginId::new(plugin_id).context("invalid plugin id")?;
    let engine = password_engine(&config)?;
    let snapshot = engine
        .export_namespace(&plugin_id)
        .with_context(|| format!("failed to export namespace '{plugin_id}'"))?;
    let json = snapshot.to_json()?;
    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(plugin_id = %plugin_id, keys = snapshot.key_count(), "Exported namespace to {:?}", path);
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn import(config: HostConfig, plugin_id: &str, snapshot_path: &Path) -> Result<()> {
    let plugin_id = PluginId::new(plugin_id).context("invalid plugin id")?;
    let json = std::fs::read_to_string(snapshot_path)
        .with_context(|| format!("failed to read {}", snapshot_path.display()))?;
    let snapshot = NamespaceSnapshot::from_json(&json).context("malformed snapshot")?;
    let keys = snapshot.key_count();

    let engine = password_engine(&config)?;
    engine
        .import_namespace(&plugin_id, snapshot)
        .with_context(|| format!("failed to import namespace '{plugin_id}'"))?;
    info!(plugin_id = %plugin_id, keys, "Imported namespace");
    Ok(())
}
