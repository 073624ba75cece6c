use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use mizan_core::crypto;
use mizan_core::engine::HawlEngine;
use mizan_core::nisab::MetalPriceSource;
use mizan_core::store::Store;
use mizan_core::vault::Vault;
use tokio::signal;
use tracing::info;

use mizan_service::config::{self, ServiceConfig};
use mizan_service::{job, prices};

const SALT_FILE: &str = "vault.salt";
const CHECK_FILE: &str = "vault.check";
const CONFIG_FILE: &str = "config.json";
const DB_FILE: &str = "mizan.db";
const CHECK_AAD: &[u8] = b"mizan-check-v1";
const CHECK_MARKER: &[u8] = b"mizan-vault-check";

#[derive(Parser, Debug)]
#[command(author, version, about = "Mizan reconciliation service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize the database and the vault key material
    Init {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Run the hourly reconciliation service
    Run {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Run a single reconciliation sweep and print the summary
    Sweep {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Init { data_dir } => init_command(data_dir).await,
        Commands::Run { data_dir } => run_command(data_dir).await,
        Commands::Sweep { data_dir } => sweep_command(data_dir).await,
    }
}

fn default_data_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("com", "Mizan", "mizan")
        .ok_or_else(|| anyhow!("cannot determine a data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

fn resolve_data_dir(data_dir_override: Option<PathBuf>) -> Result<PathBuf> {
    match data_dir_override {
        Some(dir) => Ok(dir),
        None => default_data_dir(),
    }
}

async fn init_command(data_dir_override: Option<PathBuf>) -> Result<()> {
    let data = resolve_data_dir(data_dir_override)?;
    std::fs::create_dir_all(&data)?;
    let salt_path = data.join(SALT_FILE);
    if salt_path.exists() {
        bail!("already initialised at {}", data.display());
    }

    let password = prompt_password_twice("Create service password")?;
    let salt = crypto::generate_salt();
    std::fs::write(&salt_path, hex::encode(salt))?;

    // known marker, so a wrong password fails fast at startup instead
    // of as a decrypt error mid-sweep
    let key = crypto::derive_key(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("derive key: {e}"))?;
    let check = crypto::encrypt(&key, CHECK_MARKER, CHECK_AAD)
        .map_err(|e| anyhow!("write check value: {e}"))?;
    std::fs::write(data.join(CHECK_FILE), hex::encode(check))?;

    let vault = Vault::new();
    vault.unlock_with_key(*key).await;
    Store::open(&data.join(DB_FILE), vault).await?;

    let config_path = data.join(CONFIG_FILE);
    if !config_path.exists() {
        config::save(&config_path, &ServiceConfig::default())?;
    }

    println!("Initialised data directory: {}", data.display());
    Ok(())
}

async fn open_unlocked_store(data: &Path) -> Result<(Store, ServiceConfig)> {
    let salt_path = data.join(SALT_FILE);
    if !salt_path.exists() {
        bail!("not initialised; run init first");
    }
    let salt = hex::decode(std::fs::read_to_string(&salt_path)?.trim())?;

    let password = prompt_password_once("Enter service password")?;
    let key = crypto::derive_key(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("derive key: {e}"))?;

    let check = hex::decode(std::fs::read_to_string(data.join(CHECK_FILE))?.trim())?;
    crypto::decrypt(&key, &check, CHECK_AAD).map_err(|_| anyhow!("wrong password"))?;

    let vault = Vault::new();
    vault.unlock_with_key(*key).await;
    let store = Store::open(&data.join(DB_FILE), vault).await?;
    let config = config::load_or_default(&data.join(CONFIG_FILE))?;
    Ok((store, config))
}

async fn run_command(data_dir_override: Option<PathBuf>) -> Result<()> {
    let data = resolve_data_dir(data_dir_override)?;
    let (store, config) = open_unlocked_store(&data).await?;

    let prices: Arc<dyn MetalPriceSource> = prices::build_price_source(&config.price);
    let engine = Arc::new(HawlEngine::new(store, prices));

    let (handle, loop_handle) = job::spawn_sweep_loop(engine, config.sweep.clone());
    info!(data_dir = %data.display(), "mizan service running, ctrl-c to stop");

    signal::ctrl_c().await?;
    loop_handle.shutdown_tx.send(true).ok();
    handle.await.ok();
    Ok(())
}

async fn sweep_command(data_dir_override: Option<PathBuf>) -> Result<()> {
    let data = resolve_data_dir(data_dir_override)?;
    let (store, config) = open_unlocked_store(&data).await?;

    let prices: Arc<dyn MetalPriceSource> = prices::build_price_source(&config.price);
    let engine = HawlEngine::new(store, prices);

    match job::run_sweep_with_retry(&engine, &config.sweep).await {
        Some(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        None => bail!("sweep failed after {} attempts", config.sweep.max_attempts),
    }
}

fn prompt_password_once(prompt: &str) -> Result<String> {
    let password = rpassword::prompt_password(format!("{prompt}: "))?;
    if password.is_empty() {
        bail!("password must not be empty");
    }
    Ok(password)
}

fn prompt_password_twice(prompt: &str) -> Result<String> {
    let first = prompt_password_once(prompt)?;
    let second = rpassword::prompt_password("Repeat password: ")?;
    if first != second {
        bail!("passwords do not match");
    }
    Ok(first)
}
