// beamdrop: desktop CLI for the Beamdrop transfer core
//
// Cross-platform (macOS, Linux, Windows). Platform radios are not available
// here, so transfers run over the in-process loopback gateway.

mod config;
mod loopback;

use anyhow::{Context, Result};
use beamdrop_core::checksum::ChecksumService;
use beamdrop_core::store::{SledStorage, StorageBackend};
use beamdrop_core::transfer::TransferStatus;
use beamdrop_core::transport::LocalGateway;
use beamdrop_core::CoreContext;
use clap::{Parser, Subcommand};
use colored::*;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "beamdrop")]
#[command(about = "Beamdrop: encrypted, resumable nearby file transfer", long_about = None)]
#[command(version)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the SHA-256 of files
    Checksum {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Check a file against an expected SHA-256
    Verify { file: PathBuf, checksum: String },
    /// Send files to an in-process receiver and verify them end to end
    Send {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Where the receiver writes (default: configured download dir)
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// LZ4-compress chunks that shrink
        #[arg(short, long)]
        compress: bool,
        /// Skip the secure session and send plaintext chunks
        #[arg(long)]
        plaintext: bool,
    },
    /// Inspect persisted transfers
    Transfers {
        #[command(subcommand)]
        action: Option<TransferAction>,
    },
    /// List stored connection records
    Connections,
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum TransferAction {
    List,
    /// Checksum report for one transfer
    Report { transfer_id: String },
    /// Drop expired transfers, checksum rows and idle rate-limit state
    Purge,
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    /// Print the config file location
    Path,
}

/// Logs go to stderr, plus a daily file when `log_dir` is set
fn init_logging(log_json: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let Some(dir) = log_dir else {
        if log_json {
            tracing_subscriber::fmt().json().with_env_filter(filter()).init();
        } else {
            tracing_subscriber::fmt().with_env_filter(filter()).init();
        }
        return None;
    };

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "beamdrop.log"));
    if log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter())
            .with_writer(writer)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_ansi(false)
            .with_writer(writer)
            .init();
    }
    Some(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;

    let log_dir = if config.log_to_file {
        let dir = config::Config::data_dir()?.join("logs");
        std::fs::create_dir_all(&dir).context("Failed to create log directory")?;
        Some(dir)
    } else {
        None
    };
    let _log_guard = init_logging(cli.log_json, log_dir.as_deref());

    match cli.command {
        Commands::Checksum { files } => cmd_checksum(&config, files).await,
        Commands::Verify { file, checksum } => cmd_verify(&config, file, checksum).await,
        Commands::Send {
            files,
            out,
            compress,
            plaintext,
        } => cmd_send(&config, files, out, compress, !plaintext).await,
        Commands::Transfers { action } => {
            cmd_transfers(&config, action.unwrap_or(TransferAction::List)).await
        }
        Commands::Connections => cmd_connections(&config),
        Commands::Config { action } => cmd_config(config, action),
    }
}

/// Core wired to the on-disk store
fn open_core(config: &config::Config) -> Result<CoreContext> {
    let data_dir = config::Config::data_dir()?;
    let backend: Arc<dyn StorageBackend> =
        Arc::new(SledStorage::open(data_dir.join("db")).context("Failed to open data store")?);
    let key = config::storage_key(&data_dir)?;
    Ok(CoreContext::new(
        config.core_config(),
        Arc::new(LocalGateway::new()),
        backend,
        key,
    ))
}

fn checksum_service(config: &config::Config) -> ChecksumService {
    ChecksumService::new(
        Arc::new(beamdrop_core::store::MemoryStorage::new()),
        config.core.checksum.clone(),
    )
}

async fn cmd_checksum(config: &config::Config, files: Vec<PathBuf>) -> Result<()> {
    let service = checksum_service(config);
    for file in files {
        let digest = service
            .calculate_checksum(&file)
            .await
            .with_context(|| format!("Failed to hash {}", file.display()))?;
        println!("{}  {}", digest.bright_yellow(), file.display());
    }
    Ok(())
}

async fn cmd_verify(config: &config::Config, file: PathBuf, expected: String) -> Result<()> {
    if checksum_service(config).verify_checksum(&file, &expected).await {
        println!("{} {} matches", "✓".green(), file.display());
        Ok(())
    } else {
        anyhow::bail!("{} does not match {}", file.display(), expected)
    }
}

async fn cmd_send(
    config: &config::Config,
    files: Vec<PathBuf>,
    out: Option<PathBuf>,
    compress: bool,
    encrypt: bool,
) -> Result<()> {
    let out_dir = match out {
        Some(dir) => dir,
        None => config.download_dir()?,
    };
    let data_dir = config::Config::data_dir()?;
    let backend: Arc<dyn StorageBackend> =
        Arc::new(SledStorage::open(data_dir.join("db")).context("Failed to open data store")?);
    let key = config::storage_key(&data_dir)?;

    println!("{}", "Sending over loopback...".bold());
    if !encrypt {
        println!("  {}", "Plaintext chunks: no secure session".bright_red());
    }

    let options = loopback::LoopbackOptions {
        files,
        out_dir: out_dir.clone(),
        encrypt,
        compress,
    };
    let summary = loopback::run(&config.core_config(), options, backend, key, |p| {
        print!(
            "\r  {:>5.1}%  {:>10} / {:<10} {:>8.1} KiB/s  {}",
            p.progress,
            p.bytes_transferred,
            p.total_bytes,
            p.speed / 1024.0,
            p.file_name
        );
        let _ = std::io::stdout().flush();
    })
    .await?;
    println!();
    println!();

    let status = format!("{:?}", summary.status);
    let status = if summary.status == TransferStatus::Completed {
        status.green()
    } else {
        status.red()
    };
    println!("{}", "Transfer Summary".bold());
    println!("  ID:       {}", summary.transfer_id.bright_cyan());
    println!("  Status:   {}", status);
    println!("  Bytes:    {}", summary.bytes);
    println!("  Time:     {:.2}s", summary.elapsed_secs);
    println!("  Verified: {}/{}", summary.files_verified, summary.files_total);
    println!("  Saved to: {}", out_dir.display().to_string().bright_cyan());

    if summary.status != TransferStatus::Completed {
        anyhow::bail!("Transfer finished as {:?}", summary.status);
    }
    Ok(())
}

async fn cmd_transfers(config: &config::Config, action: TransferAction) -> Result<()> {
    let ctx = open_core(config)?;

    match action {
        TransferAction::List => {
            let transfers = ctx.transfers.list_transfers();
            if transfers.is_empty() {
                println!("{}", "No transfers recorded.".dimmed());
                return Ok(());
            }
            println!("{} ({} total)", "Transfers".bold(), transfers.len());
            println!();
            for transfer in transfers {
                println!(
                    "  {} {}  {:?}  {:.1}%",
                    "•".bright_green(),
                    transfer.id.bright_cyan(),
                    transfer.status,
                    transfer.progress_percent()
                );
                println!(
                    "    to {}  {} file(s), {} bytes",
                    transfer.target_device_id.dimmed(),
                    transfer.files.len(),
                    transfer.total_bytes
                );
            }
        }

        TransferAction::Report { transfer_id } => {
            let report = ctx
                .checksums
                .generate_checksum_report(&transfer_id)
                .await
                .with_context(|| format!("No checksum records for {}", transfer_id))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        TransferAction::Purge => {
            let report = ctx.maintenance();
            println!("{} Purged:", "✓".green());
            println!("  Transfers:        {}", report.transfers);
            println!("  Checksum records: {}", report.checksums);
            println!("  Rate-limit keys:  {}", report.rate_limit_keys);
        }
    }

    Ok(())
}

fn cmd_connections(config: &config::Config) -> Result<()> {
    let ctx = open_core(config)?;
    let connections = ctx.registry.all_connections();
    if connections.is_empty() {
        println!("{}", "No connection records.".dimmed());
        return Ok(());
    }
    println!("{} ({} total)", "Connections".bold(), connections.len());
    for info in connections {
        let method = info
            .transport_kind
            .map(|k| k.to_string())
            .unwrap_or_else(|| "?".to_string());
        let flag = if info.is_invalid() {
            "invalid".red()
        } else if info.is_connected {
            "connected".green()
        } else {
            "known".normal()
        };
        println!("  {} {}  {}  {}", "•".bright_green(), info.device_id.bright_cyan(), method, flag);
    }
    Ok(())
}

fn cmd_config(mut config: config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<20} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }
    }

    Ok(())
}
