//! Proxsave - Main entry point
//!
//! Takes one configuration snapshot of the local Proxmox host.

use anyhow::{Context, Result};
use clap::Parser;
use proxsave::config::{CompressionAlgorithm, CompressionMode, Config};
use proxsave::process::Capabilities;
use proxsave::utils::{self, shutdown::ShutdownCoordinator};
use proxsave::SnapshotExecutor;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory receiving the archive (overrides config)
    #[arg(short, long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Compression algorithm
    #[arg(long, value_enum)]
    compression: Option<CompressionAlgorithm>,

    /// Compression level (derived from the mode when omitted)
    #[arg(long)]
    level: Option<i32>,

    /// Compression mode
    #[arg(long, value_enum)]
    mode: Option<CompressionMode>,

    /// Compressor threads (0 = let the compressor decide)
    #[arg(long)]
    threads: Option<u32>,

    /// age recipient public key; enables encryption (repeatable)
    #[arg(long = "recipient", value_name = "AGE_PUBKEY")]
    recipients: Vec<String>,

    /// Collect and write the manifest without creating an archive
    #[arg(long)]
    dry_run: bool,

    /// Keep the staging directory when archiving fails
    #[arg(long)]
    keep_staging: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.output_dir {
            config.output.dir = dir.clone();
        }
        if let Some(compression) = self.compression {
            config.tuning.compression = compression;
        }
        if self.level.is_some() {
            config.tuning.compression_level = self.level;
        }
        if let Some(mode) = self.mode {
            config.tuning.compression_mode = mode;
        }
        if let Some(threads) = self.threads {
            config.tuning.compression_threads = threads;
        }
        if !self.recipients.is_empty() {
            config.encryption.enabled = true;
            config.encryption.recipients = self.recipients.clone();
        }
        if self.dry_run {
            config.output.dry_run = true;
        }
        if self.keep_staging {
            config.output.keep_staging_on_failure = true;
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?
    } else {
        Config::default()
    };
    args.apply(&mut config);

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    // Before any thread exists
    utils::env::apply_path_extension();

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all();
    if config.tuning.worker_threads > 0 {
        runtime.worker_threads(config.tuning.worker_threads);
    }
    let runtime = runtime.build()?;

    runtime.block_on(async move {
        tracing::info!("Starting proxsave v{}", env!("CARGO_PKG_VERSION"));

        let shutdown_coordinator = ShutdownCoordinator::new();
        shutdown_coordinator.install();

        let executor = SnapshotExecutor::new(
            config,
            Capabilities::system(),
            shutdown_coordinator.token(),
        );
        let report = executor.execute().await?;

        match &report.archive {
            Some(archive) => {
                tracing::info!("Archive: {}", archive.path.display());
                tracing::info!("Checksum: {}", archive.checksum_path.display());
                tracing::info!("Metadata: {}", archive.metadata_path.display());
            }
            None => tracing::info!("Dry run finished, {} entries recorded", report.manifest.entries().count()),
        }
        Ok::<(), anyhow::Error>(())
    })
}
