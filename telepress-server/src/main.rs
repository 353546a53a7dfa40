// Telepress Server - Ingest service, HTTP export and metrics
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # telepress
//!
//! Command line front end for Telepress archives.
//!
//! ## Usage
//!
//! ```bash
//! # Compress a CSV dataset into a snapshot (appends if it exists)
//! telepress compress --csv readings.csv --store archive.tplz
//!
//! # Reconstruct one device as JSON
//! telepress decompress --store archive.tplz --device sensor-1 --from 0 --to 60000
//!
//! # Serve the archive over HTTP, optionally compressing a dataset meanwhile
//! telepress serve --store archive.tplz --port 9100 --csv readings.csv
//!
//! # Per-device statistics
//! telepress stats --store archive.tplz
//! ```

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use telepress::{export_json, CodecConfig, ConfigSet, Decompressor, DeviceId, MemoryStore};
use telepress_server::http::{router, RangeQuery};
use telepress_server::{read_csv, summarize, ServerError, Service, ServiceConfig};
use tokio::net::TcpListener;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

/// Telepress archive tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compress a CSV dataset into a snapshot
    Compress {
        /// CSV file (`device_id,timestamp,value` or `timestamp_ms,<devices>`)
        #[arg(long)]
        csv: PathBuf,
        /// Snapshot file, created if missing
        #[arg(long)]
        store: PathBuf,
        #[command(flatten)]
        codec: CodecArgs,
    },
    /// Reconstruct a device's samples as JSON
    Decompress {
        #[arg(long)]
        store: PathBuf,
        #[arg(long)]
        device: String,
        /// Start of the range (ms, inclusive)
        #[arg(long)]
        from: Option<u64>,
        /// End of the range (ms, inclusive)
        #[arg(long)]
        to: Option<u64>,
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Serve reconstructed samples and metrics over HTTP
    Serve {
        #[arg(long)]
        store: PathBuf,
        /// Port to listen on
        #[arg(short, long, default_value = "9100")]
        port: u16,
        /// CSV dataset to compress while serving
        #[arg(long)]
        csv: Option<PathBuf>,
        #[command(flatten)]
        codec: CodecArgs,
    },
    /// Print per-device statistics of a snapshot
    Stats {
        #[arg(long)]
        store: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct CodecArgs {
    /// JSON configuration (global settings plus per-device overrides)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Window length, overrides the global setting
    #[arg(long)]
    window: Option<usize>,
    /// Dictionary capacity, overrides the global setting
    #[arg(long)]
    capacity: Option<usize>,
}

impl CodecArgs {
    fn load(&self) -> Result<ConfigSet, ServerError> {
        let mut configs = match &self.config {
            Some(path) => ConfigSet::from_json(&std::fs::read_to_string(path)?)?,
            None => ConfigSet::new(CodecConfig::default()),
        };
        if let Some(window) = self.window {
            configs.global.window_len = window;
        }
        if let Some(capacity) = self.capacity {
            configs.global.capacity = capacity;
        }
        configs.validate()?;
        Ok(configs)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize tracing on stderr, stdout carries exported data
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        EnvFilter::from_default_env().add_directive(level.into())
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    match run(args.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command) -> Result<(), ServerError> {
    match command {
        Command::Compress { csv, store, codec } => compress(&csv, &store, codec.load()?).await,
        Command::Decompress {
            store,
            device,
            from,
            to,
            output,
        } => decompress(&store, device, RangeQuery { from, to }, output.as_deref()),
        Command::Serve {
            store,
            port,
            csv,
            codec,
        } => serve(&store, port, csv, codec.load()?).await,
        Command::Stats { store } => stats(&store),
    }
}

fn open_store(path: &Path) -> Result<MemoryStore, ServerError> {
    if path.exists() {
        let store = MemoryStore::load_snapshot(path)?;
        info!(
            "Loaded {}: {} templates, {} records",
            path.display(),
            store.template_count(),
            store.record_count()
        );
        Ok(store)
    } else {
        info!("{} not found, starting an empty archive", path.display());
        Ok(MemoryStore::new())
    }
}

async fn compress(csv: &Path, path: &Path, configs: ConfigSet) -> Result<(), ServerError> {
    let dataset = read_csv(csv)?;
    let store = Arc::new(open_store(path)?);

    let mut service = Service::start(Arc::clone(&store), configs, ServiceConfig::default())?;
    service.ingest_all(dataset.samples).await?;
    let report = service.shutdown().await?;

    store.save_snapshot(path)?;
    info!("Saved {}", path.display());
    println!("{}", report.metrics.report());
    Ok(())
}

fn decompress(
    path: &Path,
    device: String,
    range: RangeQuery,
    output: Option<&Path>,
) -> Result<(), ServerError> {
    let range = range.span().map_err(|reason| ServerError::InvalidFormat {
        line: 0,
        reason,
    })?;
    let store = MemoryStore::load_snapshot(path)?;
    let samples = Decompressor::new(&store).reconstruct(&DeviceId::new(device), range)?;

    let count = match output {
        Some(file) => {
            let mut writer = BufWriter::new(File::create(file)?);
            let count = export_json(samples, &mut writer)?;
            writer.flush()?;
            count
        }
        None => {
            let stdout = io::stdout();
            let mut writer = BufWriter::new(stdout.lock());
            let count = export_json(samples, &mut writer)?;
            writeln!(writer)?;
            count
        }
    };
    info!("Exported {} samples", count);
    Ok(())
}

async fn serve(
    path: &Path,
    port: u16,
    csv: Option<PathBuf>,
    configs: ConfigSet,
) -> Result<(), ServerError> {
    let store = Arc::new(open_store(path)?);

    // Compress the dataset in the background while serving
    let ingest = csv.map(|csv| {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            let dataset = read_csv(&csv)?;
            let mut service = Service::start(store, configs, ServiceConfig::default())?;
            service.ingest_all(dataset.samples).await?;
            service.shutdown().await
        })
    });

    let app = router(Arc::clone(&store));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting server on http://{}", addr);
    info!("Metrics endpoint: http://{}/metrics", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(task) = ingest {
        let report = task.await??;
        info!(
            "Compressed {} samples from {} devices",
            report.metrics.samples,
            report.per_device.len()
        );
    }
    store.save_snapshot(path)?;
    info!("Saved {}", path.display());
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down");
}

fn stats(path: &Path) -> Result<(), ServerError> {
    let store = MemoryStore::load_snapshot(path)?;
    let summaries = summarize(&store)?;

    println!(
        "{:<24} {:>8} {:>10} {:>10} {:>8} {:>8} {:>8}",
        "device", "records", "samples", "templates", "matched", "ratio", "tau"
    );
    for s in &summaries {
        println!(
            "{:<24} {:>8} {:>10} {:>6}/{:<3} {:>7.1}% {:>7.2}x {:>8}",
            s.device_id.as_str(),
            s.records,
            s.samples,
            s.active_templates,
            s.templates,
            s.match_rate() * 100.0,
            s.compression_ratio(),
            s.threshold
                .map(|t| format!("{:.4}", t))
                .unwrap_or_else(|| "-".to_string())
        );
    }
    println!("{} devices", summaries.len());
    Ok(())
}
