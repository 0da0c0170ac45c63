//! tcp-throughput: chunked TCP bulk-transfer throughput harness
//!
//! Two roles share one binary:
//! - `send`: connect, push a payload as fixed-size acknowledged units, close
//! - `receive`: accept connections and report throughput per transfer
//!
//! Features:
//! - Await or callback acknowledgment strategies with per-unit timeouts
//! - Threshold, end-of-stream and sentinel completion detection
//! - Raw or CRLF line framing
//! - Configuration via CLI arguments or TOML file

mod ack;
mod client;
mod config;
mod detector;
mod error;
mod framing;
mod handler;
mod receiver;
mod registry;
mod server;
mod session;
mod socket;
mod stats;
mod transport;
mod writer;

use config::{Config, Mode};
use server::Server;
use std::thread;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let workers = config.workers.unwrap_or_else(num_cpus);
    info!(
        mode = ?config.mode,
        address = %config.address(),
        expected_total_bytes = config.expected_total_bytes,
        unit_size = config.unit_size.get(),
        ack_mode = ?config.ack_mode,
        framing = ?config.framing,
        workers,
        "Starting tcp-throughput"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()?;

    match config.mode {
        Mode::Send => runtime.block_on(run_sender(config)),
        Mode::Receive => runtime.block_on(run_receiver(config)),
    }
}

/// Push one payload to the receiver
async fn run_sender(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    match client::run(&config).await {
        Ok(summary) => {
            info!(
                bytes = summary.bytes_written,
                units = summary.units_written,
                "Send finished"
            );
            Ok(())
        }
        Err(e) => {
            if e.is_write_error() {
                error!(error = %e, "Transfer aborted");
            }
            Err(e.into())
        }
    }
}

/// Serve transfers until interrupted
async fn run_receiver(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::bind(config).await?;
    let registry = server.registry();

    tokio::select! {
        result = server.run() => result?,
        result = tokio::signal::ctrl_c() => {
            result?;
            let registry = registry.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if registry.is_empty() {
                info!("No transfers in progress");
            }
            for (id, entry) in registry.iter() {
                let progress = entry.session.snapshot();
                info!(
                    connection = id,
                    peer = %entry.peer,
                    open_for = ?entry.opened_at.elapsed(),
                    bytes = progress.bytes_transferred,
                    units = progress.units_processed,
                    "Abandoning transfer in progress"
                );
            }
            info!(
                active = registry.len(),
                capacity = registry.capacity(),
                "Shutting down"
            );
        }
    }
    Ok(())
}

/// Get number of CPUs
fn num_cpus() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
