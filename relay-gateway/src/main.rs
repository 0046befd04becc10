// Relay Gateway - UDP bridge for the Beacon Relay core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Relay Gateway
//!
//! Field gateway process: beacons and the upstream server talk UDP to one
//! socket, and the Beacon Relay core schedules the work in between.
//!
//! ## Usage
//!
//! ```bash
//! # Defaults: bind 0.0.0.0:1700, upstream 127.0.0.1:1701
//! relay-gateway
//!
//! # Custom configuration and upstream server
//! relay-gateway --config relay.json --peer 10.0.0.5:1701 --workers 8
//! ```

mod bridge;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use beacon_relay::RelayConfig;
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use bridge::Gateway;

/// Beacon Relay field gateway
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the number of worker threads
    #[arg(short, long)]
    workers: Option<usize>,

    /// Local address to bind
    #[arg(short, long, default_value = "0.0.0.0:1700")]
    bind: SocketAddr,

    /// Upstream server address
    #[arg(short, long, default_value = "127.0.0.1:1701")]
    peer: SocketAddr,

    /// Seconds between statistics reports (0 disables them)
    #[arg(long, default_value = "30")]
    stats_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();

    // Initialize tracing
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

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Relay Gateway v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    let gateway = match Gateway::start(config, args.bind, args.peer) {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("Failed to start gateway: {}", e);
            std::process::exit(1);
        }
    };

    let flag = gateway.shutdown_flag();
    if let Err(e) = ctrlc::set_handler(move || flag.request()) {
        error!("Failed to install signal handler: {}", e);
        gateway.shutdown();
        std::process::exit(1);
    }

    let interval = Duration::from_secs(args.stats_interval);
    let mut last_report = Instant::now();
    let flag = gateway.shutdown_flag();
    while flag.is_running() {
        std::thread::sleep(Duration::from_millis(100));
        if !interval.is_zero() && last_report.elapsed() >= interval {
            report(&gateway);
            last_report = Instant::now();
        }
    }

    info!("Shutdown requested");
    gateway.shutdown();
    info!("Gateway stopped");
}

fn load_config(args: &Args) -> Result<RelayConfig, beacon_relay::ConfigError> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            RelayConfig::load_from_file(path)?
        }
        None => RelayConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    config.validate()?;
    Ok(config)
}

fn report(gateway: &Gateway) {
    let stats = gateway.relay().stats();
    info!(
        arena_outstanding = stats.arena.outstanding,
        arena_capacity = stats.arena.capacity,
        dispatched = stats.dispatch.total_dispatches(),
        reverse = stats.dispatch.reverse_dispatches,
        jobs_executed = stats.jobs_executed,
        jobs_panicked = stats.jobs_panicked,
        inbound = stats.inbound_len,
        outbound = stats.outbound_len,
        "relay statistics"
    );
    for queue in &stats.queues {
        info!(
            queue = %queue.name,
            weight = queue.weight,
            len = queue.len,
            dispatched = queue.dispatched,
            refused = queue.refused,
            "queue statistics"
        );
    }
}
