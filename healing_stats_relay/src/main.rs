// CLI entry point for the healing stats peer relay.
//
// Loads an optional JSON config file, layers command-line flags on top,
// installs a tracing subscriber, and runs the relay until SIGINT or SIGTERM.
// Statistics are logged as JSON on a fixed interval. See `server.rs` for the
// networking architecture.
//
// Usage:
//   relay [OPTIONS]
//     --config <FILE>           JSON config (see `config.rs`)
//     --listen <HOST:PORT>      Listen address (default: 127.0.0.1:50051)
//     --cert <PEM> --key <PEM>  Serve TLS with this chain and key
//     --stats-interval <SECS>   Statistics log interval, 0 disables
//     --debug                   Debug-level logging

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::Parser;
use healing_stats_relay::{RelayConfig, RelayError, start_relay};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

static RUNNING: AtomicBool = AtomicBool::new(true);

#[derive(Debug, Parser)]
#[command(name = "relay", about = "Peer relay for healing stats combat telemetry")]
struct Args {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    listen: Option<String>,
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,
    #[arg(long)]
    stats_interval: Option<u64>,
    #[arg(long)]
    debug: bool,
}

fn main() {
    let args = Args::parse();

    let default_filter = if args.debug {
        "healing_stats_relay=debug"
    } else {
        "healing_stats_relay=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };
    let stats_interval = Duration::from_secs(config.stats_interval_secs);

    let (handle, addr) = match start_relay(config) {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "failed to start relay");
            std::process::exit(1);
        }
    };
    info!(%addr, "relay running, send SIGINT or SIGTERM to stop");

    install_signal_handlers();
    let mut last_stats = Instant::now();
    while RUNNING.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
        if !stats_interval.is_zero() && last_stats.elapsed() >= stats_interval {
            last_stats = Instant::now();
            match serde_json::to_string(&handle.statistics()) {
                Ok(json) => info!(statistics = %json, "relay statistics"),
                Err(e) => error!(error = %e, "failed to serialize statistics"),
            }
        }
    }

    info!("shutting down");
    handle.stop();
}

fn load_config(args: &Args) -> Result<RelayConfig, RelayError> {
    let mut config = match &args.config {
        Some(path) => RelayConfig::from_json_file(path)?,
        None => RelayConfig::default(),
    };
    if let Some(listen) = &args.listen {
        config.listen = listen.clone();
    }
    if let (Some(cert), Some(key)) = (&args.cert, &args.key) {
        config.certificate_chain = Some(cert.clone());
        config.private_key = Some(key.clone());
    }
    if let Some(secs) = args.stats_interval {
        config.stats_interval_secs = secs;
    }
    // Surface missing or unreadable PEM files before binding.
    config.resolve_credentials()?;
    Ok(config)
}

#[cfg(unix)]
extern "C" fn on_signal(_: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only stores to an atomic, which is
    // async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}
