//! Weave: WireGuard tunnel composer
//!
//! Main entry point. Initializes the global allocator, sets up logging,
//! loads the run configuration and drives one orchestrator run until
//! shutdown is requested.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use weave_vpn::{
    DefaultServices, FileIdentityStore, Orchestrator, RelayOptions, RunOptions, ScanOptions,
    SystemBackend, TunOptions,
};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Weave CLI arguments
#[derive(Parser, Debug, Clone)]
#[command(name = "weave", version, about = "WireGuard tunnel composer")]
struct Args {
    /// Config file path (toml/json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Exit surface listen address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Upstream endpoint (host:port)
    #[arg(short, long)]
    endpoint: Option<String>,

    /// License key
    #[arg(short = 'k', long = "key")]
    license: Option<String>,

    /// Identity storage directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Run the tunnel inside a second tunnel
    #[arg(long, alias = "gool")]
    double_hop: bool,

    /// Exit through the relay network
    #[arg(long)]
    relay: bool,

    /// Relay country selector
    #[arg(long)]
    country: Option<String>,

    /// Scan for a reachable endpoint
    #[arg(long)]
    scan: bool,

    /// Expose the tunnel as an OS-level interface
    #[arg(long)]
    tun: bool,

    /// Firewall mark for tunnel packets (tun mode)
    #[arg(long)]
    fwmark: Option<u32>,

    /// Log level override
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    /// Build run options from the config file and CLI overrides
    fn run_options(&self) -> Result<RunOptions> {
        let mut opts = match &self.config {
            Some(path) => RunOptions::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => RunOptions::default(),
        };

        if let Some(bind) = self.bind {
            opts.bind = bind;
        }
        if let Some(endpoint) = &self.endpoint {
            opts.endpoint = endpoint.clone();
        }
        if let Some(license) = &self.license {
            opts.license = license.clone();
        }
        if let Some(dir) = &self.cache_dir {
            opts.storage_dir = dir.clone();
        }
        if self.double_hop {
            opts.double_hop = true;
        }
        if self.relay || self.country.is_some() {
            let relay = opts.relay.get_or_insert_with(|| RelayOptions::new(""));
            if let Some(country) = &self.country {
                relay.country = country.clone();
            }
        }
        if self.scan && opts.scan.is_none() {
            opts.scan = Some(ScanOptions::default());
        }
        if self.tun || self.fwmark.is_some() {
            let tun = opts.tun.get_or_insert_with(TunOptions::default);
            if let Some(fwmark) = self.fwmark {
                tun.fwmark = fwmark;
            }
        }

        Ok(opts)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref());

    let opts = args.run_options()?;
    info!("weave starting...");
    info!("Using mimalloc allocator");

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal_handler().await;
        info!("shutdown signal received");
        shutdown_signal.cancel();
    });

    let tracker = TaskTracker::new();
    let services = DefaultServices::new(opts.verify_timeout(), opts.relay.as_ref(), tracker.clone());
    let orchestrator = Orchestrator::new(SystemBackend::new(tracker.clone()), Arc::new(services))
        .with_identities(Arc::new(FileIdentityStore::new(opts.peer.clone())))
        .with_tracker(tracker);

    let serving = match orchestrator.run(&shutdown, &opts).await {
        Ok(serving) => serving,
        Err(e) => {
            // Release whatever the failed run had already brought up
            orchestrator.shutdown(&shutdown).await;
            return Err(e.into());
        }
    };
    info!(%serving, "ready");

    shutdown.cancelled().await;

    info!("weave shutting down");
    orchestrator.shutdown(&shutdown).await;
    Ok(())
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

async fn shutdown_signal_handler() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_config() {
        let args = Args::parse_from(["weave"]);
        let opts = args.run_options().unwrap();

        assert_eq!(opts, RunOptions::default());
    }

    #[test]
    fn test_overrides() {
        let args = Args::parse_from([
            "weave",
            "--bind",
            "0.0.0.0:9000",
            "-k",
            "abc",
            "--gool",
            "--scan",
            "--fwmark",
            "4981",
        ]);
        let opts = args.run_options().unwrap();

        assert_eq!(opts.bind, "0.0.0.0:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(opts.license, "abc");
        assert!(opts.double_hop);
        assert!(opts.scan.is_some());
        assert_eq!(opts.tun, Some(TunOptions { fwmark: 4981 }));
    }

    #[test]
    fn test_country_implies_relay() {
        let args = Args::parse_from(["weave", "--country", "NL"]);
        let opts = args.run_options().unwrap();

        assert_eq!(opts.relay.map(|r| r.country), Some("NL".to_string()));
    }

    #[test]
    fn test_relay_without_country_left_for_validation() {
        let args = Args::parse_from(["weave", "--relay"]);
        let opts = args.run_options().unwrap();

        let err = weave_vpn::Mode::from_options(&opts).unwrap_err();
        assert_eq!(err, weave_vpn::ConfigError::MissingRelayCountry);
    }
}
