//! `fiscal-bridge` – runs the HTTP gateway, the correlator and the device
//! worker, together or as separate processes joined by Redis.
//!
//! ```text
//! fiscal-bridge            # role from config (default: all)
//! fiscal-bridge gateway    # HTTP + correlator only
//! fiscal-bridge worker     # simulated registrars only
//! ```
//!
//! 1. Loads `~/.fiscal-bridge/config.toml`, writing a default one on first
//!    run, then applies `FISCAL_*` overrides and the role argument.
//! 2. Connects the configured transport and starts the components the role
//!    asks for.
//! 3. On Ctrl-C stops the gateway, fails outstanding calls and stops the
//!    worker, in that order.

mod config;
mod telemetry;

use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use tracing::{error, info, warn};

use fiscal_bridge::{Correlator, Worker, WorkerHandle};
use fiscal_bus::{MemoryBus, RedisBus, Transport, TransportError};
use fiscal_gateway::GatewayServer;
use fiscal_hal::SimRegistrar;

use config::{Config, Role, TransportKind};

#[tokio::main]
async fn main() -> ExitCode {
    let _telemetry = telemetry::init_tracing("fiscal-bridge");

    print_banner();
    let mut cfg = resolve_config();
    if let Some(arg) = std::env::args().nth(1) {
        match arg.parse::<Role>() {
            Ok(role) => cfg.role = role,
            Err(e) => {
                eprintln!("{}: {e}", "error".red().bold());
                eprintln!("usage: fiscal-bridge [all|gateway|worker]");
                return ExitCode::FAILURE;
            }
        }
    }
    if let Err(e) = cfg.validate() {
        error!(error = %e, "invalid configuration");
        return ExitCode::FAILURE;
    }
    print_summary(&cfg);

    let transport = match connect_transport(&cfg).await {
        Ok(transport) => transport,
        Err(e) => {
            error!(transport = %cfg.transport, error = %e, "could not connect transport");
            return ExitCode::FAILURE;
        }
    };

    match cfg.role {
        Role::Worker => run_worker(&cfg, transport).await,
        Role::All | Role::Gateway => run_gateway(&cfg, transport).await,
    }
}

fn resolve_config() -> Config {
    let path = config::config_path();
    let mut cfg = match config::load() {
        Ok(Some(cfg)) => {
            info!(path = %path.display(), "config loaded");
            cfg
        }
        Ok(None) => {
            let cfg = Config::default();
            match config::save(&cfg) {
                Ok(()) => info!(path = %path.display(), "wrote default config"),
                Err(e) => warn!(error = %e, "could not write default config"),
            }
            cfg
        }
        Err(e) => {
            warn!(error = %e, "config unusable, falling back to defaults");
            Config::default()
        }
    };
    config::apply_env_overrides(&mut cfg);
    cfg
}

async fn connect_transport(cfg: &Config) -> Result<Arc<dyn Transport>, TransportError> {
    Ok(match cfg.transport {
        TransportKind::Memory => Arc::new(MemoryBus::new(cfg.bus_capacity)),
        TransportKind::Redis => Arc::new(RedisBus::connect_with_capacity(&cfg.redis_url, cfg.bus_capacity).await?),
    })
}

async fn run_gateway(cfg: &Config, transport: Arc<dyn Transport>) -> ExitCode {
    let worker = if cfg.runs_worker() {
        match start_worker(cfg, Arc::clone(&transport)).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(error = %e, "embedded worker failed to start");
                return ExitCode::FAILURE;
            }
        }
    } else {
        if cfg.transport == TransportKind::Memory {
            warn!("embedded worker disabled on the in-process bus; every call will fail");
        }
        None
    };

    let correlator = Correlator::start(Arc::clone(&transport), cfg.correlator_config()).await;

    let result = GatewayServer::new(correlator.clone())
        .with_port(cfg.http_port)
        .with_max_timeout(cfg.max_timeout())
        .run(shutdown_signal())
        .await;

    correlator.shutdown().await;
    if let Some(worker) = worker {
        worker.shutdown().await;
    }

    match result {
        Ok(()) => {
            info!("fiscal-bridge stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "gateway terminated with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run_worker(cfg: &Config, transport: Arc<dyn Transport>) -> ExitCode {
    let worker = match start_worker(cfg, transport).await {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "worker failed to start");
            return ExitCode::FAILURE;
        }
    };
    info!(topics = ?worker.command_topics(), "worker running");

    shutdown_signal().await;
    worker.shutdown().await;
    info!("fiscal-bridge worker stopped");
    ExitCode::SUCCESS
}

async fn start_worker(cfg: &Config, transport: Arc<dyn Transport>) -> Result<WorkerHandle, TransportError> {
    let worker = cfg.devices.iter().fold(
        Worker::new(transport, cfg.addressing).with_restart_policy(cfg.restart_policy()),
        |worker, device_id| worker.with_device(device_id.clone(), SimRegistrar::new().connected().build()),
    );
    worker.start().await
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            println!();
            println!("{}", "  Ctrl-C received – shutting down …".yellow().bold());
        }
        Err(e) => {
            warn!(error = %e, "failed to listen for Ctrl-C; running until killed");
            std::future::pending::<()>().await;
        }
    }
}

fn print_banner() {
    println!();
    println!(
        "  {} {}",
        "fiscal-bridge".bold().cyan(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Cash-register command bridge");
    println!();
}

fn print_summary(cfg: &Config) {
    println!("  Role        : {}", cfg.role.to_string().bold());
    println!("  Transport   : {}", cfg.transport.to_string().bold());
    if cfg.role != Role::Worker {
        println!("  HTTP        : {}", format!("0.0.0.0:{}", cfg.http_port).bold());
    }
    println!("  Addressing  : {}", cfg.addressing.to_string().bold());
    println!("  Devices     : {}", cfg.devices.join(", ").bold());
    println!(
        "  Worker      : {}",
        if cfg.runs_worker() {
            "simulated".green()
        } else {
            "external".yellow()
        }
    );
    println!();
}
