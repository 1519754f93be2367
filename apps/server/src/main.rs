//! Spindrift Server - standalone headless multi-room audio endpoint.
//!
//! Loads the process configuration and endpoint roster, bootstraps the
//! core services, autostarts flagged endpoints, and serves the REST/WS
//! control surface until a signal arrives.
//!
//! Exit codes: 0 normal shutdown (SIGTERM or server end), 1 fatal startup
//! (backend unavailable, corrupt config, bind failure), 130 on SIGINT.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use spindrift_core::{
    bootstrap_services, load_roster, start_server, StatusBroadcaster, TeeLogger,
};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;

/// Exit code for an interrupt-driven shutdown (128 + SIGINT).
const EXIT_SIGINT: u8 = 130;

/// Spindrift Server - headless synchronized multi-room audio endpoint.
#[derive(Parser, Debug)]
#[command(name = "spindrift-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "SPINDRIFT_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "SPINDRIFT_BIND_PORT")]
    port: Option<u16>,

    /// Data directory for persistent state (endpoint roster).
    #[arg(short = 'd', long, env = "SPINDRIFT_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to build async runtime: {e}");
            return ExitCode::from(1);
        }
    };
    match runtime.block_on(run(args)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            log::error!("Fatal startup error: {e:#}");
            eprintln!("Fatal startup error: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> Result<u8> {
    // Load configuration (a corrupt process config is fatal).
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.bind_port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = Some(data_dir);
    }

    // Environment detection runs once; its result is immutable.
    let environment = spindrift_core::environment();
    let data_dir = config.resolved_data_dir(environment);
    let core = config.to_core_config(environment);

    // Endpoint roster. A broken roster starts the process with an empty one;
    // the configuration (and its error) stays on disk for the operator.
    let roster_path = data_dir.join("players.yaml");
    let roster = match load_roster(&roster_path) {
        Ok(roster) => roster,
        Err(e) => {
            eprintln!("Roster rejected ({e}); starting with an empty roster");
            Default::default()
        }
    };

    // Backend unavailable (not compiled / no server) is fatal.
    let services = bootstrap_services(core.clone(), roster, Some(roster_path))
        .context("Failed to bootstrap services")?;

    // Logging: env_logger filtered by --log-level, teed onto the WS push
    // channel as log_entry messages.
    let env_logger = env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .build();
    let tee = TeeLogger::new(Box::new(env_logger), services.bridge.clone());
    log::set_boxed_logger(Box::new(tee)).context("Failed to install logger")?;
    log::set_max_level(args.log_level);

    log::info!("Spindrift Server v{}", env!("CARGO_PKG_VERSION"));
    log::info!(
        "Configuration: port={}, backend={}, data_dir={}, supervised={}",
        core.bind_port,
        core.backend,
        data_dir.display(),
        environment.supervised
    );

    // Boot ordering: card profiles, custom sinks, then autostart players.
    services.manager.autostart_all_on_boot().await;

    // Background status broadcaster (2s cadence).
    let cancel = CancellationToken::new();
    let broadcaster = StatusBroadcaster::new(
        services.manager.clone(),
        services.ws.clone(),
        core.status_interval_secs,
    );
    tokio::spawn(broadcaster.run(cancel.child_token()));

    // Serve until a signal arrives.
    let state = services.app_state();
    let server_cancel = cancel.child_token();
    let server = tokio::spawn(start_server(state, core.bind_port, server_cancel));

    let exit_code = wait_for_shutdown().await;

    // Graceful teardown: stop every endpoint (flushing state), close
    // WebSocket clients, stop the server.
    log::info!("Shutting down: stopping all endpoints");
    services.manager.stop_all().await;
    services.ws.close_all();
    cancel.cancel();

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e).context("Server failed"),
        Err(e) => log::warn!("Server task join error: {e}"),
    }

    log::info!("Shutdown complete");
    Ok(exit_code)
}

/// Blocks until SIGINT or SIGTERM; returns the process exit code.
async fn wait_for_shutdown() -> u8 {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return EXIT_SIGINT;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("SIGINT received");
                EXIT_SIGINT
            }
            _ = sigterm.recv() => {
                log::info!("SIGTERM received");
                0
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("Ctrl-C received");
        EXIT_SIGINT
    }
}
