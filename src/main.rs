//! Process bootstrap (§10.1): parses the CLI surface, loads configuration,
//! wires up the backend registry/shutdown hooks, installs structured
//! logging, and runs the accept loop that spawns one [`session::Session`]
//! per client connection.

mod backend;
mod config;
mod error;
mod injection;
mod logging;
mod packet;
mod pool;
mod protocol;
mod script;
mod session;
mod shutdown;

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use backend::{BackendRegistry, Role};
use config::AppConfig;
use logging::{CoalescingLayer, Level as LogLevel};
use script::NoopScriptHost;
use session::Session;
use shutdown::ShutdownHooks;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the proxy's YAML configuration file.
    #[arg(short, long, default_value = "proxy.yaml")]
    config: String,

    /// Overrides the configured log level (error, critical, warning, message, info, debug).
    #[arg(long)]
    log_level: Option<String>,

    /// Overrides the address the proxy listens on for client connections.
    #[arg(long, default_value = "0.0.0.0:6446")]
    bind_address: String,
}

fn parse_log_level(s: &str) -> LogLevel {
    match s.to_ascii_lowercase().as_str() {
        "error" => LogLevel::Error,
        "critical" => LogLevel::Critical,
        "warning" | "warn" => LogLevel::Warning,
        "message" => LogLevel::Message,
        "debug" | "trace" => LogLevel::Debug,
        _ => LogLevel::Info,
    }
}

fn parse_role(s: &str) -> Role {
    match s {
        "read-only" | "read_only" => Role::ReadOnly,
        _ => Role::ReadWrite,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = AppConfig::load(&args.config)?;
    let threshold = parse_log_level(args.log_level.as_deref().unwrap_or(&config.log.level));

    // CoalescingLayer is the sole sink: it both formats and prints, so it
    // replaces rather than wraps the standard fmt layer (unlike telemetry's
    // OpenTelemetryLayer, this isn't a side channel to a remote collector).
    tracing_subscriber::registry()
        .with(CoalescingLayer::new(threshold))
        .init();

    let registry = Arc::new(BackendRegistry::new());
    for backend in &config.backends {
        registry.add(
            backend.address.clone(),
            parse_role(&backend.role),
            config.pool.min_idle_connections,
        )?;
    }
    info!(count = config.backends.len(), "backends registered");

    let shutdown_hooks = Arc::new(ShutdownHooks::new());
    let registry_for_hook = registry.clone();
    shutdown_hooks.register(
        "backend-pools",
        Box::new(move || {
            for i in 0..registry_for_hook.count() {
                let _ = registry_for_hook.with_backend(i, |b| b.pool.free());
            }
        }),
    );

    let hooks_for_signal = shutdown_hooks.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            hooks_for_signal.call_all();
        }
    });

    let script_host = Arc::new(NoopScriptHost);

    let listener = TcpListener::bind(args.bind_address.as_str()).await?;
    info!(address = %args.bind_address, "listening for client connections");

    loop {
        let (client_socket, client_addr) = listener.accept().await?;
        info!(address = %client_addr, "accepted client connection");

        let registry = registry.clone();
        let script_host = script_host.clone();
        tokio::spawn(async move {
            let session = Session::new(client_socket, registry, script_host);
            if let Err(e) = session.run().await {
                error!(error = %e, "session ended with error");
            }
        });
    }
}
