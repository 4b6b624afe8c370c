#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # merf
//!
//! Expose a local HTTP server at a public subdomain without inbound
//! connectivity.
//!
//! ## Subcommands
//!
//! - `merf relay` — run the public relay: control port for agent tunnels,
//!   HTTP port for public traffic routed by Host header
//! - `merf agent` — dial a relay, receive a subdomain, forward its traffic to
//!   a local server
//!
//! ## Relay surface
//!
//! | Host                    | Path          | Description                       |
//! |-------------------------|---------------|-----------------------------------|
//! | `<domain>`              | `/api/health` | Liveness probe                    |
//! | `<domain>`              | `/api/tunnels`| Connected tunnels (JSON)          |
//! | `<domain>`              | any other     | Status page (HTML)                |
//! | `[*.]<label>.<domain>`  | any           | Proxied to the agent, 404 / 502   |
//!
//! ## Architecture
//!
//! ```text
//! main.rs            — entry point, clap subcommands, startup, graceful shutdown
//! config.rs          — TOML + env-var configuration
//! error.rs           — error types
//! state.rs           — RelayState shared by handlers
//! routes/
//!   health.rs        — GET /api/health on the base domain
//!   status.rs        — status page and tunnel listing
//! tunnel/
//!   naming.rs        — word lists, label generation
//!   registry.rs      — hostname → tunnel map, register/resolve/evict
//!   router.rs        — Host normalization, label-stripping lookup
//!   transport.rs     — HTTP/1.1 exchange over one tunnel socket
//!   relay.rs         — control accept loop, public proxy handler
//!   agent.rs         — agent connect + relay loop
//! ```

use std::error::Error;
use std::fmt::Write as _;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use merf::config::Config;
use merf::routes::status::StatusPage;
use merf::tunnel::relay;
use merf::{Agent, LocalTarget, Registry, RelayState};

/// Reverse tunnels from a public relay to local HTTP servers.
#[derive(Parser)]
#[command(name = "merf", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the public relay.
    Relay {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// Port to serve public HTTP on.
        #[arg(long)]
        http_port: Option<u16>,
        /// Port to accept agent tunnels on.
        #[arg(long)]
        control_port: Option<u16>,
        /// Base domain; tunnels are served at `<label>.<domain>`.
        #[arg(long)]
        domain: Option<String>,
        /// Status page template containing a `{{tunnels}}` placeholder.
        #[arg(long)]
        template: Option<String>,
    },
    /// Connect to a relay and expose a local server.
    Agent {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// Relay control address (`host:port`).
        #[arg(long)]
        remote: Option<String>,
        /// Local server to expose (`http://host:port`).
        #[arg(long)]
        local: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Relay {
            config,
            http_port,
            control_port,
            domain,
            template,
        } => {
            let mut config = load_config(config.as_deref());
            if let Some(port) = http_port {
                config.relay.http_port = port;
            }
            if let Some(port) = control_port {
                config.relay.control_port = port;
            }
            if let Some(domain) = domain {
                config.relay.domain = domain;
            }
            if template.is_some() {
                config.relay.template = template;
            }
            init_tracing(&config);
            run_relay(config).await;
        }
        Commands::Agent {
            config,
            remote,
            local,
        } => {
            let mut config = load_config(config.as_deref());
            if let Some(remote) = remote {
                config.agent.remote = remote;
            }
            if let Some(local) = local {
                config.agent.local = local;
            }
            init_tracing(&config);
            run_agent(config).await;
        }
    }
}

fn load_config(path: Option<&str>) -> Config {
    Config::load(path).unwrap_or_else(|e| {
        eprintln!("merf: {e}");
        std::process::exit(1);
    })
}

fn init_tracing(config: &Config) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

/// Log an unrecoverable error with its cause chain and exit.
fn fatal(context: &str, err: &dyn Error) -> ! {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !message.contains(&cause_text) {
            let _ = write!(message, ": {cause_text}");
        }
        source = cause.source();
    }
    error!("{context}: {message}");
    std::process::exit(1);
}

async fn run_relay(config: Config) {
    info!("merf relay v{} starting", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate_relay() {
        fatal("Invalid configuration", &e);
    }
    let template = config
        .load_template()
        .unwrap_or_else(|e| fatal("Failed to load status template", &e));
    let status_page = StatusPage::new(template);
    if !status_page.shows_tunnels() {
        warn!("Status template has no {{{{tunnels}}}} placeholder");
    }

    let relay_config = &config.relay;
    let control = TcpListener::bind(relay_config.control_addr())
        .await
        .unwrap_or_else(|e| fatal("Failed to bind control port", &e));
    let http = TcpListener::bind(relay_config.http_addr())
        .await
        .unwrap_or_else(|e| fatal("Failed to bind HTTP port", &e));

    info!(
        "Serving http on {}, listening for agents on {}, domain {}",
        relay_config.http_addr(),
        relay_config.control_addr(),
        relay_config.domain
    );

    let registry = Registry::with_defaults(&relay_config.domain, relay_config.registry_settings());
    let state = RelayState::new(registry.clone(), status_page);

    let control_task = tokio::spawn(relay::serve_control(control, registry.clone()));

    // Periodic sweep: evict tunnels whose agent hung up while idle
    let sweep_registry = registry.clone();
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            sweep_registry.sweep_closed().await;
        }
    });

    if let Err(e) = relay::serve_http(http, state, shutdown_signal()).await {
        fatal("HTTP server error", &e);
    }

    info!("Shutting down...");
    control_task.abort();
    sweep_task.abort();
    registry.drain_all().await;
    info!("Goodbye");
}

async fn run_agent(config: Config) {
    let local = LocalTarget::parse(&config.agent.local)
        .unwrap_or_else(|e| fatal("Invalid local target", &e));

    info!("Connecting to relay at {}", config.agent.remote);
    let agent = Agent::connect(&config.agent.remote, local)
        .await
        .unwrap_or_else(|e| fatal("Failed to establish tunnel", &e));

    info!(
        "Connection established, serving {} at {}",
        agent.local(),
        agent.label()
    );

    if let Err(e) = agent.run().await {
        fatal("Agent stopped", &e);
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(_) => {
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
