//! kf-header-proxy
//!
//! Sidecar reverse proxy that stamps the authenticated user's identity on
//! every request and copies the `_xsrf` cookie into the `X-XSRFToken`
//! header before handing the request to a Jupyter-style notebook server.
//!
//! # Architecture Overview
//!
//! ```text
//!                     ┌──────────────────────────────────────────────┐
//!                     │                 kf-header-proxy              │
//!   Client Request    │  ┌──────────┐   ┌──────────┐   ┌──────────┐  │
//!   ──────────────────┼─▶│ listener │──▶│  filter  │──▶│ forward  │──┼──▶ Notebook
//!                     │  │ (+TLS)   │   │ identity │   │ retries  │  │    server
//!   Client Response   │  └──────────┘   │ + xsrf   │   │ websocket│  │
//!   ◀─────────────────┼─────────────────┴──────────┴───┴──────────┘◀─┼───
//!                     │                                              │
//!                     │  config + watcher · health · metrics · admin │
//!                     └──────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use kf_header_proxy::admin;
use kf_header_proxy::config::{read_config, validate_config, ConfigWatcher, ProxyConfig};
use kf_header_proxy::lifecycle::{signals, Shutdown};
use kf_header_proxy::observability::{logging, metrics};
use kf_header_proxy::HttpServer;

#[derive(Parser, Clone)]
#[command(name = "kf-header-proxy", version)]
#[command(about = "Identity and XSRF header propagation proxy", long_about = None)]
struct Args {
    /// TOML configuration file; watched for changes
    #[arg(short, long, env = "KF_HEADER_PROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Override listener.bind_address
    #[arg(long)]
    bind: Option<String>,

    /// Override upstream.address
    #[arg(long)]
    upstream: Option<String>,

    /// Override filter.user_id
    #[arg(long)]
    user_id: Option<String>,
}

impl Args {
    fn apply_overrides(&self, config: &mut ProxyConfig) {
        if let Some(bind) = &self.bind {
            config.listener.bind_address = bind.clone();
        }
        if let Some(upstream) = &self.upstream {
            config.upstream.address = upstream.clone();
        }
        if let Some(user_id) = &self.user_id {
            config.filter.user_id = user_id.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => read_config(path)?,
        None => ProxyConfig::default(),
    };
    args.apply_overrides(&mut config);
    if let Err(errors) = validate_config(&config) {
        for error in &errors {
            eprintln!("invalid configuration: {error}");
        }
        return Err(format!("{} configuration error(s)", errors.len()).into());
    }

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "kf-header-proxy starting");

    tracing::info!(
        bind_address = %config.listener.bind_address,
        upstream = %config.upstream.address,
        user_id_header = %config.filter.user_id_header,
        csrf_enabled = config.filter.csrf_enabled,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(e) => {
                tracing::error!(
                    metrics_address = %config.observability.metrics_address,
                    error = %e,
                    "Failed to parse metrics address"
                );
            }
        }
    }

    let shutdown = Shutdown::new();
    signals::spawn_signal_handler(shutdown.clone());

    // CLI overrides win over the file, on reload too.
    let (_watcher, config_updates) = match &args.config {
        Some(path) => {
            let overrides = args.clone();
            let (watcher, updates) = ConfigWatcher::new(path, config.clone());
            let watcher = watcher
                .with_overrides(move |config| overrides.apply_overrides(config))
                .run()?;
            (Some(watcher), updates)
        }
        None => (None, tokio::sync::mpsc::unbounded_channel().1),
    };

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    let server = HttpServer::new(config.clone())?;

    let admin_task = if config.admin.enabled {
        let admin_listener = TcpListener::bind(&config.admin.bind_address).await?;
        Some(tokio::spawn(admin::serve(
            server.state(),
            admin_listener,
            shutdown.subscribe(),
        )))
    } else {
        None
    };

    server.run(listener, config_updates, shutdown.subscribe()).await?;

    if let Some(task) = admin_task {
        match task.await {
            Ok(Err(e)) => tracing::error!(error = %e, "Admin API failed"),
            Err(e) => tracing::error!(error = %e, "Admin API task panicked"),
            Ok(Ok(())) => {}
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
