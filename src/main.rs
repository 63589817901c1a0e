//! Vallum: a multi-tenant reverse proxy gateway.
//!
//! One process hosts many named instances, each with its own tokens,
//! inbound/outbound network policy, default timeout, and TLS posture.
//! Requests arrive at `/{instance}?url=...`, are admitted against instance
//! policy, and stream to the operator-selected upstream, HTTP bodies and
//! WebSocket frames alike.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    process,
    sync::Arc,
};

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod auth;
mod config;
mod error;
mod middleware;
mod params;
mod policy;
mod proxy;
mod registry;
mod routes;
mod tls;

#[cfg(test)]
mod tests;

use config::GatewayConfig;
use registry::InstanceRegistry;

#[derive(Parser, Debug)]
#[command(version, about = "Vallum reverse proxy gateway", long_about = None)]
struct Args {
    /// Bind address (overrides the config file)
    #[arg(long)]
    host: Option<IpAddr>,

    /// Bind port (overrides the config file)
    #[arg(long)]
    port: Option<u16>,

    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "proxy.json")]
    config: PathBuf,
}

/// Shared application state; cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<InstanceRegistry>,
    /// Pooled strict-TLS client, used for literal-IP targets. Hostname
    /// targets and permissive-TLS requests build their own short-lived
    /// client with the resolved address pinned.
    pub http_client: reqwest::Client,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // reqwest and the per-request TLS selector share this provider.
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls crypto provider already installed");
    }

    let args = Args::parse();
    let mut config = match GatewayConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    run_server(config, args.config).await;
}

async fn run_server(config: GatewayConfig, config_path: PathBuf) {
    let registry = Arc::new(InstanceRegistry::new(&config.instances));
    let http_client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("failed to build HTTP client");

    if registry.is_empty() {
        tracing::warn!("no instances configured; every request will 404");
    } else {
        tracing::info!(instances = registry.len(), "instance table loaded");
    }

    let state = AppState {
        config: Arc::new(config),
        registry: Arc::clone(&registry),
        http_client,
    };

    #[cfg(unix)]
    spawn_reload_task(registry, config_path);
    #[cfg(not(unix))]
    let _ = config_path;

    let app = routes::build_router(state.clone());
    let bind_addr = SocketAddr::new(state.config.server.host, state.config.server.port);
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .expect("failed to bind to address");
    tracing::info!("listening on http://{bind_addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");
}

/// SIGHUP re-reads the configuration file and swaps the instance table.
/// Server settings are fixed for the process lifetime; only instances
/// reload. A malformed file keeps the current table.
#[cfg(unix)]
fn spawn_reload_task(registry: Arc<InstanceRegistry>, config_path: PathBuf) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGHUP handler");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            match GatewayConfig::load(&config_path) {
                Ok(config) => {
                    registry.replace_all(&config.instances);
                    tracing::info!(
                        instances = config.instances.len(),
                        "instance table reloaded"
                    );
                }
                Err(e) => {
                    tracing::error!(error = %e, "reload failed, keeping current instance table");
                }
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
