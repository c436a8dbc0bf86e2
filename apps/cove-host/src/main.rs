mod auth;
mod capture;
mod cluster;
mod config;
mod handlers;
mod pty;
mod registry;
mod session;
mod system;
mod websocket;

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::auth::Auth;
use crate::cluster::ClusterStore;
use crate::config::Config;
use crate::handlers::{
    create_session, delete_session, get_cluster, healthz, heartbeat, put_cluster, AppState,
};
use crate::registry::SessionRegistry;
use crate::system::SystemMonitor;
use crate::websocket::ws_handler;

#[derive(Parser, Debug)]
#[command(name = "cove-host", about = "Terminal session host for cove clients")]
struct Cli {
    /// Port to listen on (overrides COVE_PORT)
    #[arg(long)]
    port: Option<u16>,
    /// Address to bind (overrides COVE_HOST)
    #[arg(long)]
    host: Option<String>,
    /// Access password (overrides COVE_PASSWORD)
    #[arg(long)]
    password: Option<String>,
}

#[tokio::main]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(host) = cli.host {
        config.bind_host = host;
    }
    if let Some(password) = cli.password {
        config.password = Some(password);
    }

    let boot_id = Uuid::new_v4().to_string();
    info!(port = config.port, shell = %config.shell, boot_id = %boot_id, "starting cove host");

    let cluster = match ClusterStore::open() {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "could not open cluster store");
            std::process::exit(1);
        }
    };

    let registry = SessionRegistry::new(
        config.shell.clone(),
        config.default_cwd.clone(),
        config.history_limit,
    );
    if let Err(e) = registry.ensure_one().await {
        error!(error = %e, "could not spawn the initial shell");
        std::process::exit(1);
    }

    let state = AppState {
        registry: Arc::clone(&registry),
        monitor: Arc::new(SystemMonitor::new()),
        cluster,
        auth: Arc::new(Auth::new(config.password.clone())),
        boot_id,
        ping_interval_secs: config.ping_interval_secs,
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:id", delete(delete_session))
        .route("/api/heartbeat", post(heartbeat))
        .route("/api/cluster", get(get_cluster).put(put_cluster))
        .route("/ws/:id", get(ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.bind_host, config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %addr, error = %e, "bind failed");
            std::process::exit(1);
        }
    };
    info!(addr = %addr, "cove host listening");

    let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(e) = serve.await {
        error!(error = %e, "server error");
    }

    registry.dispose_all().await;
    info!("cove host stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
