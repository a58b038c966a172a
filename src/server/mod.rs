//! HTTP and WebSocket surface.
//!
//! REST endpoints for browsing and replaying stored sessions live in `api`;
//! the live generation protocol lives in `ws`.

pub mod api;
pub mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    http::{HeaderValue, Method},
    routing::get,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::container::{ContainerRegistry, DockerRuntime, LifecycleDeps, PortAllocator};
use crate::llm::ModelRouter;
use crate::session::{ManagerSettings, SessionManager};
use crate::store::{DbHandle, SessionDb};

pub use api::{AppState, SharedState};

/// Build the full application router with the REST API and the WebSocket.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

fn cors_layer(config: &AppConfig, dev_mode: bool) -> Result<CorsLayer> {
    if dev_mode {
        return Ok(CorsLayer::permissive());
    }
    let origin: HeaderValue = config
        .client_origin
        .parse()
        .with_context(|| format!("Invalid CLIENT_ORIGIN {:?}", config.client_origin))?;
    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::DELETE])
        .allow_headers(Any))
}

/// Connect to Docker. Generation still works without it; app control
/// requests then report that containers are unavailable.
async fn connect_containers(config: &AppConfig) -> Option<Arc<ContainerRegistry>> {
    let runtime = match DockerRuntime::connect() {
        Ok(runtime) => runtime,
        Err(e) => {
            warn!(error = %e, "Docker unavailable, app previews disabled");
            return None;
        }
    };
    if let Err(e) = runtime.ping().await {
        warn!(error = %e, "Docker did not answer ping, app previews disabled");
        return None;
    }
    let deps = Arc::new(LifecycleDeps {
        runtime: Arc::new(runtime),
        ports: Arc::new(PortAllocator::new(
            config.sandbox.port_range_start,
            config.sandbox.port_range_end,
        )),
        sandbox: config.sandbox.clone(),
    });
    Some(Arc::new(ContainerRegistry::new(
        deps,
        config.sandbox_root.clone(),
        config.max_concurrent_containers,
    )))
}

/// Start the server and run until Ctrl+C or SIGTERM.
pub async fn start_server(config: AppConfig, dev_mode: bool) -> Result<()> {
    let db = SessionDb::new(&config.database_path).context("Failed to initialize session database")?;
    let db = DbHandle::new(db);
    std::fs::create_dir_all(&config.sandbox_root).context("Failed to create sandbox root")?;

    let model = Arc::new(ModelRouter::from_keys(&config.keys));
    let mut manager = SessionManager::new(db, model, ManagerSettings::from_config(&config));
    if let Some(containers) = connect_containers(&config).await {
        manager = manager.with_containers(containers);
    }
    let manager = Arc::new(manager);
    let sweep = manager.spawn_stuck_sweep();

    let state = Arc::new(AppState {
        manager: manager.clone(),
        save_file_burst: config.save_file_burst,
        save_file_refill: config.save_file_refill,
    });
    let app = build_router(state).layer(cors_layer(&config, dev_mode)?);

    let host = if dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, "appforge listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    sweep.abort();
    manager.shutdown().await;
    info!("server shut down gracefully");
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
