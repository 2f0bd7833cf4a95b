//! Server mode — opens the state store, takes leadership, and serves the
//! REST API until Ctrl-C.
//!
//! In this mode, the daemon:
//! 1. Opens the state store (redb file under `data_dir`, or in memory)
//! 2. Builds the `Server` and establishes leadership, restoring evals
//!    and heartbeat timers from state
//! 3. Serves the REST API
//! 4. On shutdown, revokes leadership so workers and timers stop cleanly

use tokio::sync::watch;
use tracing::{info, warn};

use corral_core::ServerConfig;
use corral_server::Server;
use corral_state::StateStore;

/// Run a control plane server.
pub async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    info!(node_id = %config.node_id, "corral daemon starting in server mode");

    // ── State store ──────────────────────────────────────────────
    let state = match &config.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let path = dir.join("corral.redb");
            let state = StateStore::open(&path)?;
            info!(path = ?path, "state store opened");
            state
        }
        None => {
            warn!("no data dir configured, state is kept in memory");
            StateStore::open_in_memory()?
        }
    };

    // ── Leadership ───────────────────────────────────────────────
    let api_addr = config.api_addr;
    let server = Server::new(config, state);
    let epoch = server.establish_leadership().await?;
    info!(%epoch, "leadership established");

    // ── REST API server ──────────────────────────────────────────
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let router = corral_api::build_router(server.clone());

    info!(%api_addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(api_addr).await?;

    let signal = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => warn!(error = %e, "failed to listen for ctrl-c, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;

    // Clean up.
    signal.abort();
    server.revoke_leadership().await;
    info!("corral daemon stopped");
    Ok(())
}
