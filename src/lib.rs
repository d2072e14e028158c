//! Live lecture Q&A and polling backend.
//!
//! Students join a lecture with a Luhn-checked id, ask and upvote questions,
//! vote on the pace and answer polls. Moderators hold the lecture key and
//! drive the rest.
//!
//! Every operation is one storage transaction; see [`storage`] for the
//! contract and [`memory`] / [`db`] for the two stores.
use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use axum_server::Handle;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
use tokio::signal::ctrl_c;
use tracing::info;

pub mod auth;
pub mod checksum;
pub mod config;
pub mod db;
pub mod error;
#[cfg(test)]
mod flaky;
pub mod handlers;
pub mod lecture;
pub mod ledger;
pub mod memory;
pub mod models;
pub mod poll;
pub mod question;
pub mod routes;
pub mod state;
pub mod storage;
pub mod user;

use config::Config;
use state::AppState;
use storage::Store;

/// In-flight requests get this long to finish once a shutdown signal arrives.
const GRACE_PERIOD: Duration = Duration::from_secs(10);

pub async fn start_server<S: Store>(store: S, config: Config) -> io::Result<()> {
    let address = SocketAddr::from(([0, 0, 0, 0], config.port));
    let state = Arc::new(AppState::new(store, config));
    let app = routes::create_routes(state);

    let handle = Handle::new();
    tokio::spawn(shutdown_signal(handle.clone()));

    info!("Server running on {address}");
    axum_server::bind(address)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(e) = ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {e}");
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

    handle.graceful_shutdown(Some(GRACE_PERIOD));
}
