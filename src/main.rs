//! drop-serve server binary.
//!
//! Serves a single directory tree over HTTP behind Basic authentication,
//! accepts single-file multipart uploads into it, and shuts itself down after
//! a fixed delay.

mod atomic;
mod auth;
mod config;
mod error;
mod files;
mod http;
mod listing;
mod logging;
mod router;
mod self_destruct;
mod storage;
mod upload;

use axum::Router;
use axum_server::Handle;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

use crate::auth::AuthConfig;
use crate::config::{Args, SHUTDOWN_GRACE_SECS, ServerConfig};
use crate::storage::Storage;

/// Starts the server and blocks until self-destruct or a termination signal.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let config = ServerConfig::from(Args::parse());
    let cwd = std::env::current_dir()?;
    let output_dir = match config.ensure_output_path(&cwd) {
        Ok(path) => path,
        Err(err) => {
            error!("{err}");
            std::process::exit(1);
        }
    };

    let addr = config.bind_addr();
    info!("listening on {}", addr);
    info!("Auth {}:{}", config.username, config.password);
    info!(
        "Server will shutdown in {} second(s)",
        config.self_destruct_delay_secs
    );

    let storage = Arc::new(Storage::open(output_dir).await?);
    info!(dir = ?storage.root_path(), "serving directory");
    let auth = Arc::new(AuthConfig::new(&config.username, &config.password));
    let app = router::build_router(storage, auth);

    let handle = Handle::new();
    let delay = Duration::from_secs(config.self_destruct_delay_secs);
    tokio::select! {
        result = serve(app, addr, handle.clone(), delay) => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

/// 启动自毁计时并开始服务，计时到期后立即关闭。
async fn serve(
    app: Router,
    addr: SocketAddr,
    handle: Handle,
    self_destruct_delay: Duration,
) -> Result<(), std::io::Error> {
    let destruct_handle = handle.clone();
    self_destruct::schedule(self_destruct_delay, move || destruct_handle.shutdown());

    axum_server::bind(addr)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
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

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_SECS)));
    std::future::pending::<()>().await;
}
