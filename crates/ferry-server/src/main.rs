mod config;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use ferry_transfer::{ChunkServer, TracingLogger, bind_udp};
use tracing::{info, warn};

use crate::config::ServerSettings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ferry_server=info,ferry_transfer=info".into()),
        )
        .init();

    let settings = ServerSettings::from_env()?;

    let socket = bind_udp(settings.bind, settings.socket_buffer)
        .with_context(|| format!("cannot bind UDP socket on {}", settings.bind))?;
    info!("Ferry server listening on {}", socket.local_addr()?);
    info!("Serving files from {}", settings.transfer.root.display());

    // The transfer loop is blocking; it polls this flag between waits.
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    let mut server = ChunkServer::new(socket, settings.transfer, Arc::new(TracingLogger));
    let mut worker = tokio::task::spawn_blocking(move || server.run(&flag));

    tokio::select! {
        result = &mut worker => {
            result.context("server loop panicked")?.context("server loop failed")?;
            return Ok(());
        }
        _ = shutdown_signal() => {}
    }

    shutdown.store(true, Ordering::Relaxed);
    worker
        .await
        .context("server loop panicked")?
        .context("server loop failed")?;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
