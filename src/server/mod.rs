//! Daemon mode - runs when invoked as `chunkgw --config <path>`
//!
//! Three listeners share one accept loop: the client socket, the
//! interconnect socket answering liveness probes, and the optional TCP
//! stats port. Every connection runs in its own task. On SIGINT, SIGTERM
//! or SIGHUP the listeners close and the loop waits for in-flight
//! connections to drain.

pub mod dispatch;
pub mod stats;

use anyhow::{Context, Result};
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::gateway::Gateway;

pub use dispatch::{serve_connection, serve_interconnect};

/// Bind a Unix socket, replacing a stale socket file left by a previous run.
fn bind_unix(path: &Path) -> Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!("Removed stale socket {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to remove stale socket {}", path.display()))
        }
    }
    UnixListener::bind(path).with_context(|| format!("Failed to bind {}", path.display()))
}

async fn accept_stats(listener: &Option<TcpListener>) -> io::Result<TcpStream> {
    match listener {
        Some(listener) => listener.accept().await.map(|(stream, _)| stream),
        None => std::future::pending().await,
    }
}

async fn wait_for_signal() -> io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let name = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = hangup.recv() => "SIGHUP",
    };
    Ok(name)
}

/// Cancel `token` on the first shutdown signal.
fn spawn_signal_handler(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            received = wait_for_signal() => match received {
                Ok(name) => {
                    tracing::info!("Received {}, shutting down", name);
                    token.cancel();
                }
                Err(e) => tracing::error!("Failed to install signal handlers: {}", e),
            },
        }
    })
}

/// Main daemon entry point. Returns once shutdown was requested and every
/// connection has finished.
pub async fn run(gw: Arc<Gateway>) -> Result<()> {
    let config = &gw.config;
    let shutdown = gw.shutdown.clone();
    let tracker = TaskTracker::new();

    let listener = bind_unix(&config.socket_path)?;
    let interconnect = bind_unix(&config.interconnect_socket_path)?;
    let stats = if config.stat_port != 0 {
        Some(
            TcpListener::bind(("127.0.0.1", config.stat_port))
                .await
                .with_context(|| format!("Failed to bind stats port {}", config.stat_port))?,
        )
    } else {
        None
    };
    tracing::info!(
        socket = %config.socket_path.display(),
        interconnect = %config.interconnect_socket_path.display(),
        stat_port = config.stat_port,
        "Gateway listening"
    );

    let signals = spawn_signal_handler(shutdown.clone());

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let gw = Arc::clone(&gw);
                    tracker.spawn(async move {
                        if let Err(e) = serve_connection(gw, stream).await {
                            tracing::debug!("Connection ended with error: {}", e);
                        }
                    });
                }
                Err(e) => tracing::error!("Failed to accept client connection: {}", e),
            },

            accepted = interconnect.accept() => match accepted {
                Ok((stream, _)) => {
                    let shutdown = shutdown.clone();
                    tracker.spawn(async move {
                        let _ = serve_interconnect(stream, shutdown).await;
                    });
                }
                Err(e) => tracing::error!("Failed to accept interconnect connection: {}", e),
            },

            accepted = accept_stats(&stats) => match accepted {
                Ok(mut stream) => {
                    let registry = Arc::clone(&gw.registry);
                    tracker.spawn(async move {
                        if let Err(e) = stats::write_sessions(&registry, &mut stream).await {
                            tracing::debug!("Failed to write stats: {}", e);
                        }
                    });
                }
                Err(e) => tracing::error!("Failed to accept stats connection: {}", e),
            },
        }
    }

    drop(listener);
    drop(interconnect);
    drop(stats);
    tracker.close();
    if !tracker.is_empty() {
        tracing::info!("Waiting for {} connection(s) to finish", tracker.len());
    }
    tracker.wait().await;
    signals.abort();

    for path in [&config.socket_path, &config.interconnect_socket_path] {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::debug!("Failed to remove socket {}: {}", path.display(), e);
        }
    }
    tracing::info!("Gateway stopped");
    Ok(())
}
