//! TCP listener and accept loop.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::handler::{ConnectionLimits, handle_connection};
use crate::metrics::RelayMetrics;
use crate::registry::RoomRegistry;

pub struct RelayServer {
    listener: TcpListener,
    room: Arc<RoomRegistry>,
    metrics: Arc<RelayMetrics>,
    limits: ConnectionLimits,
}

impl RelayServer {
    /// Bind the listener. Use port 0 to let the OS pick one.
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let metrics = Arc::new(RelayMetrics::new());
        let room = Arc::new(RoomRegistry::new(&config, metrics.clone()));
        Ok(Self {
            listener,
            room,
            metrics,
            limits: ConnectionLimits::from(&config),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("listener has no local address")
    }

    pub fn room(&self) -> Arc<RoomRegistry> {
        self.room.clone()
    }

    pub fn metrics(&self) -> Arc<RelayMetrics> {
        self.metrics.clone()
    }

    /// Accept connections until `cancel` fires, then wait for every
    /// connection handler to wind down.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let local = self.local_addr()?;
        info!(addr = %local, "chat relay listening");

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("accept loop cancelled");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(peer = %peer, "failed to set TCP_NODELAY: {}", e);
                    }
                    info!(peer = %peer, "accepted connection");
                    connections.spawn(handle_connection(
                        stream,
                        peer,
                        self.room.clone(),
                        self.limits,
                        cancel.child_token(),
                    ));
                }
                // Reap finished handlers so the set does not grow unbounded.
                Some(done) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = done {
                        error!("connection task panicked: {}", e);
                    }
                }
            }
        }

        while let Some(done) = connections.join_next().await {
            if let Err(e) = done {
                error!("connection task panicked: {}", e);
            }
        }

        let snapshot = self.metrics.snapshot();
        match serde_json::to_string(&snapshot) {
            Ok(json) => info!(metrics = %json, "chat relay stopped"),
            Err(e) => debug!("failed to serialize metrics: {}", e),
        }
        Ok(())
    }
}
