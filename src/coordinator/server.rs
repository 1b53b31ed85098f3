//! Master server

use crate::common::{Error, MasterConfig, Result};
use crate::coordinator::bootstrap::ClusterBootstrap;
use crate::coordinator::http::{create_router, MasterState};
use crate::coordinator::transport::{HttpTransport, CLUSTER_PREFIX};
use std::sync::Arc;
use std::time::Duration;

pub struct MasterServer {
    config: MasterConfig,
}

impl MasterServer {
    pub fn new(config: MasterConfig) -> Self {
        Self { config }
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting master: {}", self.config.address());
        tracing::info!("  HTTP API: {}", self.config.bind_addr()?);
        tracing::info!("  Data dir: {}", self.config.data_dir.display());
        tracing::info!("  Peers: {:?}", self.config.peers);
        tracing::info!("  Pulse: {}s", self.config.pulse_seconds);

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr()?).await?;
        let transport = Arc::new(HttpTransport::new(
            CLUSTER_PREFIX,
            Duration::from_millis(self.config.rpc_timeout_ms),
            self.config.max_idle_conns_per_host,
        )?);

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let mut http_task = None;
        let raft = ClusterBootstrap::new(self.config.clone())
            .start(transport, |raft| {
                let router = create_router(MasterState::new(raft));
                http_task = Some(tokio::spawn(async move {
                    axum::serve(listener, router)
                        .with_graceful_shutdown(async {
                            let _ = stop_rx.await;
                        })
                        .await
                }));
            })
            .await?;
        let Some(mut http_task) = http_task else {
            return Err(Error::Internal("HTTP server was not started".into()));
        };

        tracing::info!("✓ Master ready ({})", raft.role());

        let http_finished = tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    tracing::warn!("Cannot listen for shutdown signal: {}", e);
                }
                tracing::info!("Shutting down");
                false
            }
            res = &mut http_task => {
                match res {
                    Ok(Ok(())) => tracing::warn!("HTTP server exited"),
                    Ok(Err(e)) => tracing::error!("HTTP server error: {}", e),
                    Err(e) => tracing::error!("HTTP server task failed: {}", e),
                }
                true
            }
        };

        raft.stop().await;
        let _ = stop_tx.send(());
        if !http_finished {
            let _ = http_task.await;
        }
        Ok(())
    }
}
