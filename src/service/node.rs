use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::{runtime, signal};
use tracing::{error, info, trace, warn};

use crate::session::{LoggingListener, Role, SessionListener};
use crate::AppResult;

use super::{PceeConfig, SessionEngine};

const CLOSE_GRACE: Duration = Duration::from_millis(200);

/// A standalone node: one engine in the configured role, running until Ctrl-C.
pub struct Node {
    config: PceeConfig,
    listener: Arc<dyn SessionListener>,
}

impl Node {
    pub fn new(config: PceeConfig) -> Self {
        Node {
            config,
            listener: Arc::new(LoggingListener),
        }
    }

    pub fn with_listener(config: PceeConfig, listener: Arc<dyn SessionListener>) -> Self {
        Node { config, listener }
    }

    pub fn start(&self, rt: &runtime::Runtime) -> AppResult<()> {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);

        rt.block_on(self.run(notify_shutdown.clone(), shutdown_complete_tx))?;

        // the engine is gone, stop every task it spawned
        notify_shutdown.send(())?;
        trace!("waiting for shutdown complete...");
        rt.block_on(shutdown_complete_rx.recv());
        info!("node shutdown complete");
        Ok(())
    }

    async fn run(
        &self,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> AppResult<()> {
        let role = self.config.general.role;
        let peers = self.config.general.peer_addresses()?;

        let engine = SessionEngine::start(
            &self.config,
            role,
            self.listener.clone(),
            notify_shutdown,
            shutdown_complete_tx,
        )
        .await?;

        match role {
            Role::Server => {
                if !peers.is_empty() {
                    warn!("a server does not initiate sessions, configured peers are ignored");
                }
            }
            Role::Client => {
                for peer in peers {
                    if let Err(e) = engine.register_outbound_connection(peer).await {
                        error!(%peer, "failed to open session: {}", e);
                    }
                }
            }
        }

        if let Err(e) = signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {}", e);
        }
        info!("get shutdown signal");

        for peer in engine.sessions() {
            if let Err(e) = engine.close(peer).await {
                trace!(%peer, "close on shutdown: {}", e);
            }
        }
        // give the workers a moment to write CLOSE before the tasks stop
        tokio::time::sleep(CLOSE_GRACE).await;
        Ok(())
    }
}
