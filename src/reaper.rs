use std::{sync::Arc, time::Duration};

use tokio::sync::watch;
use tracing::{error, info};

use crate::{state_store::ArtifactStore, utils::now_ms};

/// Periodically removes artifact rows whose expiration has passed.
///
/// Only metadata is reaped; object-store bytes are handled by bucket
/// lifecycle policies.
pub struct Reaper {
    store: Arc<ArtifactStore>,
    interval: Duration,
    shutdown_rx: watch::Receiver<()>,
}

impl Reaper {
    pub fn new(store: Arc<ArtifactStore>, interval: Duration, shutdown_rx: watch::Receiver<()>) -> Self {
        Reaper {
            store,
            interval,
            shutdown_rx,
        }
    }

    pub async fn start(mut self) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    match self.store.delete_expired(now_ms()) {
                        Ok(0) => {}
                        Ok(count) => info!(count, "reaped expired artifacts"),
                        Err(err) => error!("failed to reap expired artifacts: {err:#}"),
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    info!("reaper shutting down");
                    return;
                }
            }
        }
    }
}
