use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum_server::Handle;
use omniqueue::DynConsumer;
use tokio::{signal, sync::watch};
use tracing::info;

use crate::{
    artifacts::ArtifactService,
    auth::{Authorizer, StaticAuthorizer},
    blob_store::{BlobContainer, Bucket},
    config::ServerConfig,
    events::ArtifactPublisher,
    reaper::Reaper,
    region::RegionResolver,
    routes::{create_routes, RouteState},
    state_store::ArtifactStore,
};

#[derive(Clone)]
pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub store: Arc<ArtifactStore>,
    pub artifact_service: Arc<ArtifactService>,
    /// Consumer half of the in-memory event queue; present only with the
    /// in-memory backend, where the test harness drains it.
    pub event_consumer: Option<Arc<tokio::sync::Mutex<DynConsumer>>>,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        let store = Arc::new(
            ArtifactStore::open(&config.state_store_path)
                .context("error initializing artifact store")?,
        );
        let public_bucket = Arc::new(
            Bucket::new(&config.public_bucket)
                .await
                .context("error initializing public bucket")?,
        );
        let private_bucket = Arc::new(
            Bucket::new(&config.private_bucket)
                .await
                .context("error initializing private bucket")?,
        );
        let container = Arc::new(
            BlobContainer::new(&config.azure).context("error initializing blob container")?,
        );
        let regions = Arc::new(RegionResolver::new(&config.regions)?);
        let authorizer: Arc<dyn Authorizer> =
            Arc::new(StaticAuthorizer::new(config.scopes.clone()));
        let (publisher, event_consumer) = ArtifactPublisher::new(&config.queue)
            .await
            .context("error initializing event publisher")?;

        let artifact_service = Arc::new(ArtifactService::new(
            store.clone(),
            public_bucket,
            private_bucket,
            container,
            regions,
            authorizer,
            Arc::new(publisher),
            config.cloud_mirror_host.clone(),
        ));

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            store,
            artifact_service,
            event_consumer: event_consumer.map(|c| Arc::new(tokio::sync::Mutex::new(c))),
        })
    }

    pub async fn start(&self) -> Result<()> {
        let reaper = Reaper::new(
            self.store.clone(),
            Duration::from_secs(self.config.reaper_interval_secs),
            self.shutdown_rx.clone(),
        );
        tokio::spawn(reaper.start());

        let route_state = RouteState {
            artifact_service: self.artifact_service.clone(),
        };
        let app = create_routes(route_state);

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, shutdown_tx).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("server listening on {}", addr);
        axum_server::bind(addr)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
        Ok(())
    }
}

async fn shutdown_signal(handle: Handle, shutdown_tx: watch::Sender<()>) {
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
    handle.graceful_shutdown(Some(Duration::from_secs(5)));
    let _ = shutdown_tx.send(());
}
