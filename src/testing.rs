use std::{collections::HashMap, time::Duration};

use anyhow::{anyhow, Result};
use tempfile::TempDir;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    blob_store::{BucketConfig, ContainerConfig},
    config::ServerConfig,
    data_model::Task,
    service::Service,
};

pub const TEST_PUBLIC_BUCKET: &str = "public-artifacts";
pub const TEST_PRIVATE_BUCKET: &str = "private-artifacts";
pub const TEST_CLOUD_MIRROR: &str = "cloud-mirror.example.com";
/// Region the public bucket lives in; 10.1.0.0/16 resolves to it.
pub const TEST_BUCKET_REGION: &str = "us-east-1";

// Azurite's published development key; valid base64, no real account.
const AZURITE_DEV_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";

pub struct TestService {
    pub service: Service,
    _temp_dir: TempDir,
}

impl TestService {
    pub async fn new() -> Result<Self> {
        Self::with_scopes(vec!["queue:*".to_string(), "assume:*".to_string()]).await
    }

    pub async fn with_scopes(scopes: Vec<String>) -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let temp_dir = tempfile::tempdir()?;

        let mut regions = HashMap::new();
        regions.insert(TEST_BUCKET_REGION.to_string(), vec!["10.1.0.0/16".to_string()]);
        regions.insert("eu-west-1".to_string(), vec!["10.2.0.0/16".to_string()]);

        let cfg = ServerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            state_store_path: temp_dir
                .path()
                .join("state")
                .to_str()
                .unwrap()
                .to_string(),
            public_bucket: BucketConfig {
                name: TEST_PUBLIC_BUCKET.to_string(),
                region: TEST_BUCKET_REGION.to_string(),
                endpoint: None,
                access_key_id: Some("AKIDEXAMPLE".to_string()),
                secret_access_key: Some("wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string()),
            },
            private_bucket: BucketConfig {
                name: TEST_PRIVATE_BUCKET.to_string(),
                region: TEST_BUCKET_REGION.to_string(),
                endpoint: None,
                access_key_id: Some("AKIDEXAMPLE".to_string()),
                secret_access_key: Some("wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string()),
            },
            azure: ContainerConfig {
                account: "devstoreaccount1".to_string(),
                container: "artifacts".to_string(),
                access_key: Some(AZURITE_DEV_KEY.to_string()),
            },
            cloud_mirror_host: TEST_CLOUD_MIRROR.to_string(),
            regions,
            scopes,
            ..Default::default()
        };
        let service = Service::new(cfg).await?;

        Ok(Self {
            service,
            _temp_dir: temp_dir,
        })
    }

    pub fn put_task(&self, task: &Task) -> Result<()> {
        self.service.store.put_task(task)
    }

    /// Pop the next published event off the in-memory queue.
    pub async fn next_event(&self) -> Result<serde_json::Value> {
        let consumer = self
            .service
            .event_consumer
            .as_ref()
            .expect("in-memory queue exposes a consumer");
        let mut consumer = consumer.lock().await;
        let delivery = tokio::time::timeout(Duration::from_secs(5), consumer.receive())
            .await
            .map_err(|_| anyhow!("timed out waiting for an event"))?
            .map_err(anyhow::Error::from)?;
        let payload = delivery
            .borrow_payload()
            .map(serde_json::from_slice::<serde_json::Value>)
            .transpose()?
            .ok_or_else(|| anyhow!("event delivery had no payload"))?;
        let _ = delivery.ack().await;
        Ok(payload)
    }
}
