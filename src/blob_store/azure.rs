use std::{env, time::Duration};

use anyhow::{anyhow, Context, Result};
use azure_storage::{
    shared_access_signature::service_sas::BlobSasPermissions, StorageCredentials,
};
use azure_storage_blobs::prelude::*;
use time::OffsetDateTime;
use tracing::debug;

use super::ContainerConfig;

/// Adapter over the Azure blob container. SAS tokens are HMAC-signed
/// locally with the account key.
pub struct BlobContainer {
    service: BlobServiceClient,
    container: String,
}

impl BlobContainer {
    pub fn new(config: &ContainerConfig) -> Result<Self> {
        let access_key = config
            .access_key
            .clone()
            .or_else(|| env::var("AZURE_STORAGE_KEY").ok())
            .ok_or_else(|| anyhow!("azure access key not configured and AZURE_STORAGE_KEY unset"))?;
        let credentials = StorageCredentials::access_key(config.account.clone(), access_key);
        let service = BlobServiceClient::new(&config.account, credentials);
        debug!(account = %config.account, container = %config.container, "created container adapter");
        Ok(BlobContainer {
            service,
            container: config.container.clone(),
        })
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// SAS URL granting time-bounded write access to one blob path.
    pub async fn generate_write_sas(&self, path: &str, ttl: Duration) -> Result<String> {
        let permissions = BlobSasPermissions {
            create: true,
            write: true,
            ..Default::default()
        };
        self.signed_url(path, permissions, ttl).await
    }

    /// SAS URL granting time-bounded read access to one blob path.
    pub async fn create_signed_get_url(&self, path: &str, ttl: Duration) -> Result<String> {
        let permissions = BlobSasPermissions {
            read: true,
            ..Default::default()
        };
        self.signed_url(path, permissions, ttl).await
    }

    async fn signed_url(
        &self,
        path: &str,
        permissions: BlobSasPermissions,
        ttl: Duration,
    ) -> Result<String> {
        let expiry = OffsetDateTime::now_utc() + time::Duration::seconds(ttl.as_secs() as i64);
        let blob_client = self
            .service
            .container_client(&self.container)
            .blob_client(path);
        let sas = blob_client
            .shared_access_signature(permissions, expiry)
            .await
            .with_context(|| format!("failed to generate sas for {path}"))?;
        let url = blob_client
            .generate_signed_blob_url(&sas)
            .with_context(|| format!("failed to build signed url for {path}"))?;
        Ok(url.to_string())
    }
}
