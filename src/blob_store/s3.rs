use std::time::Duration;

use anyhow::{Context, Result};
use aws_sdk_s3::{
    config::{BehaviorVersion, Credentials, Region},
    presigning::PresigningConfig,
    Client,
};
use tracing::debug;

use super::{encode_object_key, BucketConfig};

/// Adapter over one S3-compatible bucket.
///
/// Signing happens locally against the configured credentials, so the hot
/// paths never touch the network.
pub struct Bucket {
    client: Client,
    name: String,
    region: String,
    endpoint: Option<String>,
}

impl Bucket {
    pub async fn new(config: &BucketConfig) -> Result<Self> {
        let client = match (&config.access_key_id, &config.secret_access_key) {
            (Some(id), Some(secret)) => {
                let credentials = Credentials::new(id, secret, None, None, "static");
                let mut builder = aws_sdk_s3::config::Builder::new()
                    .behavior_version(BehaviorVersion::latest())
                    .region(Region::new(config.region.clone()))
                    .credentials_provider(credentials);
                if let Some(endpoint) = &config.endpoint {
                    builder = builder.endpoint_url(endpoint).force_path_style(true);
                }
                Client::from_conf(builder.build())
            }
            _ => {
                let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .region(Region::new(config.region.clone()));
                if let Some(endpoint) = &config.endpoint {
                    loader = loader.endpoint_url(endpoint);
                }
                Client::new(&loader.load().await)
            }
        };
        debug!(bucket = %config.name, region = %config.region, "created bucket adapter");
        Ok(Bucket {
            client,
            name: config.name.clone(),
            region: config.region.clone(),
            endpoint: config.endpoint.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Presigned PUT URL bound to the given content type.
    pub async fn create_put_url(
        &self,
        key: &str,
        content_type: &str,
        ttl: Duration,
    ) -> Result<String> {
        let presigning_config =
            PresigningConfig::expires_in(ttl).context("invalid put url expiry")?;
        let presigned = self
            .client
            .put_object()
            .bucket(&self.name)
            .key(key)
            .content_type(content_type)
            .presigned(presigning_config)
            .await
            .with_context(|| format!("failed to presign put url for {key}"))?;
        Ok(presigned.uri().to_string())
    }

    /// Un-signed GET URL for world-readable objects.
    ///
    /// The default form resolves through the bucket's CDN-compatible global
    /// endpoint; `same_region` selects the direct regional bucket host,
    /// bypassing any CDN in front of it.
    pub fn create_get_url(&self, key: &str, same_region: bool) -> String {
        let key = encode_object_key(key);
        if let Some(endpoint) = &self.endpoint {
            return format!("{}/{}/{}", endpoint.trim_end_matches('/'), self.name, key);
        }
        if same_region {
            format!("https://{}.s3.{}.amazonaws.com/{}", self.name, self.region, key)
        } else {
            format!("https://{}.s3.amazonaws.com/{}", self.name, key)
        }
    }

    /// Presigned GET URL for objects in a private bucket.
    pub async fn create_signed_get_url(&self, key: &str, ttl: Duration) -> Result<String> {
        let presigning_config =
            PresigningConfig::expires_in(ttl).context("invalid get url expiry")?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.name)
            .key(key)
            .presigned(presigning_config)
            .await
            .with_context(|| format!("failed to presign get url for {key}"))?;
        Ok(presigned.uri().to_string())
    }
}
