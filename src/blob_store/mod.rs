pub mod azure;
pub mod s3;

use serde::{Deserialize, Serialize};

pub use self::{azure::BlobContainer, s3::Bucket};

/// Configuration for one S3-compatible bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketConfig {
    pub name: String,
    pub region: String,
    /// Endpoint override for S3-compatible stores (minio, localstack).
    pub endpoint: Option<String>,
    /// Static credentials; the ambient AWS credential chain is used when
    /// unset.
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl Default for BucketConfig {
    fn default() -> Self {
        BucketConfig {
            name: "artifacts".to_string(),
            region: "us-east-1".to_string(),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
        }
    }
}

/// Configuration for the Azure blob container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub account: String,
    pub container: String,
    /// Falls back to the AZURE_STORAGE_KEY environment variable when unset.
    pub access_key: Option<String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        ContainerConfig {
            account: "artifacts".to_string(),
            container: "artifacts".to_string(),
            access_key: None,
        }
    }
}

/// Percent-encode an object key, keeping the `/` separators intact.
pub(crate) fn encode_object_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
