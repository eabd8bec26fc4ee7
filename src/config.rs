use std::{collections::HashMap, env, net::SocketAddr};

use anyhow::Result;
use figment::{
    providers::{Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::{
    blob_store::{BucketConfig, ContainerConfig},
    events::QueueConfig,
    region::RegionResolver,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub state_store_path: String,
    pub public_bucket: BucketConfig,
    pub private_bucket: BucketConfig,
    pub azure: ContainerConfig,
    pub cloud_mirror_host: String,
    /// Region tag -> CIDR blocks, used to route public s3 downloads.
    pub regions: HashMap<String, Vec<String>>,
    pub queue: QueueConfig,
    /// Scopes granted to callers by the built-in authorizer. Deployments
    /// fronted by a real auth service leave this empty and swap the
    /// authorizer out at wiring time.
    pub scopes: Vec<String>,
    pub reaper_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let state_store_path = env::current_dir()
            .unwrap()
            .join("artifact_broker_storage/state");
        ServerConfig {
            listen_addr: "0.0.0.0:8900".to_string(),
            state_store_path: state_store_path.to_str().unwrap().to_string(),
            public_bucket: BucketConfig {
                name: "task-artifacts-public".to_string(),
                ..Default::default()
            },
            private_bucket: BucketConfig {
                name: "task-artifacts-private".to_string(),
                ..Default::default()
            },
            azure: Default::default(),
            cloud_mirror_host: "cloud-mirror.taskcluster.net".to_string(),
            regions: HashMap::new(),
            queue: Default::default(),
            scopes: vec!["queue:*".to_string(), "assume:*".to_string()],
            reaper_interval_secs: 600,
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: ServerConfig = Figment::from(Serialized::defaults(ServerConfig::default()))
            .merge(Yaml::string(&config_str))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "invalid listen address: {}",
                self.listen_addr
            ));
        }
        if self.public_bucket.name == self.private_bucket.name {
            return Err(anyhow::anyhow!(
                "public and private buckets must differ, both are {}",
                self.public_bucket.name
            ));
        }
        // Surfaces malformed CIDR blocks at startup instead of first lookup.
        RegionResolver::new(&self.regions)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_overrides_defaults() {
        let yaml = r#"
listen_addr: "127.0.0.1:9999"
public_bucket:
  name: pub-bkt
  region: eu-west-1
regions:
  eu-west-1:
    - "10.2.0.0/16"
"#;
        let config: ServerConfig = Figment::from(Serialized::defaults(ServerConfig::default()))
            .merge(Yaml::string(yaml))
            .extract()
            .unwrap();
        config.validate().unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9999");
        assert_eq!(config.public_bucket.name, "pub-bkt");
        assert_eq!(config.private_bucket.name, "task-artifacts-private");
        assert_eq!(config.reaper_interval_secs, 600);
    }

    #[test]
    fn test_validate_rejects_shared_bucket() {
        let config = ServerConfig {
            public_bucket: BucketConfig {
                name: "same".to_string(),
                ..Default::default()
            },
            private_bucket: BucketConfig {
                name: "same".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
