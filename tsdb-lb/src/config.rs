//! The cluster pool configuration file.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hyper::client::HttpConnector;
use hyper::{Client, Uri};
use serde::Deserialize;
use thiserror::Error;

use crate::backend::TsdbBackend;
use crate::serverpool::ServerPool;

/// Load balancer configuration, deserialized from TOML:
///
/// ```toml
/// probe_interval = "30s"
/// retry_count = 1
///
/// [[clusters]]
/// id = "hpc"
///
/// [[clusters.backends]]
/// url = "http://tsdb-hot:9090"
/// retention = "6h"
///
/// [[clusters.backends]]
/// url = "http://tsdb-cold:9090"
/// retention = "30d"
/// ```
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LbConfig {
    /// Cadence of the backend health probe.
    #[serde(with = "humantime_serde", default = "default_probe_interval")]
    pub probe_interval: Duration,
    /// How many times a request may move to the next backend after a
    /// transport failure.
    #[serde(default = "default_retry_count")]
    pub retry_count: usize,
    pub clusters: Vec<ClusterConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub id: String,
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    pub url: String,
    /// Oldest data this backend can answer a query for.
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_count() -> usize {
    1
}

/// A malformed pool is fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("no clusters configured")]
    EmptyPool,
    #[error("duplicate cluster id: {0}")]
    DuplicateCluster(String),
    #[error("cluster {0} has no backends")]
    EmptyCluster(String),
    #[error("backend {url} in cluster {cluster}: retention must be non-zero")]
    ZeroRetention { cluster: String, url: String },
    #[error("backend {url} in cluster {cluster}: invalid URL")]
    InvalidUrl { cluster: String, url: String },
}

impl LbConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        let config: LbConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.clusters.is_empty() {
            return Err(ConfigError::EmptyPool);
        }
        let mut seen = std::collections::HashSet::new();
        for cluster in &self.clusters {
            if !seen.insert(cluster.id.as_str()) {
                return Err(ConfigError::DuplicateCluster(cluster.id.clone()));
            }
            if cluster.backends.is_empty() {
                return Err(ConfigError::EmptyCluster(cluster.id.clone()));
            }
            for backend in &cluster.backends {
                if backend.retention.is_zero() {
                    return Err(ConfigError::ZeroRetention {
                        cluster: cluster.id.clone(),
                        url: backend.url.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Builds the server pool, all backends sharing one HTTP client.
    pub fn build_pool(&self, client: Client<HttpConnector>) -> Result<ServerPool, ConfigError> {
        let mut pool = ServerPool::new();
        for cluster in &self.clusters {
            for backend in &cluster.backends {
                let url: Uri = backend.url.parse().map_err(|_| ConfigError::InvalidUrl {
                    cluster: cluster.id.clone(),
                    url: backend.url.clone(),
                })?;
                pool.add(
                    cluster.id.clone(),
                    Arc::new(TsdbBackend::new(url, backend.retention, client.clone())),
                );
            }
        }
        Ok(pool)
    }
}
