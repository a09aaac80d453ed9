//! Daemon configuration.
//!
//! Loaded once at startup from a JSON file. The `tags` table doubles as the
//! watch list: every key is a tag the registry watcher subscribes to, and the
//! value carries the per-tag provisioning settings the registry itself cannot
//! supply (health-check path, resource reuse).

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::errors::{DaemonError, Result};

pub const DEFAULT_TAG_PREFIX: &str = "urlprefix-";

fn default_tag_prefix() -> String {
    DEFAULT_TAG_PREFIX.to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthCheckConfig {
    /// Only `http` checks are supported.
    #[serde(rename = "type", default)]
    pub check_type: String,
    /// Request path; empty means `/`.
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TagConfig {
    /// Skip resource bring-up and attach endpoints to a pre-provisioned
    /// network endpoint group instead.
    pub reuse_resources: bool,
    /// Name of the pre-provisioned group; only read when `reuse_resources`.
    pub network_endpoint_group_name: String,
    pub health_check: HealthCheckConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsulConfig {
    /// `host:port` of the Consul agent; a scheme may be included.
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudConfig {
    pub project: String,
    pub network: String,
    pub zone: String,
    pub url_map: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,
    pub tags: HashMap<String, TagConfig>,
    pub consul: ConsulConfig,
    pub cloud: CloudConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| DaemonError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| DaemonError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The watched tag set, sorted for stable iteration.
    pub fn tag_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tags.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn tag(&self, tag: &str) -> Result<&TagConfig> {
        self.tags
            .get(tag)
            .ok_or_else(|| DaemonError::UnknownTag(tag.to_string()))
    }
}
