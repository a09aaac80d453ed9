//! The narrow cloud interface the reconcilers consume.
//!
//! Reconcilers never talk to the compute API directly; everything goes
//! through [`Cloud`], which keeps the state machine testable against a fake
//! and confines REST plumbing to [`gce`].

use async_trait::async_trait;

use crate::errors::Result;
use crate::tag::Affinity;

pub mod gce;
pub mod urlmap;

/// A single `(instance, ip, port)` entry of a network endpoint group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct NetworkEndpoint {
    pub instance: String,
    pub ip: String,
    pub port: String,
}

impl NetworkEndpoint {
    /// Builds an endpoint from registry data. The compute API addresses
    /// instances by short hostname, so anything at or after the first `.` of
    /// the node name is dropped (`minion-2.c.proj.internal` → `minion-2`).
    pub fn from_instance(host: &str, address: &str, port: &str) -> Self {
        Self {
            instance: short_instance_name(host).to_string(),
            ip: address.to_string(),
            port: port.to_string(),
        }
    }
}

pub fn short_instance_name(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

/// Operations the reconciler needs from the cloud.
///
/// Every create treats the cloud's "already exists" answer as success, so the
/// bring-up sequence can be retried after partial progress.
#[async_trait]
pub trait Cloud: Send + Sync {
    /// Creates a zonal network endpoint group of type `GCE_VM_IP_PORT`.
    async fn create_network_endpoint_group(&self, name: &str) -> Result<()>;

    /// Creates an HTTP health check; an empty path defaults to `/`.
    async fn create_health_check(&self, name: &str, path: &str) -> Result<()>;

    /// Creates a global backend service backed by the named group.
    async fn create_backend_service(
        &self,
        name: &str,
        neg_name: &str,
        hc_name: &str,
        affinity: Affinity,
        cdn: bool,
    ) -> Result<()>;

    /// Routes `host`/`path` to the named backend service in a pre-existing
    /// URL map. The map is shared by every reconciler; implementations must
    /// serialize the read-modify-write globally.
    async fn update_url_map(
        &self,
        url_map_name: &str,
        bs_name: &str,
        host: &str,
        path: &str,
    ) -> Result<()>;

    async fn attach_endpoints(&self, neg_name: &str, endpoints: &[NetworkEndpoint]) -> Result<()>;

    async fn detach_endpoints(&self, neg_name: &str, endpoints: &[NetworkEndpoint]) -> Result<()>;
}
