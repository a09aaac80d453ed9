//! Per-service reconciliation.
//!
//! Each service gets one reconciler task consuming its update channel in
//! arrival order. A NEW update brings the service group's cloud resources up
//! (or adopts a pre-provisioned group), CHANGED updates diff the last-seen
//! membership against the registry's and drive endpoint attach/detach calls,
//! and DELETED detaches everything while leaving the resources in place for
//! operators to clean up.
//!
//! Cloud failures never escape this module: they are logged and the state
//! machine carries on, relying on idempotent creates and the next update to
//! converge.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::cloud::{Cloud, NetworkEndpoint};
use crate::config::Config;
use crate::errors::{DaemonError, Result};
use crate::registry::{ServiceInstance, ServiceUpdate, UpdateKind};
use crate::tag::{resource_name, TagInfo, TagParser};

/// Cloud resources backing one service group.
#[derive(Debug, Clone)]
enum GroupResources {
    /// Provisioned and owned by this daemon.
    Managed {
        neg: String,
        hc: String,
        bs: String,
        info: TagInfo,
        health_path: String,
    },
    /// Pre-provisioned elsewhere; only endpoint membership is managed.
    Reused { neg: String },
}

impl GroupResources {
    fn neg_name(&self) -> &str {
        match self {
            GroupResources::Managed { neg, .. } => neg,
            GroupResources::Reused { neg } => neg,
        }
    }
}

pub struct Reconciler {
    service_name: String,
    tag: String,
    config: Arc<Config>,
    parser: Arc<TagParser>,
    cloud: Arc<dyn Cloud>,
    resources: Option<GroupResources>,
    is_running: bool,
    /// The endpoints this daemon believes are attached to the group.
    known: HashMap<String, ServiceInstance>,
}

impl Reconciler {
    pub fn new(
        service_name: String,
        tag: String,
        config: Arc<Config>,
        parser: Arc<TagParser>,
        cloud: Arc<dyn Cloud>,
    ) -> Self {
        Self {
            service_name,
            tag,
            config,
            parser,
            cloud,
            resources: None,
            is_running: false,
            known: HashMap::new(),
        }
    }

    /// Processes updates until the channel closes or shutdown fires. A tag
    /// that cannot be resolved ends the task; the service stays un-reconciled
    /// until its configuration is fixed.
    pub async fn run(
        mut self,
        mut updates: mpsc::Receiver<ServiceUpdate>,
        mut shutdown: watch::Receiver<()>,
    ) {
        loop {
            let update = tokio::select! {
                _ = shutdown.changed() => {
                    debug!("reconciler for service {} stopping", self.service_name);
                    return;
                }
                update = updates.recv() => update,
            };
            let Some(update) = update else { return };

            match update.kind {
                UpdateKind::New => {
                    if let Err(e) = self.handle_new().await {
                        match e {
                            DaemonError::MalformedTag(_) | DaemonError::UnknownTag(_) => {
                                error!("cannot reconcile service {}: {}", self.service_name, e);
                                return;
                            }
                            e => error!(
                                "failed initializing service {} with tag {}: {}",
                                self.service_name, self.tag, e
                            ),
                        }
                    }
                }
                UpdateKind::Changed => self.handle_changed(update.instances).await,
                UpdateKind::Deleted => self.handle_deleted().await,
            }
        }
    }

    async fn handle_new(&mut self) -> Result<()> {
        if self.is_running {
            return Ok(());
        }

        let resources = match &self.resources {
            Some(resources) => resources.clone(),
            None => {
                let resources = self.resolve_resources()?;
                self.resources = Some(resources.clone());
                resources
            }
        };

        match &resources {
            GroupResources::Reused { neg } => {
                info!(
                    "service {} reuses pre-provisioned group {}",
                    self.service_name, neg
                );
            }
            GroupResources::Managed {
                neg,
                hc,
                bs,
                info,
                health_path,
            } => {
                info!(
                    "initializing service {} with tag {}",
                    self.service_name, self.tag
                );
                self.cloud.create_network_endpoint_group(neg).await?;
                self.cloud.create_health_check(hc, health_path).await?;
                self.cloud
                    .create_backend_service(bs, neg, hc, info.affinity, info.cdn)
                    .await?;
                self.cloud
                    .update_url_map(&self.config.cloud.url_map, bs, &info.host, &info.path)
                    .await?;
            }
        }

        self.is_running = true;
        info!(
            "watching service {} with tag {}",
            self.service_name, self.tag
        );
        Ok(())
    }

    async fn handle_changed(&mut self, incoming: HashMap<String, ServiceInstance>) {
        if !self.is_running {
            warn!(
                "ignoring update for service {} with tag {} because it is not running",
                self.service_name, self.tag
            );
            return;
        }
        let Some(resources) = self.resources.clone() else {
            return;
        };
        let neg = resources.neg_name();

        // The node name is the identity: an instance whose address or port
        // mutated under an unchanged node key counts as unchanged.
        let mut to_detach = Vec::new();
        self.known.retain(|node, instance| {
            if incoming.contains_key(node) {
                true
            } else {
                to_detach.push(endpoint_for(instance));
                false
            }
        });

        let mut to_attach = Vec::new();
        for (node, instance) in incoming {
            if !self.known.contains_key(&node) {
                to_attach.push(endpoint_for(&instance));
                self.known.insert(node, instance);
            }
        }

        if !to_detach.is_empty() {
            if let Err(e) = self.cloud.detach_endpoints(neg, &to_detach).await {
                error!("failed detaching endpoints from {}: {}", neg, e);
            }
        }
        if !to_attach.is_empty() {
            if let Err(e) = self.cloud.attach_endpoints(neg, &to_attach).await {
                error!("failed attaching endpoints to {}: {}", neg, e);
            }
        }
    }

    async fn handle_deleted(&mut self) {
        if !self.is_running {
            return;
        }

        let to_detach: Vec<NetworkEndpoint> = self.known.values().map(endpoint_for).collect();
        self.known.clear();

        if !to_detach.is_empty() {
            if let Some(resources) = &self.resources {
                if let Err(e) = self
                    .cloud
                    .detach_endpoints(resources.neg_name(), &to_detach)
                    .await
                {
                    error!(
                        "failed detaching endpoints from {}: {}",
                        resources.neg_name(),
                        e
                    );
                }
            }
        }

        self.is_running = false;
        // The group's NEG, health check, backend service and URL-map rules
        // stay behind; removing them is an operator decision.
        info!(
            "service {} left the registry; endpoints detached",
            self.service_name
        );
    }

    fn resolve_resources(&self) -> Result<GroupResources> {
        let tag_config = self.config.tag(&self.tag)?;
        if tag_config.reuse_resources {
            return Ok(GroupResources::Reused {
                neg: tag_config.network_endpoint_group_name.clone(),
            });
        }
        let info = self.parser.parse(&self.tag)?;
        let group = info.group();
        Ok(GroupResources::Managed {
            neg: resource_name("neg", &group),
            hc: resource_name("hc", &group),
            bs: resource_name("bs", &group),
            health_path: tag_config.health_check.path.clone(),
            info,
        })
    }
}

fn endpoint_for(instance: &ServiceInstance) -> NetworkEndpoint {
    NetworkEndpoint::from_instance(&instance.host, &instance.address, &instance.port)
}
