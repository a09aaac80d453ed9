//! Consul-backed service watcher.
//!
//! Two levels of blocking queries keep the picture live. A catalog watcher
//! long-polls `/v1/catalog/services` and diffs each answer against the set of
//! services already being watched; qualifying newcomers get a NEW update and
//! a dedicated node watcher, disappeared services get a terminal DELETED.
//! Each node watcher long-polls `/v1/catalog/service/<name>` and reports the
//! full membership as a CHANGED update whenever the service's index moves.
//!
//! All updates funnel through one internal channel so that a single loop owns
//! the upstream sender; nothing can be emitted for a service after its
//! DELETED went out.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::errors::{DaemonError, Result};
use crate::registry::{ServiceInstance, ServiceUpdate, UpdateKind};

const WATCH_WAIT: &str = "30s";
const RETRY_INTERVAL: Duration = Duration::from_secs(15);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Blocking queries are bounded by `WATCH_WAIT` plus Consul's jitter;
/// anything slower is a dead connection.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(45);
const INDEX_HEADER: &str = "X-Consul-Index";
/// Consul's own catalog entry, never a candidate for watching.
const CONSUL_SERVICE: &str = "consul";
const INTERNAL_CHANNEL_CAPACITY: usize = 16;

/// Internal notice from the watch loops to the demultiplexing loop.
enum WatchEvent {
    Discovered {
        name: String,
        tag: String,
    },
    Vanished {
        name: String,
    },
    Instances {
        name: String,
        instances: HashMap<String, ServiceInstance>,
    },
}

struct WatchedService {
    tag: String,
    stop: watch::Sender<()>,
    task: JoinHandle<()>,
}

/// Watcher over a single Consul agent.
#[derive(Clone)]
pub struct ConsulRegistry {
    client: reqwest::Client,
    base_url: String,
    tags_to_watch: BTreeSet<String>,
}

impl ConsulRegistry {
    pub fn new(url: &str, tags_to_watch: impl IntoIterator<Item = String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: normalize_base_url(url),
            tags_to_watch: tags_to_watch.into_iter().collect(),
        })
    }

    /// Runs the watcher until `shutdown` fires, emitting updates on
    /// `upstream`. Sends block until the dispatcher takes them, so downstream
    /// backpressure reaches the long-poll loops.
    pub async fn run(
        self,
        upstream: mpsc::Sender<ServiceUpdate>,
        mut shutdown: watch::Receiver<()>,
    ) {
        let (events_tx, mut events_rx) = mpsc::channel(INTERNAL_CHANNEL_CAPACITY);
        let catalog = spawn_catalog_watcher(self.clone(), events_tx.clone(), shutdown.clone());
        let mut services: HashMap<String, WatchedService> = HashMap::new();

        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => break,
                event = events_rx.recv() => event,
            };
            let Some(event) = event else { break };

            match event {
                WatchEvent::Discovered { name, tag } => {
                    debug!("service {} qualified under tag {}", name, tag);
                    let update = ServiceUpdate::new(name.clone(), UpdateKind::New, tag.clone());
                    if !send_update(&upstream, update, &mut shutdown).await {
                        break;
                    }
                    let (stop_tx, stop_rx) = watch::channel(());
                    let task = spawn_node_watcher(
                        self.clone(),
                        name.clone(),
                        events_tx.clone(),
                        stop_rx,
                        shutdown.clone(),
                    );
                    services.insert(
                        name,
                        WatchedService {
                            tag,
                            stop: stop_tx,
                            task,
                        },
                    );
                }
                WatchEvent::Instances { name, instances } => {
                    // A node update racing with removal must not be delivered
                    // after the service's DELETED.
                    let Some(service) = services.get(&name) else {
                        continue;
                    };
                    let update = ServiceUpdate::new(name, UpdateKind::Changed, service.tag.clone())
                        .with_instances(instances);
                    if !send_update(&upstream, update, &mut shutdown).await {
                        break;
                    }
                }
                WatchEvent::Vanished { name } => {
                    let Some(service) = services.remove(&name) else {
                        continue;
                    };
                    let _ = service.stop.send(());
                    let update = ServiceUpdate::new(name, UpdateKind::Deleted, service.tag);
                    if !send_update(&upstream, update, &mut shutdown).await {
                        break;
                    }
                    let _ = service.task.await;
                }
            }
        }

        // Dropping the receiver unblocks any watcher mid-send.
        drop(events_rx);
        for (_, service) in services {
            let _ = service.stop.send(());
            let _ = service.task.await;
        }
        let _ = catalog.await;
        debug!("registry watcher stopped");
    }

    async fn poll_catalog(
        &self,
        last_index: u64,
    ) -> Result<Option<(u64, HashMap<String, Vec<String>>)>> {
        let url = format!("{}/v1/catalog/services", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("index", last_index.to_string()),
                ("wait", WATCH_WAIT.to_string()),
            ])
            .send()
            .await?;
        let response = check_registry_status(response, "catalog query").await?;
        let index = consul_index(&response)?;
        if index == last_index {
            // The blocking query timed out with no change.
            return Ok(None);
        }
        let services = response.json().await?;
        Ok(Some((index, services)))
    }

    async fn poll_service(
        &self,
        name: &str,
        last_index: u64,
    ) -> Result<Option<(u64, HashMap<String, ServiceInstance>)>> {
        let url = format!("{}/v1/catalog/service/{}", self.base_url, name);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("index", last_index.to_string()),
                ("wait", WATCH_WAIT.to_string()),
            ])
            .send()
            .await?;
        let response = check_registry_status(response, "service query").await?;
        let index = consul_index(&response)?;
        if index == last_index {
            return Ok(None);
        }

        let nodes: Vec<CatalogNode> = response.json().await?;
        let mut instances = HashMap::with_capacity(nodes.len());
        for node in nodes {
            instances.insert(
                node.node.clone(),
                ServiceInstance {
                    host: node.node,
                    address: node.address,
                    port: node.service_port.to_string(),
                    tags: node.service_tags,
                },
            );
        }
        Ok(Some((index, instances)))
    }

    /// The watched tag a service qualifies under, if any. The watch set is
    /// ordered, so the first hit is the lexicographically smallest matching
    /// tag regardless of how the catalog ordered the service's tags.
    fn matching_tag(&self, tags: &[String]) -> Option<String> {
        self.tags_to_watch
            .iter()
            .find(|tag| tags.contains(tag))
            .cloned()
    }
}

fn spawn_catalog_watcher(
    registry: ConsulRegistry,
    events_tx: mpsc::Sender<WatchEvent>,
    mut shutdown: watch::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_index: u64 = 0;
        let mut watched: HashSet<String> = HashSet::new();

        loop {
            let result = tokio::select! {
                _ = shutdown.changed() => return,
                result = registry.poll_catalog(last_index) => result,
            };

            match result {
                Ok(Some((index, catalog))) => {
                    last_index = index;

                    for (name, tags) in &catalog {
                        if name == CONSUL_SERVICE || watched.contains(name) {
                            continue;
                        }
                        let Some(tag) = registry.matching_tag(tags) else {
                            continue;
                        };
                        watched.insert(name.clone());
                        let event = WatchEvent::Discovered {
                            name: name.clone(),
                            tag,
                        };
                        if !send_event(&events_tx, event, &mut shutdown).await {
                            return;
                        }
                    }

                    let gone: Vec<String> = watched
                        .iter()
                        .filter(|name| !catalog.contains_key(*name))
                        .cloned()
                        .collect();
                    for name in gone {
                        watched.remove(&name);
                        if !send_event(&events_tx, WatchEvent::Vanished { name }, &mut shutdown)
                            .await
                        {
                            return;
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!("error refreshing service list: {}", e);
                    if !sleep_through(RETRY_INTERVAL, &mut shutdown).await {
                        return;
                    }
                }
            }
        }
    })
}

fn spawn_node_watcher(
    registry: ConsulRegistry,
    name: String,
    events_tx: mpsc::Sender<WatchEvent>,
    mut stop: watch::Receiver<()>,
    mut shutdown: watch::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_index: u64 = 0;

        loop {
            let result = tokio::select! {
                _ = stop.changed() => return,
                _ = shutdown.changed() => return,
                result = registry.poll_service(&name, last_index) => result,
            };

            match result {
                Ok(Some((index, instances))) => {
                    last_index = index;
                    let event = WatchEvent::Instances {
                        name: name.clone(),
                        instances,
                    };
                    let sent = tokio::select! {
                        _ = stop.changed() => return,
                        _ = shutdown.changed() => return,
                        sent = events_tx.send(event) => sent,
                    };
                    if sent.is_err() {
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("error refreshing service {}: {}", name, e);
                    let done = tokio::select! {
                        _ = stop.changed() => true,
                        _ = shutdown.changed() => true,
                        _ = sleep(RETRY_INTERVAL) => false,
                    };
                    if done {
                        return;
                    }
                }
            }
        }
    })
}

/// Forwards an update upstream unless shutdown fires first; returns false
/// when the loop should stop.
async fn send_update(
    upstream: &mpsc::Sender<ServiceUpdate>,
    update: ServiceUpdate,
    shutdown: &mut watch::Receiver<()>,
) -> bool {
    tokio::select! {
        _ = shutdown.changed() => false,
        sent = upstream.send(update) => sent.is_ok(),
    }
}

async fn send_event(
    events_tx: &mpsc::Sender<WatchEvent>,
    event: WatchEvent,
    shutdown: &mut watch::Receiver<()>,
) -> bool {
    tokio::select! {
        _ = shutdown.changed() => false,
        sent = events_tx.send(event) => sent.is_ok(),
    }
}

/// Sleeps unless shutdown fires first; returns false when the loop should
/// stop.
async fn sleep_through(duration: Duration, shutdown: &mut watch::Receiver<()>) -> bool {
    tokio::select! {
        _ = shutdown.changed() => false,
        _ = sleep(duration) => true,
    }
}

async fn check_registry_status(
    response: reqwest::Response,
    context: &str,
) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(DaemonError::Registry(format!(
        "{} returned {}: {}",
        context, status, body
    )))
}

fn consul_index(response: &reqwest::Response) -> Result<u64> {
    response
        .headers()
        .get(INDEX_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| {
            DaemonError::Registry(format!("missing or invalid {} header", INDEX_HEADER))
        })
}

fn normalize_base_url(url: &str) -> String {
    let url = url.trim_end_matches('/');
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    }
}

/// One node entry from `/v1/catalog/service/<name>`.
#[derive(Debug, Deserialize)]
struct CatalogNode {
    #[serde(rename = "Node")]
    node: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "ServiceTags", default)]
    service_tags: Vec<String>,
    #[serde(rename = "ServicePort")]
    service_port: u16,
}
