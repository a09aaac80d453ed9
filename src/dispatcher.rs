//! Routes service updates to per-service reconcilers.
//!
//! The channel map is owned by the dispatch loop alone; no other task reads
//! or writes it. Forwarding is a blocking send on a capacity-one channel, so
//! a slow reconciler backpressures the watcher instead of piling up updates.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cloud::Cloud;
use crate::config::Config;
use crate::reconciler::Reconciler;
use crate::registry::ServiceUpdate;
use crate::tag::TagParser;

pub struct Dispatcher {
    config: Arc<Config>,
    parser: Arc<TagParser>,
    cloud: Arc<dyn Cloud>,
}

impl Dispatcher {
    pub fn new(config: Arc<Config>, parser: Arc<TagParser>, cloud: Arc<dyn Cloud>) -> Self {
        Self {
            config,
            parser,
            cloud,
        }
    }

    /// Consumes the watcher's update stream until it closes or shutdown
    /// fires, then waits for every reconciler to finish.
    pub async fn run(
        self,
        mut updates: mpsc::Receiver<ServiceUpdate>,
        mut shutdown: watch::Receiver<()>,
    ) {
        let mut workers: HashMap<String, mpsc::Sender<ServiceUpdate>> = HashMap::new();
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        loop {
            let update = tokio::select! {
                _ = shutdown.changed() => break,
                update = updates.recv() => update,
            };
            let Some(update) = update else { break };

            let service_name = update.service_name.clone();
            if !workers.contains_key(&service_name) {
                info!("starting a reconciler for service {}", service_name);
                let (worker_tx, worker_rx) = mpsc::channel(1);
                let reconciler = Reconciler::new(
                    service_name.clone(),
                    update.tag.clone(),
                    self.config.clone(),
                    self.parser.clone(),
                    self.cloud.clone(),
                );
                handles.push(tokio::spawn(reconciler.run(worker_rx, shutdown.clone())));
                workers.insert(service_name.clone(), worker_tx);
            }

            let worker = &workers[&service_name];
            if worker.send(update).await.is_err() {
                // The reconciler gave up on this service (unresolvable tag).
                warn!("reconciler for service {} is gone; dropping update", service_name);
                workers.remove(&service_name);
            }
        }

        debug!("dispatcher waiting on {} reconcilers", handles.len());
        drop(workers);
        for handle in handles {
            let _ = handle.await;
        }
        debug!("dispatcher stopped");
    }
}
