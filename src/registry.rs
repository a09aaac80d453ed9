//! Registry-facing data model.
//!
//! The watcher reduces everything it learns from the registry to a stream of
//! [`ServiceUpdate`] messages. Per service the stream is totally ordered:
//! `NEW` first, then zero or more `CHANGED`, then a terminal `DELETED`.

use std::collections::HashMap;

pub mod consul;

/// A live instance of a registered service, keyed by node name within its
/// service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    pub host: String,
    pub address: String,
    /// Carried as a string; the cloud API consumes the string form.
    pub port: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    New,
    Changed,
    Deleted,
}

impl UpdateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateKind::New => "new",
            UpdateKind::Changed => "changed",
            UpdateKind::Deleted => "deleted",
        }
    }
}

/// One transition observed for a service.
///
/// `NEW` and `DELETED` carry an empty instance map; `CHANGED` carries the
/// full current membership. `tag` is the watched tag the service qualified
/// under.
#[derive(Debug, Clone)]
pub struct ServiceUpdate {
    pub service_name: String,
    pub kind: UpdateKind,
    pub tag: String,
    pub instances: HashMap<String, ServiceInstance>,
}

impl ServiceUpdate {
    pub fn new(service_name: impl Into<String>, kind: UpdateKind, tag: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            kind,
            tag: tag.into(),
            instances: HashMap::new(),
        }
    }

    pub fn with_instances(mut self, instances: HashMap<String, ServiceInstance>) -> Self {
        self.instances = instances;
        self
    }
}
