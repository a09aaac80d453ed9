//! Control-plane daemon that keeps a Google Cloud HTTP(S) load balancer in
//! sync with a Consul service catalog.
//!
//! Services carrying a configured routing tag are discovered through Consul's
//! blocking queries, provisioned as network endpoint group / health check /
//! backend service triples, wired into a shared URL map, and thereafter have
//! their endpoint membership reconciled against the live catalog.

pub mod cloud;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod reconciler;
pub mod registry;
pub mod tag;
