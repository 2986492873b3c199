//! meshfleet operator: reconcilers, repo bootstrap, and process wiring
//!
//! The manager binary hosts every controller plus the admission webhooks
//! and the connector supervisor. The connector binary runs one connector
//! out of process.

#![deny(missing_docs)]

/// Repo seeding, codebase derivation, and the periodic rebuild
pub mod bootstrap;
/// Process configuration from YAML and environment
pub mod config;
/// Controller construction
pub mod controller_runner;
/// CRD installation and manifest output
pub mod crds;
/// Gateway API routing document
pub mod gateway;
/// Liveness and readiness endpoints
pub mod health;
/// Per-namespace ingress workloads
pub mod namespaced_ingress;
/// ProxyProfile ConfigMaps, codebases, and restarts
pub mod proxy_profile;
/// Built-in LoadBalancer Services
pub mod service_lb;
/// Startup helpers shared by both binaries
pub mod startup;

#[cfg(test)]
mod testing;
