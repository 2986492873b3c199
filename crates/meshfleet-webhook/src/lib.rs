//! Admission webhooks for meshfleet
//!
//! Typed defaulters and validators for the meshfleet CRDs and mesh
//! Ingresses, the pod sidecar injector, and the HTTPS server that hosts them.

pub mod adapter;
pub mod adapters;
mod error;
pub mod injector;
pub mod lookup;
pub mod registry;
pub mod server;

pub use adapter::{AdmissionHandler, Defaulter, MutatingAdapter, ValidatingAdapter, Validator};
pub use error::WebhookError;
pub use injector::SidecarInjector;
pub use lookup::{AdmissionLookup, KubeAdmissionLookup};
pub use registry::{WebhookEndpoint, WebhookRegistry, WebhookRule};
pub use server::{serve, webhook_router, WebhookServerConfig};
