//! Mesh config store, change listeners, and certificate management
//!
//! The [`MeshConfigStore`] keeps the current [`MeshConfig`] snapshot and
//! fans changes out to a fixed list of listeners. Listeners translate config
//! changes into repo documents and rollouts; they never write back into the
//! store.
//!
//! [`MeshConfig`]: meshfleet_common::mesh_config::MeshConfig

#![deny(missing_docs)]

pub mod cert;
pub mod listeners;
pub mod store;

pub use cert::{ArchonCertManager, CaStore, CertManager, KubeCaStore};
pub use store::{KubeMeshConfigApi, MeshConfigApi, MeshConfigListener, MeshConfigStore};
