//! Fleet connectors and ServiceExport federation
//!
//! The [`Supervisor`] keeps one [`Connector`] per Cluster record. Each
//! connector watches the ServiceExports of its cluster and publishes them on
//! the in-process [`MessageBus`]; the supervisor decides on every new export
//! and every connector applies the decisions to its own cluster. The home
//! cluster's connector additionally mirrors Services, Endpoints and Ingresses
//! into the service registry and ingress config documents.

#![warn(missing_docs)]

pub mod bus;
pub mod connector;
pub mod exports;
pub mod federation;
pub mod fleet;
pub mod local;
pub mod remote;
pub mod supervisor;

pub use bus::{Geo, Message, MessageBus, MessageKind};
pub use connector::{ClusterCodebases, ClusterConnector, Connector, ConnectorDeps};
pub use federation::Decision;
pub use fleet::{FleetApi, KubeFleetApi};
pub use supervisor::{
    ConnectorFactory, KubeConnectorFactory, KubeSupervisorApi, Supervisor, SupervisorKube,
    SupervisorParts,
};

/// Server-side timeout of every watch
pub const WATCH_TIMEOUT_SECS: u32 = 25;
