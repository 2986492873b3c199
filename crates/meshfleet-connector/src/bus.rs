//! In-process message bus between the supervisor and connectors
//!
//! Every subscriber sees every message; handlers filter on the exporting
//! cluster themselves. A lagging subscriber loses the oldest messages, which
//! is tolerable because every export is republished when its
//! resourceVersion changes and the supervisor requeues each Cluster.

use k8s_openapi::api::core::v1::Service;
use tokio::sync::broadcast;
use tracing::debug;

use meshfleet_common::crd::{ClusterKey, ServiceExport};

/// Default number of buffered messages per subscriber
pub const DEFAULT_CAPACITY: usize = 256;

/// What happened to an export
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    /// An export was created or changed in its cluster
    ServiceExportCreated,
    /// An export was removed from its cluster
    ServiceExportDeleted,
    /// The control plane accepted an export
    ServiceExportAccepted,
    /// The control plane rejected an export
    ServiceExportRejected,
}

/// Where an export comes from
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Geo {
    /// Exporting cluster
    pub cluster_key: ClusterKey,
    /// Gateway address peers reach the exporting cluster through
    pub gateway: Option<String>,
}

/// Payload carried on the bus
#[derive(Clone, Debug)]
pub struct Message {
    /// Message kind
    pub kind: MessageKind,
    /// Exporting cluster
    pub geo: Geo,
    /// The export
    pub service_export: ServiceExport,
    /// The exported Service, when known
    pub service: Option<Service>,
    /// Rejection reason
    pub error: Option<String>,
}

impl Message {
    /// Message about `export` from `geo`
    pub fn new(kind: MessageKind, geo: Geo, service_export: ServiceExport) -> Self {
        Self {
            kind,
            geo,
            service_export,
            service: None,
            error: None,
        }
    }

    /// Attach the exported Service
    pub fn with_service(mut self, service: Service) -> Self {
        self.service = Some(service);
        self
    }

    /// Attach a rejection reason
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// True when `key` is the exporting cluster
    pub fn is_from(&self, key: &ClusterKey) -> bool {
        &self.geo.cluster_key == key
    }
}

/// Broadcast bus of [`Message`]s
#[derive(Clone)]
pub struct MessageBus {
    tx: broadcast::Sender<Message>,
}

impl MessageBus {
    /// Bus buffering up to `capacity` messages per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Send `message` to every current subscriber
    pub fn publish(&self, message: Message) {
        let kind = message.kind;
        let export = message.service_export.key();
        // Err only means nobody is listening yet
        match self.tx.send(message) {
            Ok(receivers) => debug!(?kind, %export, receivers, "published"),
            Err(_) => debug!(?kind, %export, "published without subscribers"),
        }
    }

    /// New subscription receiving messages published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.tx.subscribe()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use meshfleet_common::crd::{ServiceExportRule, ServiceExportSpec};

    pub fn east() -> Geo {
        Geo {
            cluster_key: ClusterKey::new("us", "east-1", "prod", "east"),
            gateway: Some("10.0.1.20:8091".to_string()),
        }
    }

    pub fn west() -> Geo {
        Geo {
            cluster_key: ClusterKey::new("us", "west-2", "prod", "west"),
            gateway: Some("10.0.2.20:8091".to_string()),
        }
    }

    pub fn export(namespace: &str, name: &str, port: i32) -> ServiceExport {
        let mut export = ServiceExport::new(
            name,
            ServiceExportSpec {
                rules: vec![ServiceExportRule {
                    port_number: port,
                    path: format!("/{namespace}/{name}"),
                }],
                ..Default::default()
            },
        );
        export.metadata.namespace = Some(namespace.to_string());
        export
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_each_message() {
        let bus = MessageBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(Message::new(
            MessageKind::ServiceExportCreated,
            east(),
            export("shop", "cart", 80),
        ));

        assert_eq!(a.recv().await.unwrap().kind, MessageKind::ServiceExportCreated);
        assert_eq!(b.recv().await.unwrap().service_export.key(), "shop/cart");
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let bus = MessageBus::default();
        bus.publish(Message::new(
            MessageKind::ServiceExportDeleted,
            east(),
            export("shop", "cart", 80),
        ));
    }

    #[test]
    fn origin_is_matched_by_cluster_key() {
        let msg = Message::new(
            MessageKind::ServiceExportRejected,
            east(),
            export("shop", "cart", 80),
        )
        .with_error("service type doesn't match");
        assert!(msg.is_from(&east().cluster_key));
        assert!(!msg.is_from(&west().cluster_key));
        assert_eq!(msg.error.as_deref(), Some("service type doesn't match"));
    }
}
