//! Kubernetes Event recording for meshfleet controllers.
//!
//! Federation rejections, connector failures and restarts triggered by
//! ProxyProfile changes are surfaced as Events on the offending record so
//! they show up in `kubectl describe`. Publishing is fire-and-forget: a
//! failed event is logged and never fails reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "Rejected")
    /// * `action` - What action was taken (e.g. "Federate")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as `controller_name`.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// ServiceExport accepted by the fleet
    pub const ACCEPTED: &str = "Accepted";
    /// ServiceExport rejected by the fleet
    pub const REJECTED: &str = "Rejected";
    /// ServiceExport cannot be exported (e.g. ExternalName service)
    pub const INVALID_EXPORT: &str = "InvalidExport";
    /// Connector for a cluster started
    pub const CONNECTOR_STARTED: &str = "ConnectorStarted";
    /// Connector for a cluster stopped with an error
    pub const CONNECTOR_FAILED: &str = "ConnectorFailed";
    /// Workloads restarted after a ProxyProfile change
    pub const RESTARTED: &str = "Restarted";
    /// Requested restart scope is not supported
    pub const UNSUPPORTED_RESTART_SCOPE: &str = "UnsupportedRestartScope";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Cross-cluster export decision
    pub const FEDERATE: &str = "Federate";
    /// Workload restart
    pub const RESTART: &str = "Restart";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[test]
    fn reason_constants_are_pascal_case() {
        assert_eq!(reasons::REJECTED, "Rejected");
        assert_eq!(reasons::CONNECTOR_FAILED, "ConnectorFailed");
        assert_eq!(actions::FEDERATE, "Federate");
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        let publisher = NoopEventPublisher;
        publisher
            .publish(
                &ObjectReference::default(),
                EventType::Warning,
                reasons::REJECTED,
                actions::FEDERATE,
                Some("service type doesn't match".to_string()),
            )
            .await;
    }
}
