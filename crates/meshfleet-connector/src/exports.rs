//! ServiceExport watching and federation event handling shared by both
//! connector kinds

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::events::EventType;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource, ResourceExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use meshfleet_common::crd::ServiceExport;
use meshfleet_common::events::{actions, reasons, EventPublisher};
use meshfleet_common::retry::{retry_with_fibonacci_if, RetryConfig};
use meshfleet_common::Result;

use crate::bus::{Geo, Message, MessageBus, MessageKind};
use crate::fleet::{self, FleetApi};
use crate::WATCH_TIMEOUT_SECS;

/// Attempts per federation event before it is dropped
const EVENT_ATTEMPTS: u32 = 8;

/// Turns ServiceExport changes of one cluster into bus messages
pub struct ExportWatcher {
    geo: Geo,
    fleet: Arc<dyn FleetApi>,
    bus: MessageBus,
    seen: HashMap<String, String>,
}

impl ExportWatcher {
    /// Watcher publishing as `geo`
    pub fn new(geo: Geo, fleet: Arc<dyn FleetApi>, bus: MessageBus) -> Self {
        Self {
            geo,
            fleet,
            bus,
            seen: HashMap::new(),
        }
    }

    /// Handle an added or modified export.
    ///
    /// Unchanged resourceVersions are skipped. ExternalName services are
    /// marked invalid instead of being published.
    pub async fn on_applied(&mut self, export: ServiceExport) -> Result<()> {
        let key = export.key();
        let version = export.resource_version().unwrap_or_default();
        if self.seen.get(&key) == Some(&version) {
            return Ok(());
        }

        let namespace = export.namespace().unwrap_or_default();
        let Some(service) = self.fleet.get_service(&namespace, &export.name_any()).await? else {
            warn!(export = %key, "exported service does not exist yet");
            return Ok(());
        };
        self.seen.insert(key.clone(), version);

        if fleet::is_external_name(&service) {
            warn!(export = %key, "ExternalName services cannot be exported");
            return fleet::mark_invalid(
                self.fleet.as_ref(),
                &export,
                &format!("ExternalName service {key} cannot be exported"),
            )
            .await;
        }

        self.bus.publish(
            Message::new(MessageKind::ServiceExportCreated, self.geo.clone(), export)
                .with_service(service),
        );
        Ok(())
    }

    /// Handle a removed export
    pub fn on_deleted(&mut self, export: ServiceExport) {
        self.seen.remove(&export.key());
        self.bus.publish(Message::new(
            MessageKind::ServiceExportDeleted,
            self.geo.clone(),
            export,
        ));
    }

    /// Watch every ServiceExport of the cluster behind `client` until
    /// `cancel` fires
    pub async fn run(mut self, client: Client, cancel: CancellationToken) {
        let api: Api<ServiceExport> = Api::all(client);
        let stream = export_events(api).default_backoff();
        futures::pin_mut!(stream);

        info!(cluster = %self.geo.cluster_key, "watching service exports");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(event) => event,
                    None => break,
                },
            };

            let outcome = match event {
                Ok(Event::Apply(export)) | Ok(Event::InitApply(export)) => {
                    self.on_applied(export).await
                }
                Ok(Event::Delete(export)) => {
                    self.on_deleted(export);
                    Ok(())
                }
                Ok(Event::Init) | Ok(Event::InitDone) => Ok(()),
                Err(e) => {
                    warn!(cluster = %self.geo.cluster_key, error = %e, "service export watch error");
                    Ok(())
                }
            };
            if let Err(e) = outcome {
                error!(cluster = %self.geo.cluster_key, error = %e, "failed to handle service export");
            }
        }
    }
}

fn export_events(
    api: Api<ServiceExport>,
) -> impl futures::Stream<Item = std::result::Result<Event<ServiceExport>, watcher::Error>> {
    watcher::watcher(api, watcher::Config::default().timeout(WATCH_TIMEOUT_SECS))
}

/// Applies Accepted, Rejected and Deleted messages to one cluster
pub struct FederationEvents {
    geo: Geo,
    fleet: Arc<dyn FleetApi>,
    events: Arc<dyn EventPublisher>,
    retry: RetryConfig,
}

impl FederationEvents {
    /// Handler for the cluster `geo` describes
    pub fn new(geo: Geo, fleet: Arc<dyn FleetApi>, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            geo,
            fleet,
            events,
            retry: RetryConfig::with_max_attempts(EVENT_ATTEMPTS),
        }
    }

    /// Override the retry schedule
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Apply `message` to this cluster once
    pub async fn handle(&self, message: &Message) -> Result<()> {
        let own = message.is_from(&self.geo.cluster_key);
        let export = &message.service_export;
        match (message.kind, own) {
            (MessageKind::ServiceExportAccepted, true) => {
                fleet::clear_conflict(self.fleet.as_ref(), export).await
            }
            (MessageKind::ServiceExportAccepted, false) => {
                let Some(service) = message.service.as_ref() else {
                    warn!(export = %export.key(), "accepted export carries no service");
                    return Ok(());
                };
                if message.geo.gateway.as_deref().is_none_or(str::is_empty) {
                    warn!(
                        export = %export.key(),
                        cluster = %message.geo.cluster_key,
                        "exporting cluster has no gateway, skipping import"
                    );
                    return Ok(());
                }
                fleet::upsert_import(self.fleet.as_ref(), export, service, &message.geo).await
            }
            (MessageKind::ServiceExportRejected, true) => {
                let reason = message.error.as_deref().unwrap_or("rejected");
                self.events
                    .publish(
                        &export.object_ref(&()),
                        EventType::Warning,
                        reasons::REJECTED,
                        actions::FEDERATE,
                        Some(format!("ServiceExport {} is invalid, {}", export.key(), reason)),
                    )
                    .await;
                fleet::mark_conflict(self.fleet.as_ref(), export, reason).await
            }
            (MessageKind::ServiceExportDeleted, false) => {
                fleet::remove_import_endpoints(self.fleet.as_ref(), export, &message.geo).await
            }
            _ => Ok(()),
        }
    }

    /// Apply `message` with Fibonacci retry on retryable errors
    pub async fn handle_with_retry(&self, message: &Message) {
        let operation = format!("{:?} {}", message.kind, message.service_export.key());
        let result = retry_with_fibonacci_if(
            &self.retry,
            &operation,
            |e: &meshfleet_common::Error| e.is_retryable(),
            || self.handle(message),
        )
        .await;
        if let Err(e) = result {
            error!(cluster = %self.geo.cluster_key, operation = %operation, error = %e, "giving up on federation event");
        }
    }

    /// Consume `rx` until it closes or `cancel` fires
    pub async fn run(self, mut rx: broadcast::Receiver<Message>, cancel: CancellationToken) {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(message) => message,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(cluster = %self.geo.cluster_key, skipped, "federation events lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            if matches!(message.kind, MessageKind::ServiceExportCreated) {
                continue;
            }
            debug!(cluster = %self.geo.cluster_key, kind = ?message.kind, export = %message.service_export.key(), "federation event");
            self.handle_with_retry(&message).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::testing::{east, export, west};
    use crate::fleet::testing::service;
    use crate::fleet::MockFleetApi;
    use meshfleet_common::crd::{ConditionStatus, ServiceImport};
    use meshfleet_common::events::NoopEventPublisher;
    use std::time::Duration;

    fn versioned(rv: &str) -> ServiceExport {
        let mut e = export("shop", "cart", 80);
        e.metadata.resource_version = Some(rv.to_string());
        e
    }

    // ===================================================================
    // Story: an export is published once per resourceVersion
    // ===================================================================

    #[tokio::test]
    async fn export_is_published_once_per_version() {
        let mut fleet = MockFleetApi::new();
        fleet
            .expect_get_service()
            .times(2)
            .returning(|ns, name| Ok(Some(service(ns, name, "ClusterIP", &[(80, "TCP")]))));

        let bus = MessageBus::new(8);
        let mut rx = bus.subscribe();
        let mut watcher = ExportWatcher::new(east(), Arc::new(fleet), bus);

        watcher.on_applied(versioned("1")).await.unwrap();
        watcher.on_applied(versioned("1")).await.unwrap();
        watcher.on_applied(versioned("2")).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, MessageKind::ServiceExportCreated);
        assert!(first.service.is_some());
        assert_eq!(
            rx.recv().await.unwrap().service_export.resource_version(),
            Some("2".to_string())
        );
        assert!(rx.try_recv().is_err());

        watcher.on_deleted(versioned("2"));
        assert_eq!(rx.recv().await.unwrap().kind, MessageKind::ServiceExportDeleted);
    }

    #[tokio::test]
    async fn external_name_export_is_marked_invalid() {
        let mut fleet = MockFleetApi::new();
        fleet
            .expect_get_service()
            .returning(|ns, name| Ok(Some(service(ns, name, "ExternalName", &[]))));
        fleet
            .expect_get_service_export()
            .returning(|ns, name| Ok(Some(export(ns, name, 80))));
        fleet
            .expect_patch_export_conditions()
            .withf(|_, _, conditions| {
                conditions[0].status == ConditionStatus::False
                    && conditions[0].message.contains("ExternalName")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let bus = MessageBus::new(8);
        let mut rx = bus.subscribe();
        let mut watcher = ExportWatcher::new(east(), Arc::new(fleet), bus);
        watcher.on_applied(versioned("1")).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_service_is_retried_on_next_change() {
        let mut fleet = MockFleetApi::new();
        fleet.expect_get_service().times(2).returning(|_, _| Ok(None));

        let bus = MessageBus::new(8);
        let mut watcher = ExportWatcher::new(east(), Arc::new(fleet), bus);
        watcher.on_applied(versioned("1")).await.unwrap();
        watcher.on_applied(versioned("1")).await.unwrap();
    }

    fn accepted(from: Geo) -> Message {
        Message::new(
            MessageKind::ServiceExportAccepted,
            from,
            export("shop", "cart", 80),
        )
        .with_service(service("shop", "cart", "ClusterIP", &[(80, "TCP")]))
    }

    #[tokio::test]
    async fn accepted_foreign_export_becomes_an_import() {
        let mut fleet = MockFleetApi::new();
        fleet.expect_get_service_import().returning(|_, _| Ok(None));
        fleet.expect_ensure_namespace().returning(|_| Ok(()));
        fleet
            .expect_apply_service_import()
            .withf(|imp: &ServiceImport| imp.spec.cluster_keys() == vec!["us/east-1/prod/east"])
            .times(1)
            .returning(|_| Ok(()));

        let handler = FederationEvents::new(west(), Arc::new(fleet), Arc::new(NoopEventPublisher));
        handler.handle(&accepted(east())).await.unwrap();
    }

    #[tokio::test]
    async fn accepted_own_export_clears_conflict() {
        let mut fleet = MockFleetApi::new();
        fleet
            .expect_get_service_export()
            .returning(|ns, name| Ok(Some(export(ns, name, 80))));
        fleet
            .expect_patch_export_conditions()
            .times(1)
            .returning(|_, _, _| Ok(()));
        fleet.expect_apply_service_import().never();

        let handler = FederationEvents::new(east(), Arc::new(fleet), Arc::new(NoopEventPublisher));
        handler.handle(&accepted(east())).await.unwrap();
    }

    #[tokio::test]
    async fn rejection_only_touches_the_exporting_cluster() {
        let message = Message::new(
            MessageKind::ServiceExportRejected,
            east(),
            export("shop", "cart", 80),
        )
        .with_error("service type doesn't match: ClusterIP vs NodePort");

        let mut peer = MockFleetApi::new();
        peer.expect_patch_export_conditions().never();
        FederationEvents::new(west(), Arc::new(peer), Arc::new(NoopEventPublisher))
            .handle(&message)
            .await
            .unwrap();

        let mut owner = MockFleetApi::new();
        owner
            .expect_get_service_export()
            .returning(|ns, name| Ok(Some(export(ns, name, 80))));
        owner
            .expect_patch_export_conditions()
            .withf(|_, _, conditions| conditions[0].message.contains("ClusterIP vs NodePort"))
            .times(1)
            .returning(|_, _, _| Ok(()));
        FederationEvents::new(east(), Arc::new(owner), Arc::new(NoopEventPublisher))
            .handle(&message)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failures_are_retried() {
        let mut fleet = MockFleetApi::new();
        let mut calls = 0;
        fleet.expect_get_service_import().returning(move |_, _| {
            calls += 1;
            if calls < 3 {
                Err(meshfleet_common::Error::transient("kube", "connection reset"))
            } else {
                Ok(None)
            }
        });
        fleet.expect_ensure_namespace().returning(|_| Ok(()));
        fleet
            .expect_apply_service_import()
            .times(1)
            .returning(|_| Ok(()));

        let handler = FederationEvents::new(west(), Arc::new(fleet), Arc::new(NoopEventPublisher))
            .with_retry(RetryConfig {
                max_attempts: 5,
                step: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
            });
        handler.handle_with_retry(&accepted(east())).await;
    }

    #[tokio::test]
    async fn created_messages_are_left_to_the_supervisor() {
        let fleet = MockFleetApi::new();
        let handler = FederationEvents::new(west(), Arc::new(fleet), Arc::new(NoopEventPublisher));
        let bus = MessageBus::new(8);
        let rx = bus.subscribe();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(handler.run(rx, cancel.clone()));

        bus.publish(Message::new(
            MessageKind::ServiceExportCreated,
            east(),
            export("shop", "cart", 80),
        ));
        tokio::task::yield_now().await;
        cancel.cancel();
        task.await.unwrap();
    }
}
