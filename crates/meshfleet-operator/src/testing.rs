//! Shared test fixtures

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use parking_lot::Mutex;

use meshfleet_common::events::EventPublisher;
use meshfleet_common::mesh_config::{sample_json, MeshConfig};

/// Event captured by [`RecordingPublisher`]
#[derive(Clone, Debug, PartialEq)]
pub struct Recorded {
    pub object: String,
    pub warning: bool,
    pub reason: String,
    pub note: Option<String>,
}

/// Publisher remembering every event
#[derive(Default)]
pub struct RecordingPublisher {
    pub events: Mutex<Vec<Recorded>>,
}

impl RecordingPublisher {
    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.reason.clone()).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        self.events.lock().push(Recorded {
            object: resource_ref.name.clone().unwrap_or_default(),
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            note,
        });
    }
}

pub fn mesh_config() -> MeshConfig {
    MeshConfig::parse(sample_json()).unwrap()
}
