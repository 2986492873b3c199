//! Local connector sync loop
//!
//! Mirrors Services, Endpoints, Secrets, IngressClasses, ServiceImports and
//! Ingresses of the home cluster into reflector stores and turns them into
//! the service registry and ingress config documents of the cluster's
//! codebases.

pub mod ingress;
pub mod registry;
pub mod runner;

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Secret, Service};
use k8s_openapi::api::networking::v1::{Ingress, IngressClass};
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use meshfleet_common::crd::ServiceImport;
use meshfleet_common::{Error, Result};
use meshfleet_repo::documents::{INGRESS_JSON, REGISTRY_JSON};
use meshfleet_repo::RepoClient;

use crate::connector::ClusterCodebases;
use crate::WATCH_TIMEOUT_SECS;

pub use ingress::{build_ingress_config, IngressConfig};
pub use registry::{build_registry, ServiceRegistry};
pub use runner::{BoundedRunner, DocumentPusher};

/// Point-in-time copy of the reflector stores
#[derive(Clone, Debug, Default)]
pub struct ClusterSnapshot {
    /// Services
    pub services: Vec<Arc<Service>>,
    /// Endpoints
    pub endpoints: Vec<Arc<Endpoints>>,
    /// Secrets
    pub secrets: Vec<Arc<Secret>>,
    /// IngressClasses
    pub ingress_classes: Vec<Arc<IngressClass>>,
    /// ServiceImports
    pub imports: Vec<Arc<ServiceImport>>,
    /// Ingresses
    pub ingresses: Vec<Arc<Ingress>>,
}

struct ClusterStores {
    services: Store<Service>,
    endpoints: Store<Endpoints>,
    secrets: Store<Secret>,
    ingress_classes: Store<IngressClass>,
    imports: Store<ServiceImport>,
    ingresses: Store<Ingress>,
}

impl ClusterStores {
    fn snapshot(&self) -> ClusterSnapshot {
        ClusterSnapshot {
            services: self.services.state(),
            endpoints: self.endpoints.state(),
            secrets: self.secrets.state(),
            ingress_classes: self.ingress_classes.state(),
            imports: self.imports.state(),
            ingresses: self.ingresses.state(),
        }
    }
}

/// Start a reflector for every `K` in the cluster; each change requests a
/// sync run
fn reflect<K>(
    client: &Client,
    runner: &BoundedRunner,
    cancel: &CancellationToken,
) -> (Store<K>, JoinHandle<()>)
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    let api: Api<K> = Api::all(client.clone());
    let (reader, writer) = reflector::store();
    let stream = reflector::reflector(
        writer,
        watcher::watcher(api, watcher::Config::default().timeout(WATCH_TIMEOUT_SECS)),
    )
    .default_backoff()
    .touched_objects();

    let runner = runner.clone();
    let cancel = cancel.clone();
    let task = tokio::spawn(async move {
        futures::pin_mut!(stream);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(_)) => runner.request(),
                    Some(Err(e)) => warn!(kind = %K::kind(&K::DynamicType::default()), error = %e, "reflector error"),
                    None => break,
                },
            }
        }
    });
    (reader, task)
}

async fn ready<K>(store: &Store<K>) -> Result<()>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    store
        .wait_until_ready()
        .await
        .map_err(|e| Error::internal_with_context("reflector", format!("{kind} store: {e}")))
}

/// Builds and pushes the documents of one cluster
pub struct LocalSync {
    codebases: ClusterCodebases,
    mesh_namespace: String,
    pusher: Mutex<DocumentPusher>,
}

impl LocalSync {
    /// Sync writing into `codebases` through `repo`
    pub fn new(repo: Arc<dyn RepoClient>, codebases: ClusterCodebases, mesh_namespace: &str) -> Self {
        Self {
            codebases,
            mesh_namespace: mesh_namespace.to_string(),
            pusher: Mutex::new(DocumentPusher::new(repo)),
        }
    }

    /// Build both documents from `snapshot` and push the changed ones
    pub async fn sync_once(&self, snapshot: &ClusterSnapshot) -> Result<()> {
        let registry = build_registry(
            snapshot.services.iter().map(|s| s.as_ref()),
            snapshot.endpoints.iter().map(|e| e.as_ref()),
            snapshot.imports.iter().map(|i| i.as_ref()),
        );
        let ingress = build_ingress_config(snapshot, &self.mesh_namespace);

        let mut pusher = self.pusher.lock().await;
        pusher
            .push(&self.codebases.services, REGISTRY_JSON, &registry)
            .await?;
        pusher
            .push(&self.codebases.ingress, INGRESS_JSON, &ingress)
            .await?;
        Ok(())
    }

    /// Start the reflectors of the cluster behind `client` and keep the
    /// documents in sync until `cancel` fires
    pub async fn run(&self, client: Client, runner: BoundedRunner, cancel: CancellationToken) -> Result<()> {
        let reflectors = cancel.child_token();
        let mut tasks = Vec::new();

        let (endpoints, t) = reflect::<Endpoints>(&client, &runner, &reflectors);
        tasks.push(t);
        let (services, t) = reflect::<Service>(&client, &runner, &reflectors);
        tasks.push(t);
        let (secrets, t) = reflect::<Secret>(&client, &runner, &reflectors);
        tasks.push(t);
        let (ingress_classes, t) = reflect::<IngressClass>(&client, &runner, &reflectors);
        tasks.push(t);
        let (imports, t) = reflect::<ServiceImport>(&client, &runner, &reflectors);
        tasks.push(t);

        let started = async {
            ready(&endpoints).await?;
            ready(&services).await?;
            ready(&secrets).await?;
            ready(&ingress_classes).await?;
            ready(&imports).await
        };
        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            result = started => Some(result),
        };

        let result = match outcome {
            None => Ok(()),
            Some(Err(e)) => Err(e),
            Some(Ok(())) => {
                // Ingresses reference the other kinds, so they go last
                let (ingresses, t) = reflect::<Ingress>(&client, &runner, &reflectors);
                tasks.push(t);
                let ingress_ready = tokio::select! {
                    _ = cancel.cancelled() => None,
                    result = ready(&ingresses) => Some(result),
                };
                match ingress_ready {
                    None => Ok(()),
                    Some(Err(e)) => Err(e),
                    Some(Ok(())) => {
                        let stores = ClusterStores {
                            services,
                            endpoints,
                            secrets,
                            ingress_classes,
                            imports,
                            ingresses,
                        };
                        info!(services = %self.codebases.services, ingress = %self.codebases.ingress, "local sync started");
                        let (sync, stores) = (&*self, &stores);
                        runner
                            .run(cancel.clone(), move || async move {
                                if let Err(e) = sync.sync_once(&stores.snapshot()).await {
                                    error!(error = %e, "local sync failed");
                                }
                            })
                            .await;
                        Ok(())
                    }
                }
            }
        };

        reflectors.cancel();
        futures::future::join_all(tasks).await;
        result
    }
}
