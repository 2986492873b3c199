//! CRD installation
//!
//! The manager installs its own CRDs with server-side apply so the schema
//! always matches the binary. `--crd` prints the same manifests instead.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::info;

use meshfleet_common::crd::all_crds;
use meshfleet_common::{Error, Result, FIELD_MANAGER};

/// Apply every meshfleet CRD
pub async fn install_crds(client: &Client) -> Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in all_crds() {
        let name = crd.name_any();
        info!(crd = %name, "installing CRD");
        api.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| Error::internal_with_context("install_crds", format!("{name}: {e}")))?;
    }
    info!("all CRDs installed");
    Ok(())
}

/// Every CRD as a multi-document YAML stream
pub fn crd_manifests() -> Result<String> {
    let docs = all_crds()
        .iter()
        .map(|crd| {
            serde_yaml::to_string(crd)
                .map_err(|e| Error::serialization_for_kind("CustomResourceDefinition", e.to_string()))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(docs.join("---\n"))
}
