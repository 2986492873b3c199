//! ProxyProfile defaulting and validation

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::warn;

use meshfleet_common::crd::{ProxyMode, ProxyProfile, RestartPolicy, RestartScope};
use meshfleet_common::{Error, Result, CONFIG_HASH_ANNOTATION, SPEC_HASH_ANNOTATION};
use meshfleet_config::MeshConfigStore;

use crate::adapter::{Defaulter, Validator};

/// Pull policy implied by an image reference: `Always` for `:latest` or an
/// untagged image, `IfNotPresent` otherwise
pub fn image_pull_policy_by_tag(image: &str) -> &'static str {
    if image.contains('@') {
        return "IfNotPresent";
    }
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    match last_segment.split_once(':') {
        Some((_, "latest")) | None => "Always",
        Some(_) => "IfNotPresent",
    }
}

/// Fills sidecar images, pull policies and startup scripts, then stamps the
/// hash the reconciler compares against
pub struct ProxyProfileDefaulter {
    store: Arc<MeshConfigStore>,
}

impl ProxyProfileDefaulter {
    /// Defaulter reading the proxy image from `store`
    pub fn new(store: Arc<MeshConfigStore>) -> Self {
        Self { store }
    }
}

impl Defaulter<ProxyProfile> for ProxyProfileDefaulter {
    fn apply_defaults(&self, obj: &mut ProxyProfile) {
        let Some(config) = self.store.current() else {
            warn!(profile = %obj.name_any(), "mesh config not loaded, skipping defaults");
            return;
        };

        let mode = obj.spec.mode;
        for sidecar in &mut obj.spec.sidecars {
            let image = sidecar
                .image
                .get_or_insert_with(|| config.proxy_image())
                .clone();
            sidecar
                .image_pull_policy
                .get_or_insert_with(|| image_pull_policy_by_tag(&image).to_string());
            if mode == ProxyMode::Local && sidecar.startup_script_name.is_none() {
                sidecar.startup_script_name = Some(format!("{}.js", sidecar.name));
            }
        }

        // Hashes go last: they cover the defaulted spec
        let (key, hash) = match mode {
            ProxyMode::Local => (CONFIG_HASH_ANNOTATION, obj.spec.config_hash()),
            ProxyMode::Remote => (SPEC_HASH_ANNOTATION, obj.spec.spec_hash()),
        };
        match hash {
            Ok(hash) => {
                obj.annotations_mut().insert(key.to_string(), hash);
            }
            Err(e) => warn!(profile = %obj.name_any(), error = %e, "failed to hash profile"),
        }
    }
}

/// Rejects unusable sidecar lists and restart combinations
pub struct ProxyProfileValidator;

fn check_spec(profile: &ProxyProfile) -> Result<()> {
    let spec = &profile.spec;
    if spec.sidecars.is_empty() {
        return Err(Error::validation_for_field(
            "ProxyProfile",
            "spec.sidecars",
            "at least one sidecar is required",
        ));
    }

    let mut names = BTreeSet::new();
    for sidecar in &spec.sidecars {
        if sidecar.name.is_empty() {
            return Err(Error::validation_for_field(
                "ProxyProfile",
                "spec.sidecars.name",
                "sidecar name is required",
            ));
        }
        if !names.insert(sidecar.name.as_str()) {
            return Err(Error::validation_for_field(
                "ProxyProfile",
                "spec.sidecars.name",
                format!("duplicate sidecar name {}", sidecar.name),
            ));
        }
    }

    if spec.restart_policy == RestartPolicy::Always && spec.restart_scope == RestartScope::Sidecar {
        return Err(Error::validation_for_field(
            "ProxyProfile",
            "spec.restartScope",
            "restart scope Sidecar is not supported with restart policy Always",
        ));
    }
    Ok(())
}

#[async_trait]
impl Validator<ProxyProfile> for ProxyProfileValidator {
    async fn validate_create(&self, obj: &ProxyProfile) -> Result<()> {
        check_spec(obj)
    }

    async fn validate_update(&self, old: &ProxyProfile, new: &ProxyProfile) -> Result<()> {
        if old.spec.mode != new.spec.mode {
            return Err(Error::validation_for_field(
                "ProxyProfile",
                "spec.mode",
                "mode cannot be changed, delete and recreate the profile",
            ));
        }
        check_spec(new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshfleet_common::crd::{ProxyProfileSpec, Sidecar};
    use meshfleet_common::mesh_config::{sample_json, MeshConfig};

    fn store() -> Arc<MeshConfigStore> {
        Arc::new(MeshConfigStore::with_config(
            MeshConfig::parse(sample_json()).unwrap(),
        ))
    }

    fn profile(mode: ProxyMode, sidecars: &[&str]) -> ProxyProfile {
        ProxyProfile::new(
            "shop-proxy",
            ProxyProfileSpec {
                mode,
                sidecars: sidecars
                    .iter()
                    .map(|n| Sidecar {
                        name: n.to_string(),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn pull_policy_follows_tag() {
        assert_eq!(image_pull_policy_by_tag("flomesh/pipy"), "Always");
        assert_eq!(image_pull_policy_by_tag("flomesh/pipy:latest"), "Always");
        assert_eq!(image_pull_policy_by_tag("flomesh/pipy:1.0.0"), "IfNotPresent");
        assert_eq!(image_pull_policy_by_tag("registry:5000/pipy"), "Always");
        assert_eq!(image_pull_policy_by_tag("pipy@sha256:abc"), "IfNotPresent");
    }

    #[test]
    fn remote_profile_gets_image_and_spec_hash() {
        let defaulter = ProxyProfileDefaulter::new(store());
        let mut p = profile(ProxyMode::Remote, &["proxy"]);
        defaulter.apply_defaults(&mut p);

        let sidecar = &p.spec.sidecars[0];
        assert_eq!(sidecar.image, Some(store().current().unwrap().proxy_image()));
        assert!(sidecar.image_pull_policy.is_some());
        assert!(sidecar.startup_script_name.is_none());
        assert!(p.spec_hash_annotation().is_some());
        assert!(p.config_hash_annotation().is_none());
    }

    #[test]
    fn local_profile_gets_startup_script_and_config_hash() {
        let defaulter = ProxyProfileDefaulter::new(store());
        let mut p = profile(ProxyMode::Local, &["proxy"]);
        defaulter.apply_defaults(&mut p);

        assert_eq!(
            p.spec.sidecars[0].startup_script_name.as_deref(),
            Some("proxy.js")
        );
        assert!(p.config_hash_annotation().is_some());
    }

    #[test]
    fn defaulting_is_idempotent() {
        let defaulter = ProxyProfileDefaulter::new(store());
        let mut p = profile(ProxyMode::Remote, &["proxy", "logger"]);
        defaulter.apply_defaults(&mut p);
        let once = p.clone();
        defaulter.apply_defaults(&mut p);
        assert_eq!(p, once);
    }

    #[test]
    fn explicit_image_is_kept() {
        let defaulter = ProxyProfileDefaulter::new(store());
        let mut p = profile(ProxyMode::Remote, &["proxy"]);
        p.spec.sidecars[0].image = Some("custom/proxy:9".to_string());
        defaulter.apply_defaults(&mut p);
        assert_eq!(p.spec.sidecars[0].image.as_deref(), Some("custom/proxy:9"));
        assert_eq!(
            p.spec.sidecars[0].image_pull_policy.as_deref(),
            Some("IfNotPresent")
        );
    }

    #[test]
    fn unloaded_config_leaves_profile_alone() {
        let defaulter = ProxyProfileDefaulter::new(Arc::new(MeshConfigStore::new(vec![])));
        let mut p = profile(ProxyMode::Remote, &["proxy"]);
        let before = p.clone();
        defaulter.apply_defaults(&mut p);
        assert_eq!(p, before);
    }

    #[tokio::test]
    async fn sidecars_must_be_present_and_unique() {
        let v = ProxyProfileValidator;
        assert!(v
            .validate_create(&profile(ProxyMode::Remote, &[]))
            .await
            .is_err());
        let err = v
            .validate_create(&profile(ProxyMode::Remote, &["proxy", "proxy"]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
        assert!(v
            .validate_create(&profile(ProxyMode::Remote, &["proxy"]))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn sidecar_scope_with_always_is_rejected() {
        let mut p = profile(ProxyMode::Remote, &["proxy"]);
        p.spec.restart_policy = RestartPolicy::Always;
        p.spec.restart_scope = RestartScope::Sidecar;
        assert!(ProxyProfileValidator.validate_create(&p).await.is_err());

        p.spec.restart_scope = RestartScope::Owner;
        assert!(ProxyProfileValidator.validate_create(&p).await.is_ok());
    }

    #[tokio::test]
    async fn mode_is_immutable() {
        let old = profile(ProxyMode::Remote, &["proxy"]);
        let new = profile(ProxyMode::Local, &["proxy"]);
        let err = ProxyProfileValidator
            .validate_update(&old, &new)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("mode"));
    }
}
