//! GlobalTrafficPolicy defaulting and validation

use std::collections::BTreeSet;

use async_trait::async_trait;

use meshfleet_common::crd::{ClusterKey, GlobalTrafficPolicy, LoadBalancerMode};
use meshfleet_common::{Error, Result};

use crate::adapter::{Defaulter, Validator};

/// Drops duplicate targets, keeping the first occurrence of each cluster
///
/// `lbType` itself defaults to `Locality` while decoding, so the patch
/// carries it whenever it was omitted.
pub struct GlobalTrafficPolicyDefaulter;

impl Defaulter<GlobalTrafficPolicy> for GlobalTrafficPolicyDefaulter {
    fn apply_defaults(&self, obj: &mut GlobalTrafficPolicy) {
        let mut seen = BTreeSet::new();
        obj.spec
            .targets
            .retain(|t| seen.insert(t.cluster_key.clone()));
    }
}

/// Checks the target list fits the balancing mode
pub struct GlobalTrafficPolicyValidator;

fn invalid(field: &str, msg: impl Into<String>) -> Error {
    Error::validation_for_field("GlobalTrafficPolicy", field, msg)
}

fn check_spec(gtp: &GlobalTrafficPolicy) -> Result<()> {
    let targets = &gtp.spec.targets;
    for target in targets {
        target
            .cluster_key
            .parse::<ClusterKey>()
            .map_err(|e| invalid("spec.targets.clusterKey", e.to_string()))?;
    }

    match gtp.spec.lb_type {
        LoadBalancerMode::Locality if targets.len() > 1 => Err(invalid(
            "spec.targets",
            "Locality load balancing sticks to exactly one cluster",
        )),
        LoadBalancerMode::FailOver if targets.is_empty() => Err(invalid(
            "spec.targets",
            "FailOver requires at least one cluster",
        )),
        LoadBalancerMode::ActiveActive => {
            match targets.iter().find(|t| t.weight.is_some_and(|w| w < 0)) {
                Some(t) => Err(invalid(
                    "spec.targets.weight",
                    format!(
                        "weight {} of {} is invalid for ActiveActive, it must be >= 0",
                        t.weight.unwrap_or_default(),
                        t.cluster_key
                    ),
                )),
                None => Ok(()),
            }
        }
        _ => Ok(()),
    }
}

#[async_trait]
impl Validator<GlobalTrafficPolicy> for GlobalTrafficPolicyValidator {
    async fn validate_create(&self, obj: &GlobalTrafficPolicy) -> Result<()> {
        check_spec(obj)
    }

    async fn validate_update(
        &self,
        _old: &GlobalTrafficPolicy,
        new: &GlobalTrafficPolicy,
    ) -> Result<()> {
        check_spec(new)
    }
}
