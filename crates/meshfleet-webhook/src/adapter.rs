//! Defaulting and validation adapters
//!
//! Typed [`Defaulter`] and [`Validator`] implementations are wrapped into
//! [`AdmissionHandler`] trait objects that speak `AdmissionReview`. The
//! mutating adapter defaults a typed copy of the object and answers with the
//! JSON patch between the submitted and the defaulted document.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, Operation};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info};

#[cfg(test)]
use mockall::automock;

use meshfleet_common::{Error, Result};

use crate::registry::{WebhookKind, WebhookRule};

/// Fills in defaults; never fails and applying it twice equals once
pub trait Defaulter<T>: Send + Sync {
    /// Default `obj` in place
    fn apply_defaults(&self, obj: &mut T);
}

/// Judges objects; the first violation is returned
#[async_trait]
pub trait Validator<T>: Send + Sync {
    /// Check a new object
    async fn validate_create(&self, obj: &T) -> Result<()>;

    /// Check an update of `old` to `new`
    async fn validate_update(&self, old: &T, new: &T) -> Result<()>;

    /// Check a deletion
    async fn validate_delete(&self, _obj: &T) -> Result<()> {
        Ok(())
    }
}

/// One admission endpoint
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AdmissionHandler: Send + Sync {
    /// Mutating or validating
    fn kind(&self) -> WebhookKind;

    /// What the API server sends here
    fn rule(&self) -> &WebhookRule;

    /// What the API server does when the endpoint is unreachable
    fn failure_policy(&self) -> &'static str {
        "Fail"
    }

    /// Answer one request
    async fn admit(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse;
}

fn decode<T: DeserializeOwned>(obj: &DynamicObject) -> Result<T> {
    let value = serde_json::to_value(obj)?;
    serde_json::from_value(value).map_err(Error::from)
}

/// Build a patch response, denying when the patch cannot be encoded
pub fn patch_response(
    request: &AdmissionRequest<DynamicObject>,
    ops: Vec<json_patch::PatchOperation>,
) -> AdmissionResponse {
    if ops.is_empty() {
        return AdmissionResponse::from(request);
    }
    match AdmissionResponse::from(request).with_patch(json_patch::Patch(ops)) {
        Ok(response) => response,
        Err(e) => {
            error!(uid = %request.uid, error = %e, "failed to serialize patch");
            AdmissionResponse::from(request).deny(format!("patch serialization error: {e}"))
        }
    }
}

/// Serves a [`Defaulter`] as a mutating webhook
pub struct MutatingAdapter<T> {
    rule: WebhookRule,
    defaulter: Arc<dyn Defaulter<T>>,
    _kind: PhantomData<fn() -> T>,
}

impl<T> MutatingAdapter<T> {
    /// Adapter for `defaulter` on `rule`
    pub fn new(rule: WebhookRule, defaulter: Arc<dyn Defaulter<T>>) -> Self {
        Self {
            rule,
            defaulter,
            _kind: PhantomData,
        }
    }

    /// Patch turning `obj` into its defaulted form
    pub fn patch_for(&self, obj: &DynamicObject) -> Result<json_patch::Patch>
    where
        T: DeserializeOwned + Serialize,
    {
        let original = serde_json::to_value(obj)?;
        let mut typed: T = serde_json::from_value(original.clone())?;
        self.defaulter.apply_defaults(&mut typed);
        let defaulted = serde_json::to_value(&typed)?;
        Ok(json_patch::diff(&original, &defaulted))
    }
}

#[async_trait]
impl<T> AdmissionHandler for MutatingAdapter<T>
where
    T: DeserializeOwned + Serialize + Send + Sync + 'static,
{
    fn kind(&self) -> WebhookKind {
        WebhookKind::Mutating
    }

    fn rule(&self) -> &WebhookRule {
        &self.rule
    }

    async fn admit(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        let Some(obj) = &request.object else {
            return AdmissionResponse::from(request);
        };

        match self.patch_for(obj) {
            Ok(patch) => {
                debug!(
                    uid = %request.uid,
                    resource = %self.rule.resource,
                    ops = patch.0.len(),
                    "defaulted object"
                );
                patch_response(request, patch.0)
            }
            Err(e) => {
                error!(uid = %request.uid, error = %e, "failed to decode object");
                AdmissionResponse::from(request).deny(e.to_string())
            }
        }
    }
}

/// Serves a [`Validator`] as a validating webhook
pub struct ValidatingAdapter<T> {
    rule: WebhookRule,
    validator: Arc<dyn Validator<T>>,
}

impl<T> ValidatingAdapter<T> {
    /// Adapter for `validator` on `rule`
    pub fn new(rule: WebhookRule, validator: Arc<dyn Validator<T>>) -> Self {
        Self { rule, validator }
    }
}

impl<T> ValidatingAdapter<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    async fn judge(&self, request: &AdmissionRequest<DynamicObject>) -> Result<()> {
        let missing = || Error::validation("admission request carries no object");
        match request.operation {
            Operation::Create => {
                let obj = decode::<T>(request.object.as_ref().ok_or_else(missing)?)?;
                self.validator.validate_create(&obj).await
            }
            Operation::Update => {
                let new = decode::<T>(request.object.as_ref().ok_or_else(missing)?)?;
                let old = decode::<T>(request.old_object.as_ref().ok_or_else(missing)?)?;
                self.validator.validate_update(&old, &new).await
            }
            Operation::Delete => {
                let obj = decode::<T>(request.old_object.as_ref().ok_or_else(missing)?)?;
                self.validator.validate_delete(&obj).await
            }
            Operation::Connect => Ok(()),
        }
    }
}

#[async_trait]
impl<T> AdmissionHandler for ValidatingAdapter<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn kind(&self) -> WebhookKind {
        WebhookKind::Validating
    }

    fn rule(&self) -> &WebhookRule {
        &self.rule
    }

    async fn admit(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        match self.judge(request).await {
            Ok(()) => AdmissionResponse::from(request),
            Err(e) => {
                info!(
                    uid = %request.uid,
                    resource = %self.rule.resource,
                    name = %request.name,
                    reason = %e,
                    "admission denied"
                );
                AdmissionResponse::from(request).deny(e.to_string())
            }
        }
    }
}
