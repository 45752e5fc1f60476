use crate::{
    conditions::{self, NewCondition},
    error::classify,
    patcher::{ResourcePatcher, Target},
};
use kube::{Resource, ResourceExt};
use oke_gateway_controller_core::ReconcileError;
use oke_gateway_controller_k8s_api::{Condition, Gateway, GatewayClass, GatewayConfig, Time};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Resources whose status has a top-level condition list.
pub trait Conditioned: Resource<DynamicType = ()> + Send + Sync {
    fn conditions(&self) -> &[Condition];
}

/// Writes conditions and statuses, skipping writes that would not change
/// anything.
#[derive(Clone)]
pub struct StatusWriter {
    patcher: Arc<dyn ResourcePatcher>,
    clock: Arc<dyn Fn() -> Time + Send + Sync>,
}

// === impl StatusWriter ===

impl StatusWriter {
    pub fn new(patcher: Arc<dyn ResourcePatcher>) -> Self {
        Self {
            patcher,
            clock: Arc::new(conditions::now),
        }
    }

    pub fn with_clock(mut self, clock: impl Fn() -> Time + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn now(&self) -> Time {
        (self.clock)()
    }

    /// Sets a single condition. Returns false when nothing was written.
    pub async fn set_condition<K: Conditioned>(
        &self,
        obj: &K,
        condition: NewCondition,
    ) -> Result<bool, ReconcileError> {
        self.set_conditions(obj, [condition]).await
    }

    pub async fn set_conditions<K: Conditioned>(
        &self,
        obj: &K,
        new: impl IntoIterator<Item = NewCondition>,
    ) -> Result<bool, ReconcileError> {
        let mut conditions = obj.conditions().to_vec();
        if !conditions::set_all(&mut conditions, new, &self.now()) {
            debug!(name = %obj.name_any(), "Conditions unchanged");
            return Ok(false);
        }
        self.patch_status(obj, &serde_json::json!({ "conditions": conditions }))
            .await?;
        Ok(true)
    }

    /// Merge-patches the object's status.
    pub async fn patch_status<K, S>(&self, obj: &K, status: &S) -> Result<(), ReconcileError>
    where
        K: Resource<DynamicType = ()>,
        S: Serialize,
    {
        let status = serde_json::to_value(status)
            .map_err(|e| ReconcileError::terminal(format!("failed to encode status: {e}")))?;
        self.patcher
            .patch_status(&Target::of(obj), status)
            .await
            .map_err(classify)
    }

    /// Merge-patches the object's metadata and returns its new resource
    /// version.
    pub async fn patch_metadata<K>(
        &self,
        obj: &K,
        metadata: serde_json::Value,
    ) -> Result<Option<String>, ReconcileError>
    where
        K: Resource<DynamicType = ()>,
    {
        self.patcher
            .patch_metadata(&Target::of(obj), metadata)
            .await
            .map_err(classify)
    }
}

impl std::fmt::Debug for StatusWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusWriter").finish_non_exhaustive()
    }
}

impl Conditioned for GatewayClass {
    fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }
}

impl Conditioned for GatewayConfig {
    fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }
}

impl Conditioned for Gateway {
    fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }
}
