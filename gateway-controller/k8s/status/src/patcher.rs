use kube::{
    api::{Api, ApiResource, DynamicObject, Patch, PatchParams},
    Resource, ResourceExt,
};
use parking_lot::Mutex;
use serde_json::json;
use std::{collections::VecDeque, sync::Arc};
use tracing::debug;

const FIELD_MANAGER: &str = "oke-gateway-controller";

/// Identifies the object a patch applies to.
///
/// The resource version is sent with every patch so that writes based on a
/// stale read fail with a conflict.
#[derive(Clone, Debug)]
pub struct Target {
    pub resource: ApiResource,
    pub namespace: Option<String>,
    pub name: String,
    pub resource_version: Option<String>,
}

/// Writes to the Kubernetes API.
#[async_trait::async_trait]
pub trait ResourcePatcher: Send + Sync + 'static {
    /// Merge-patches the status subresource.
    async fn patch_status(&self, target: &Target, status: serde_json::Value)
        -> Result<(), kube::Error>;

    /// Merge-patches object metadata (finalizers, annotations), returning the
    /// resulting resource version.
    async fn patch_metadata(
        &self,
        target: &Target,
        metadata: serde_json::Value,
    ) -> Result<Option<String>, kube::Error>;
}

#[derive(Clone)]
pub struct ClientPatcher {
    client: kube::Client,
    params: PatchParams,
}

/// Records writes instead of sending them.
#[derive(Clone, Debug, Default)]
pub struct RecordingPatcher(Arc<Mutex<Recording>>);

/// A recorded write.
#[derive(Clone, Debug, PartialEq)]
pub struct Write {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub subresource: Option<&'static str>,
    pub patch: serde_json::Value,
}

#[derive(Debug, Default)]
struct Recording {
    writes: Vec<Write>,
    failures: VecDeque<kube::Error>,
}

// === impl Target ===

impl Target {
    pub fn of<K>(obj: &K) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self {
            resource: ApiResource::erase::<K>(&()),
            namespace: obj.namespace(),
            name: obj.name_any(),
            resource_version: obj.resource_version(),
        }
    }

    fn body(&self, field: &str, value: serde_json::Value) -> serde_json::Value {
        let mut patch = json!({});
        patch["apiVersion"] = json!(self.resource.api_version);
        patch["kind"] = json!(self.resource.kind);
        patch[field] = value;
        if let Some(rv) = self.resource_version.as_ref() {
            patch["metadata"]["resourceVersion"] = json!(rv);
        }
        patch
    }

    fn status_patch(&self, status: serde_json::Value) -> serde_json::Value {
        self.body("status", status)
    }

    fn metadata_patch(&self, metadata: serde_json::Value) -> serde_json::Value {
        self.body("metadata", metadata)
    }
}

// === impl ClientPatcher ===

impl ClientPatcher {
    pub fn new(client: kube::Client) -> Self {
        Self {
            client,
            params: PatchParams::apply(FIELD_MANAGER),
        }
    }

    fn api(&self, target: &Target) -> Api<DynamicObject> {
        match target.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &target.resource),
            None => Api::all_with(self.client.clone(), &target.resource),
        }
    }
}

#[async_trait::async_trait]
impl ResourcePatcher for ClientPatcher {
    async fn patch_status(
        &self,
        target: &Target,
        status: serde_json::Value,
    ) -> Result<(), kube::Error> {
        let patch = Patch::Merge(target.status_patch(status));
        self.api(target)
            .patch_status(&target.name, &self.params, &patch)
            .await?;
        debug!(kind = %target.resource.kind, name = %target.name, "Patched status");
        Ok(())
    }

    async fn patch_metadata(
        &self,
        target: &Target,
        metadata: serde_json::Value,
    ) -> Result<Option<String>, kube::Error> {
        let patch = Patch::Merge(target.metadata_patch(metadata));
        let obj = self
            .api(target)
            .patch(&target.name, &self.params, &patch)
            .await?;
        debug!(kind = %target.resource.kind, name = %target.name, "Patched metadata");
        Ok(obj.resource_version())
    }
}

impl std::fmt::Debug for ClientPatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPatcher").finish_non_exhaustive()
    }
}

// === impl RecordingPatcher ===

impl RecordingPatcher {
    pub fn writes(&self) -> Vec<Write> {
        self.0.lock().writes.clone()
    }

    /// Fails the next write with `error`.
    pub fn fail_next(&self, error: kube::Error) {
        self.0.lock().failures.push_back(error);
    }

    fn record(
        &self,
        target: &Target,
        subresource: Option<&'static str>,
        patch: serde_json::Value,
    ) -> Result<(), kube::Error> {
        let mut rec = self.0.lock();
        if let Some(error) = rec.failures.pop_front() {
            return Err(error);
        }
        rec.writes.push(Write {
            kind: target.resource.kind.clone(),
            namespace: target.namespace.clone(),
            name: target.name.clone(),
            subresource,
            patch,
        });
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResourcePatcher for RecordingPatcher {
    async fn patch_status(
        &self,
        target: &Target,
        status: serde_json::Value,
    ) -> Result<(), kube::Error> {
        self.record(target, Some("status"), target.status_patch(status))
    }

    async fn patch_metadata(
        &self,
        target: &Target,
        metadata: serde_json::Value,
    ) -> Result<Option<String>, kube::Error> {
        self.record(target, None, target.metadata_patch(metadata))?;
        Ok(target.resource_version.as_ref().map(|rv| format!("{rv}-m")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oke_gateway_controller_k8s_api::{gateway::GatewaySpec, Gateway, ObjectMeta};
    use pretty_assertions::assert_eq;

    fn gateway() -> Gateway {
        Gateway {
            metadata: ObjectMeta {
                namespace: Some("ns-0".to_string()),
                name: Some("gw-0".to_string()),
                resource_version: Some("42".to_string()),
                ..Default::default()
            },
            spec: GatewaySpec::default(),
            status: None,
        }
    }

    #[test]
    fn status_patch_carries_resource_version() {
        let target = Target::of(&gateway());
        assert_eq!(
            target.status_patch(json!({"conditions": []})),
            json!({
                "apiVersion": "gateway.networking.k8s.io/v1",
                "kind": "Gateway",
                "metadata": {"resourceVersion": "42"},
                "status": {"conditions": []}
            })
        );
    }

    #[test]
    fn metadata_patch_merges_resource_version() {
        let target = Target::of(&gateway());
        assert_eq!(
            target.metadata_patch(json!({"finalizers": ["a"]})),
            json!({
                "apiVersion": "gateway.networking.k8s.io/v1",
                "kind": "Gateway",
                "metadata": {"finalizers": ["a"], "resourceVersion": "42"}
            })
        );
    }

    #[tokio::test]
    async fn records_writes() {
        let patcher = RecordingPatcher::default();
        let target = Target::of(&gateway());
        patcher
            .patch_status(&target, json!({"conditions": []}))
            .await
            .unwrap();
        let writes = patcher.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].kind, "Gateway");
        assert_eq!(writes[0].subresource, Some("status"));
    }
}
