use crate::Condition;

/// Binds Gateways to an existing OCI load balancer.
#[derive(
    Clone,
    Debug,
    Default,
    PartialEq,
    kube::CustomResource,
    serde::Deserialize,
    serde::Serialize,
    schemars::JsonSchema,
)]
#[kube(
    group = "oke-gateway-api.gemyago.github.io",
    version = "v1",
    kind = "GatewayConfig",
    status = "GatewayConfigStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfigSpec {
    /// The OCID of the OCI load balancer used by Gateways referencing this
    /// config.
    pub load_balancer_id: String,
}

#[derive(
    Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfigStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
