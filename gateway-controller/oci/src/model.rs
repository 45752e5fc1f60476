//! Load balancer resources as exchanged with the OCI API.
//!
//! Only the fields this controller reads or writes are modeled; anything else
//! returned by the API is ignored on decode.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancer {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub ip_addresses: Vec<IpAddress>,
    #[serde(default)]
    pub listeners: BTreeMap<String, Listener>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IpAddress {
    pub ip_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_public: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    pub name: String,
    pub default_backend_set_name: String,
    pub port: u16,
    pub protocol: ListenerProtocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_policy_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_configuration: Option<SslConfiguration>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListenerProtocol {
    Http,
    Http2,
    Tcp,
    Grpc,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SslConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_peer_certificate: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSet {
    pub name: String,
    pub policy: LoadBalancingPolicy,
    #[serde(default)]
    pub backends: Vec<Backend>,
    pub health_checker: HealthChecker,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalancingPolicy {
    RoundRobin,
    LeastConnections,
    IpHash,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
    pub ip_address: String,
    pub port: u16,
    #[serde(default = "Backend::default_weight")]
    pub weight: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthChecker {
    pub protocol: HealthCheckProtocol,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_in_millis: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_in_millis: Option<u32>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthCheckProtocol {
    Http,
    Tcp,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingPolicy {
    pub name: String,
    #[serde(default = "RoutingPolicy::default_condition_language")]
    pub condition_language_version: String,
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    pub name: String,
    pub condition: String,
    pub actions: Vec<RuleAction>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "name", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleAction {
    ForwardToBackendset {
        #[serde(rename = "backendSetName")]
        backend_set_name: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    pub certificate_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_certificate: Option<String>,
}

/// The body of a certificate upload.
#[derive(Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateDetails {
    pub certificate_name: String,
    pub public_certificate: String,
    pub private_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_certificate: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRequest {
    pub id: String,
    pub lifecycle_state: WorkRequestState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkRequestState {
    Accepted,
    InProgress,
    Succeeded,
    Failed,
    Canceled,
}

// === impl Backend ===

impl Backend {
    fn default_weight() -> u32 {
        1
    }
}

// === impl RoutingPolicy ===

impl RoutingPolicy {
    pub const CONDITION_LANGUAGE_V1: &'static str = "V1";

    fn default_condition_language() -> String {
        Self::CONDITION_LANGUAGE_V1.to_string()
    }

    /// Names of the backend sets this policy forwards to.
    pub fn backend_set_names(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().flat_map(|r| {
            r.actions.iter().map(|a| match a {
                RuleAction::ForwardToBackendset { backend_set_name } => backend_set_name.as_str(),
            })
        })
    }
}

// === impl RuleAction ===

impl RuleAction {
    pub fn forward_to(backend_set_name: impl Into<String>) -> Self {
        Self::ForwardToBackendset {
            backend_set_name: backend_set_name.into(),
        }
    }
}

// === impl CertificateDetails ===

impl fmt::Debug for CertificateDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateDetails")
            .field("certificate_name", &self.certificate_name)
            .field("private_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

// === impl WorkRequestState ===

impl WorkRequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "ACCEPTED",
            Self::InProgress => "IN_PROGRESS",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for WorkRequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
