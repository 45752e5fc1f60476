#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod conditions;
pub mod gateway;
pub mod gateway_config;

pub use self::{
    gateway::{Gateway, GatewayClass, HttpRoute},
    gateway_config::GatewayConfig,
};
pub use k8s_openapi::{
    api::{
        core::v1::{Secret, Service},
        discovery::v1::EndpointSlice,
    },
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
};
pub use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, ResourceExt},
    runtime::reflector::{ObjectRef, Store},
    Client, Resource,
};

/// The label EndpointSlices carry to name their Service.
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// The Secret type of TLS certificates.
pub const SECRET_TYPE_TLS: &str = "kubernetes.io/tls";
pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";
