//! Names of the OCI resources programmed for Gateways and HTTPRoutes.
//!
//! Every name starts with a short prefix derived from the owning object so
//! that ownership survives truncation to the OCI length limit.

use kube::ResourceExt;
use oke_gateway_controller_core::naming::{self, NameConfig};
use oke_gateway_controller_k8s_api::{Gateway, HttpRoute};

pub(crate) const DEFAULT_CATCH_ALL_RULE: &str = "default_catch_all";

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct GatewayNames {
    prefix: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RouteNames {
    prefix: String,
    route: String,
}

// === impl GatewayNames ===

impl GatewayNames {
    pub(crate) fn new(gw: &Gateway) -> Self {
        Self::from_key(&gw.namespace().unwrap_or_default(), &gw.name_any())
    }

    pub(crate) fn from_key(ns: &str, name: &str) -> Self {
        Self {
            prefix: format!("g{}", naming::hash(&format!("{ns}/{name}"))),
        }
    }

    pub(crate) fn owns(&self, name: &str) -> bool {
        owned_by(&self.prefix, name)
    }

    pub(crate) fn default_backend_set(&self) -> String {
        resource(&format!("{}_default", self.prefix))
    }

    pub(crate) fn listener(&self, listener: &str) -> String {
        resource(&format!("{}_{listener}", self.prefix))
    }

    pub(crate) fn routing_policy(&self, listener: &str) -> String {
        policy(&format!("{}_{listener}_policy", self.prefix))
    }

    pub(crate) fn certificate(&self, ns: &str, name: &str, resource_version: &str) -> String {
        resource(&format!(
            "{}_{ns}_{name}_{resource_version}",
            self.prefix
        ))
    }
}

// === impl RouteNames ===

impl RouteNames {
    pub(crate) fn new(route: &HttpRoute) -> Self {
        let ns = route.namespace().unwrap_or_default();
        let name = route.name_any();
        Self {
            prefix: format!("r{}", naming::hash(&format!("{ns}/{name}"))),
            route: name,
        }
    }

    pub(crate) fn owns(&self, name: &str) -> bool {
        owned_by(&self.prefix, name)
    }

    pub(crate) fn backend_set(&self, rule: usize) -> String {
        resource(&format!("{}_{rule}_{}", self.prefix, self.route))
    }

    pub(crate) fn routing_rule(&self, rule: usize, rule_name: Option<&str>) -> String {
        match rule_name {
            Some(name) => policy(&format!("{}_{rule}_{name}", self.prefix)),
            None => policy(&format!("{}_{rule}", self.prefix)),
        }
    }
}

fn owned_by(prefix: &str, name: &str) -> bool {
    name.strip_prefix(prefix)
        .map_or(false, |rest| rest.starts_with('_'))
}

fn resource(name: &str) -> String {
    naming::construct(name, &NameConfig::resource())
}

fn policy(name: &str) -> String {
    naming::construct(name, &NameConfig::policy())
}
