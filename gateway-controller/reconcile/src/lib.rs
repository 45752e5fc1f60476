//! Controllers that program an OCI load balancer from Gateway API resources.
//!
//! Each controller reads its primary object and everything it references
//! from reflector caches held in a shared [`Context`], converges the load
//! balancer through [`LoadBalancerModel`], and then writes status.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod backends;
mod gateway;
mod gateway_class;
mod http_route;
mod load_balancer;
mod names;
mod parents;
pub mod routing_rules;

#[cfg(test)]
mod tests;

pub use self::{
    gateway::GatewayReconciler,
    gateway_class::GatewayClassReconciler,
    http_route::HttpRouteReconciler,
    load_balancer::{LoadBalancerModel, Snapshot},
    parents::{gateways_for_route, routes_for_gateway},
};

use kube::runtime::reflector::{ObjectRef, Store};
use oke_gateway_controller_k8s_api::{
    EndpointSlice, Gateway, GatewayClass, GatewayConfig, HttpRoute, ObjectMeta, Secret, Service,
};
use oke_gateway_controller_k8s_status::StatusWriter;
use std::sync::Arc;

/// Finalizer that holds Gateways until their listeners are removed from the
/// load balancer.
pub const GATEWAY_FINALIZER: &str = "oke-gateway-api.gemyago.github.io/gateway";

/// Finalizer that holds HTTPRoutes until their rules and backend sets are
/// removed from the load balancer.
pub const HTTP_ROUTE_FINALIZER: &str = "oke-gateway-api.gemyago.github.io/httproute";

/// The caches and clients shared by all controllers.
#[derive(Clone)]
pub struct Context {
    pub controller_name: Arc<str>,
    pub gateway_classes: Store<GatewayClass>,
    pub gateway_configs: Store<GatewayConfig>,
    pub gateways: Store<Gateway>,
    pub http_routes: Store<HttpRoute>,
    pub secrets: Store<Secret>,
    pub services: Store<Service>,
    pub endpoint_slices: Store<EndpointSlice>,
    pub status: StatusWriter,
    pub load_balancer: LoadBalancerModel,
}

// === impl Context ===

impl Context {
    /// Returns the class of a Gateway if this controller is responsible for it.
    fn owned_class(&self, gw: &Gateway) -> Option<Arc<GatewayClass>> {
        let class = self
            .gateway_classes
            .get(&ObjectRef::new(&gw.spec.gateway_class_name))?;
        (class.spec.controller_name == *self.controller_name).then_some(class)
    }

    /// The load balancer a Gateway is bound to through its GatewayConfig.
    fn load_balancer_id(&self, gw: &Gateway) -> Option<String> {
        let params = gw.spec.infrastructure.as_ref()?.parameters_ref.as_ref()?;
        let config = self.gateway_configs.get(&ObjectRef::new(&params.name))?;
        Some(config.spec.load_balancer_id.clone())
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("controller_name", &self.controller_name)
            .finish_non_exhaustive()
    }
}

fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .iter()
        .flatten()
        .any(|f| f == finalizer)
}

fn finalizers_with(meta: &ObjectMeta, finalizer: &str) -> Vec<String> {
    let mut finalizers = meta.finalizers.clone().unwrap_or_default();
    if !finalizers.iter().any(|f| f == finalizer) {
        finalizers.push(finalizer.to_string());
    }
    finalizers
}

fn finalizers_without(meta: &ObjectMeta, finalizer: &str) -> Vec<String> {
    meta.finalizers
        .iter()
        .flatten()
        .filter(|f| *f != finalizer)
        .cloned()
        .collect()
}
