#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod error;
pub mod naming;
mod reconcile;

pub use self::{
    error::{FailedCondition, ReconcileError},
    reconcile::{Outcome, Reconciler, Request, RequestContext},
};

/// The default identity used to match `GatewayClass.spec.controllerName`.
pub const CONTROLLER_NAME: &str = "oke-gateway-api.gemyago.github.io/oke-alb-gateway-controller";

/// The API group of the resources this controller defines.
pub const API_GROUP: &str = "oke-gateway-api.gemyago.github.io";

/// The Gateway API group.
pub const GATEWAY_API_GROUP: &str = "gateway.networking.k8s.io";
