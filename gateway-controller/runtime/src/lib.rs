//! Process wiring: command-line arguments, the kubert runtime, controller
//! harnesses around the reconcilers, and graceful shutdown.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use oke_gateway_controller_core as core;
pub use oke_gateway_controller_k8s_api as k8s;
pub use oke_gateway_controller_k8s_index as index;
pub use oke_gateway_controller_k8s_status as status;
pub use oke_gateway_controller_oci as oci;
pub use oke_gateway_controller_reconcile as reconcile;

mod args;
mod harness;
mod metrics;
mod middleware;
mod predicates;
mod rate_limit;
mod shutdown;

pub use self::{
    args::Args,
    metrics::ReconcileMetrics,
    middleware::{wireup, HandleErrors, Measured, Middleware, Traced},
    rate_limit::RateLimiter,
    shutdown::{ShutdownError, ShutdownHooks},
};
