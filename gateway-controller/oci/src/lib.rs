//! Oracle Cloud Infrastructure load balancer API surface.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod client;
pub mod config;
mod error;
mod http;
mod memory;
pub mod model;
mod signer;
mod work_requests;

pub use self::{
    client::{LoadBalancerClient, SharedClient, WorkRequestId, WorkRequestsClient},
    config::OciConfig,
    error::Error,
    http::HttpLoadBalancerClient,
    memory::{MemoryLoadBalancer, Mutations},
    signer::RequestSigner,
    work_requests::WorkRequestsWatcher,
};
