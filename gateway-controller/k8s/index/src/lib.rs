//! Reverse indexes that map changes to dependent objects (Secrets,
//! EndpointSlices) onto the Gateways and HTTPRoutes that reference them.
//!
//! Indexes are computed from the reflector caches on lookup, so the caches
//! remain the only source of truth.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod field_index;
mod watches;

#[cfg(test)]
mod tests;

pub use self::{
    field_index::{FieldIndex, Indexer},
    watches::{
        gateway_certificate_keys, http_route_backend_keys, WatchesModel,
        GATEWAY_CERTIFICATE_INDEX, HTTP_ROUTE_BACKEND_SERVICE_INDEX,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("index {0} is already registered")]
    DuplicateIndex(&'static str),

    #[error("index {0} is not registered")]
    UnknownIndex(String),
}
