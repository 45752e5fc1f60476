use crate::{Error, Indexer};
use kube::{runtime::reflector::ObjectRef, ResourceExt};
use oke_gateway_controller_k8s_api::{
    conditions, EndpointSlice, Gateway, HttpRoute, Secret, SECRET_TYPE_TLS, SERVICE_NAME_LABEL,
    TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY,
};
use std::{collections::BTreeSet, sync::Arc};
use tracing::{debug, trace};

pub const GATEWAY_CERTIFICATE_INDEX: &str = ".metadata.certificates";
pub const HTTP_ROUTE_BACKEND_SERVICE_INDEX: &str = ".metadata.backendRefs.serviceName";

/// Maps Secret and EndpointSlice changes to the objects that must be
/// reconciled again.
#[derive(Clone)]
pub struct WatchesModel {
    indexer: Indexer,
    controller_name: Arc<str>,
}

// === impl WatchesModel ===

impl WatchesModel {
    pub fn new(indexer: Indexer, controller_name: impl Into<Arc<str>>) -> Self {
        Self {
            indexer,
            controller_name: controller_name.into(),
        }
    }

    /// Installs the indexes this model looks up. Must be called once.
    pub fn register_field_indexers(&self, indexer: &Indexer) -> Result<(), Error> {
        let name = self.controller_name.clone();
        indexer
            .http_routes
            .index_field(HTTP_ROUTE_BACKEND_SERVICE_INDEX, move |route| {
                http_route_backend_keys(route, &name)
            })?;

        let name = self.controller_name.clone();
        indexer
            .gateways
            .index_field(GATEWAY_CERTIFICATE_INDEX, move |gw| {
                gateway_certificate_keys(gw, &name)
            })?;

        debug!(
            indexes = ?[HTTP_ROUTE_BACKEND_SERVICE_INDEX, GATEWAY_CERTIFICATE_INDEX],
            "Field indexers registered"
        );
        Ok(())
    }

    pub fn map_secret_to_gateway(&self, secret: &Secret) -> Vec<ObjectRef<Gateway>> {
        if secret.metadata.deletion_timestamp.is_some() {
            trace!(secret = %secret.name_any(), "Ignoring deleted secret");
            return vec![];
        }
        if !is_tls_secret(secret) {
            trace!(secret = %secret.name_any(), "Ignoring non-TLS secret");
            return vec![];
        }

        let key = key(&secret.namespace().unwrap_or_default(), &secret.name_any());
        match self.indexer.gateways.list(GATEWAY_CERTIFICATE_INDEX, &key) {
            Ok(gateways) => {
                let refs = gateways.iter().map(|gw| ObjectRef::from_obj(&**gw)).collect::<Vec<_>>();
                debug!(secret = %key, gateways = refs.len(), "Mapped secret to gateways");
                refs
            }
            Err(error) => {
                tracing::error!(%error, "Failed to look up gateways by certificate");
                vec![]
            }
        }
    }

    pub fn map_endpoint_slice_to_http_route(
        &self,
        slice: &EndpointSlice,
    ) -> Vec<ObjectRef<HttpRoute>> {
        let Some(service) = slice.labels().get(SERVICE_NAME_LABEL) else {
            trace!(slice = %slice.name_any(), "Ignoring EndpointSlice without a service");
            return vec![];
        };

        let key = key(&slice.namespace().unwrap_or_default(), service);
        match self
            .indexer
            .http_routes
            .list(HTTP_ROUTE_BACKEND_SERVICE_INDEX, &key)
        {
            Ok(routes) => {
                let refs = routes.iter().map(|r| ObjectRef::from_obj(&**r)).collect::<Vec<_>>();
                debug!(service = %key, routes = refs.len(), "Mapped EndpointSlice to routes");
                refs
            }
            Err(error) => {
                tracing::error!(%error, "Failed to look up routes by backend service");
                vec![]
            }
        }
    }
}

/// The Secrets referenced by HTTPS listeners of a Gateway this controller
/// has accepted.
pub fn gateway_certificate_keys(gw: &Gateway, controller_name: &str) -> Vec<String> {
    if gw.metadata.deletion_timestamp.is_some() {
        return vec![];
    }
    if gw.annotations().get(controller_name).map(String::as_str) != Some("true") {
        return vec![];
    }

    let ns = gw.namespace().unwrap_or_default();
    let keys = gw
        .spec
        .listeners
        .iter()
        .filter(|l| l.protocol == "HTTPS")
        .filter_map(|l| l.tls.as_ref())
        .flat_map(|tls| tls.certificate_refs.iter())
        .filter(|r| r.kind.as_deref().unwrap_or("Secret") == "Secret")
        .map(|r| key(r.namespace.as_deref().unwrap_or(&ns), &r.name))
        .collect::<BTreeSet<_>>();
    keys.into_iter().collect()
}

/// The Services referenced by an HTTPRoute this controller has programmed.
pub fn http_route_backend_keys(route: &HttpRoute, controller_name: &str) -> Vec<String> {
    if route.metadata.deletion_timestamp.is_some() {
        return vec![];
    }
    let programmed = route.status.iter().flat_map(|s| s.parents.iter()).any(|p| {
        p.controller_name == controller_name
            && p.conditions
                .iter()
                .any(|c| c.type_ == conditions::RESOLVED_REFS && c.status == "True")
    });
    if !programmed {
        return vec![];
    }

    let ns = route.namespace().unwrap_or_default();
    let keys = route
        .spec
        .rules
        .iter()
        .flat_map(|rule| rule.backend_refs.iter())
        .filter(|r| r.kind.as_deref().unwrap_or("Service") == "Service")
        .map(|r| key(r.namespace.as_deref().unwrap_or(&ns), &r.name))
        .collect::<BTreeSet<_>>();
    keys.into_iter().collect()
}

fn is_tls_secret(secret: &Secret) -> bool {
    if secret.type_.as_deref() != Some(SECRET_TYPE_TLS) {
        return false;
    }
    secret
        .data
        .as_ref()
        .map_or(false, |d| d.contains_key(TLS_CERT_KEY) && d.contains_key(TLS_PRIVATE_KEY_KEY))
}

fn key(ns: &str, name: &str) -> String {
    format!("{ns}/{name}")
}
