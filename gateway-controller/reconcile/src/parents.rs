//! Attachment of HTTPRoutes to Gateway listeners.

use kube::{runtime::reflector::ObjectRef, ResourceExt};
use oke_gateway_controller_core::GATEWAY_API_GROUP;
use oke_gateway_controller_k8s_api::{
    conditions::{reasons, RESOLVED_REFS},
    gateway::{Listener, ParentReference},
    Gateway, HttpRoute,
};
use oke_gateway_controller_k8s_status::conditions::is_true;
use std::sync::Arc;

pub(crate) const HTTP_ROUTE_KIND: &str = "HTTPRoute";

/// The Gateway a parent reference points to, if it points to a Gateway.
pub(crate) fn gateway_ref(
    route: &HttpRoute,
    parent: &ParentReference,
) -> Option<ObjectRef<Gateway>> {
    if parent.group.as_deref().unwrap_or(GATEWAY_API_GROUP) != GATEWAY_API_GROUP
        || parent.kind.as_deref().unwrap_or("Gateway") != "Gateway"
    {
        return None;
    }
    let ns = parent
        .namespace
        .clone()
        .or_else(|| route.namespace())
        .unwrap_or_default();
    Some(ObjectRef::new(&parent.name).within(&ns))
}

/// Returns the listeners of `gw` the route attaches to through `parent`, or
/// the reason the route is not attached.
pub(crate) fn attached_listeners<'g>(
    route: &HttpRoute,
    parent: &ParentReference,
    gw: &'g Gateway,
) -> Result<Vec<&'g Listener>, &'static str> {
    let selected = gw
        .spec
        .listeners
        .iter()
        .filter(|l| {
            parent
                .section_name
                .as_ref()
                .map_or(true, |name| *name == l.name)
        })
        .filter(|l| parent.port.map_or(true, |port| port == l.port))
        .filter(|l| matches!(l.protocol.as_str(), "HTTP" | "HTTPS"))
        .collect::<Vec<_>>();
    if selected.is_empty() {
        return Err(reasons::NO_MATCHING_PARENT);
    }

    let gw_ns = gw.namespace().unwrap_or_default();
    let route_ns = route.namespace().unwrap_or_default();
    let allowed = selected
        .into_iter()
        .filter(|l| allows_route(l, &gw_ns, &route_ns))
        .collect::<Vec<_>>();
    if allowed.is_empty() {
        return Err(reasons::NOT_ALLOWED_BY_LISTENERS);
    }
    Ok(allowed)
}

/// Returns true if `route` attaches to the named listener of `gw`.
pub(crate) fn is_attached(route: &HttpRoute, gw: &Gateway, listener: &str) -> bool {
    let gw_ref = ObjectRef::from_obj(gw);
    route.spec.parent_refs.iter().any(|parent| {
        gateway_ref(route, parent).as_ref() == Some(&gw_ref)
            && attached_listeners(route, parent, gw)
                .map_or(false, |ls| ls.iter().any(|l| l.name == listener))
    })
}

/// Returns true if this controller resolved the route's references for at
/// least one parent.
pub(crate) fn is_programmed(route: &HttpRoute, controller_name: &str) -> bool {
    route
        .status
        .iter()
        .flat_map(|s| s.parents.iter())
        .filter(|p| p.controller_name == controller_name)
        .any(|p| is_true(&p.conditions, RESOLVED_REFS, None))
}

/// The routes that reference a Gateway as a parent.
pub fn routes_for_gateway(routes: &[Arc<HttpRoute>], gw: &Gateway) -> Vec<ObjectRef<HttpRoute>> {
    let gw_ref = ObjectRef::from_obj(gw);
    routes
        .iter()
        .filter(|route| {
            route
                .spec
                .parent_refs
                .iter()
                .any(|p| gateway_ref(route, p).as_ref() == Some(&gw_ref))
        })
        .map(|route| ObjectRef::from_obj(&**route))
        .collect()
}

/// The Gateways a route references as parents, so that their attached
/// route counts follow the route.
pub fn gateways_for_route(route: &HttpRoute) -> Vec<ObjectRef<Gateway>> {
    route
        .spec
        .parent_refs
        .iter()
        .filter_map(|p| gateway_ref(route, p))
        .collect()
}

fn allows_route(listener: &Listener, gw_ns: &str, route_ns: &str) -> bool {
    let Some(allowed) = listener.allowed_routes.as_ref() else {
        return gw_ns == route_ns;
    };

    let kind_allowed = allowed.kinds.is_empty()
        || allowed.kinds.iter().any(|k| {
            k.kind == HTTP_ROUTE_KIND
                && k.group.as_deref().unwrap_or(GATEWAY_API_GROUP) == GATEWAY_API_GROUP
        });
    let from = allowed
        .namespaces
        .as_ref()
        .and_then(|ns| ns.from.as_deref())
        .unwrap_or("Same");
    let namespace_allowed = match from {
        "All" => true,
        "Same" => gw_ns == route_ns,
        // Label selectors are not supported.
        _ => false,
    };
    kind_allowed && namespace_allowed
}
