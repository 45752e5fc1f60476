//! Resolution of HTTPRoute backend references to load balancer backends.

use crate::Context;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::{runtime::reflector::ObjectRef, ResourceExt};
use oke_gateway_controller_core::ReconcileError;
use oke_gateway_controller_k8s_api::{
    conditions::{reasons, RESOLVED_REFS},
    gateway::{HttpBackendRef, HttpRouteRule},
    Service, SERVICE_NAME_LABEL,
};
use oke_gateway_controller_oci::model::{
    Backend, BackendSet, HealthCheckProtocol, HealthChecker, LoadBalancingPolicy,
};
use tracing::debug;

const DEFAULT_HEALTH_CHECK_PORT: u16 = 80;
const MAX_WEIGHT: i32 = 100;

/// Builds the backend set of a route rule from the ready endpoints of every
/// referenced Service.
pub(crate) fn rule_backend_set(
    cx: &Context,
    route_ns: &str,
    name: String,
    rule: &HttpRouteRule,
) -> Result<BackendSet, ReconcileError> {
    let mut backends = Vec::new();
    let mut health_port = None;
    for backend_ref in &rule.backend_refs {
        let resolved = resolve(cx, route_ns, backend_ref)?;
        health_port = health_port.or(resolved.port);
        backends.extend(resolved.backends);
    }
    backends.sort();
    backends.dedup();

    let health_port = backends
        .first()
        .map(|b| b.port)
        .or(health_port)
        .unwrap_or(DEFAULT_HEALTH_CHECK_PORT);
    Ok(BackendSet {
        name,
        policy: LoadBalancingPolicy::RoundRobin,
        backends,
        health_checker: tcp_health_checker(health_port),
    })
}

pub(crate) fn tcp_health_checker(port: u16) -> HealthChecker {
    HealthChecker {
        protocol: HealthCheckProtocol::Tcp,
        port,
        url_path: None,
        retries: None,
        interval_in_millis: None,
        timeout_in_millis: None,
    }
}

struct Resolved {
    port: Option<u16>,
    backends: Vec<Backend>,
}

fn resolve(
    cx: &Context,
    route_ns: &str,
    backend_ref: &HttpBackendRef,
) -> Result<Resolved, ReconcileError> {
    let group = backend_ref.group.as_deref().unwrap_or_default();
    let kind = backend_ref.kind.as_deref().unwrap_or("Service");
    if !group.is_empty() || kind != "Service" {
        return Err(
            ReconcileError::terminal(format!(
                "backend {} has unsupported kind {group}/{kind}",
                backend_ref.name
            ))
            .with_condition(RESOLVED_REFS, reasons::INVALID_KIND),
        );
    }

    let Some(ref_port) = backend_ref.port else {
        return Err(ReconcileError::terminal(format!(
            "backend {} must specify a port",
            backend_ref.name
        ))
        .with_condition(RESOLVED_REFS, reasons::UNSUPPORTED_VALUE));
    };

    let ns = backend_ref.namespace.as_deref().unwrap_or(route_ns);
    let Some(svc) = cx
        .services
        .get(&ObjectRef::new(&backend_ref.name).within(ns))
    else {
        return Err(ReconcileError::terminal(format!(
            "service {ns}/{} not found",
            backend_ref.name
        ))
        .with_condition(RESOLVED_REFS, reasons::BACKEND_NOT_FOUND));
    };

    let weight = backend_ref.weight.unwrap_or(1).min(MAX_WEIGHT);
    if weight <= 0 {
        debug!(service = %backend_ref.name, "Backend has no weight");
        return Ok(Resolved {
            port: u16::try_from(ref_port).ok(),
            backends: vec![],
        });
    }

    let port_name = service_port_name(&svc, ref_port);
    let backends = cx
        .endpoint_slices
        .state()
        .iter()
        .filter(|s| s.namespace().as_deref() == Some(ns))
        .filter(|s| s.labels().get(SERVICE_NAME_LABEL) == Some(&backend_ref.name))
        .flat_map(|s| slice_backends(s, port_name.as_deref(), ref_port, weight as u32))
        .collect::<Vec<_>>();
    debug!(service = %backend_ref.name, %ns, backends = backends.len(), "Resolved backend");

    Ok(Resolved {
        port: backends
            .first()
            .map(|b| b.port)
            .or_else(|| u16::try_from(ref_port).ok()),
        backends,
    })
}

fn service_port_name(svc: &Service, port: i32) -> Option<String> {
    svc.spec
        .as_ref()?
        .ports
        .as_ref()?
        .iter()
        .find(|p| p.port == port)?
        .name
        .clone()
}

fn slice_backends(
    slice: &EndpointSlice,
    port_name: Option<&str>,
    ref_port: i32,
    weight: u32,
) -> Vec<Backend> {
    let port = slice
        .ports
        .iter()
        .flatten()
        .find(|p| p.name.as_deref().unwrap_or_default() == port_name.unwrap_or_default())
        .and_then(|p| p.port)
        .unwrap_or(ref_port);
    let Ok(port) = u16::try_from(port) else {
        return vec![];
    };

    slice
        .endpoints
        .iter()
        .filter(|ep| {
            ep.conditions
                .as_ref()
                .and_then(|c| c.ready)
                .unwrap_or(true)
        })
        .flat_map(|ep| ep.addresses.iter())
        .map(|ip| Backend {
            ip_address: ip.clone(),
            port,
            weight,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::discovery::v1::{Endpoint, EndpointConditions, EndpointPort};
    use maplit::btreemap;
    use oke_gateway_controller_k8s_api::ObjectMeta;

    fn slice(
        ports: Vec<(Option<&str>, i32)>,
        endpoints: Vec<(&str, Option<bool>)>,
    ) -> EndpointSlice {
        EndpointSlice {
            metadata: ObjectMeta {
                namespace: Some("ns-0".to_string()),
                name: Some("svc-0-abc".to_string()),
                labels: Some(btreemap! {
                    SERVICE_NAME_LABEL.to_string() => "svc-0".to_string(),
                }),
                ..Default::default()
            },
            address_type: "IPv4".to_string(),
            endpoints: endpoints
                .into_iter()
                .map(|(ip, ready)| Endpoint {
                    addresses: vec![ip.to_string()],
                    conditions: Some(EndpointConditions {
                        ready,
                        ..Default::default()
                    }),
                    ..Default::default()
                })
                .collect(),
            ports: Some(
                ports
                    .into_iter()
                    .map(|(name, port)| EndpointPort {
                        name: name.map(str::to_string),
                        port: Some(port),
                        ..Default::default()
                    })
                    .collect(),
            ),
        }
    }

    #[test]
    fn resolves_named_port() {
        let s = slice(
            vec![(Some("metrics"), 9090), (Some("http"), 8080)],
            vec![("10.0.0.1", Some(true))],
        );
        let backends = slice_backends(&s, Some("http"), 80, 1);
        assert_eq!(backends.len(), 1);
        assert_eq!(backends[0].port, 8080);
    }

    #[test]
    fn falls_back_to_reference_port() {
        let s = slice(vec![(Some("other"), 9090)], vec![("10.0.0.1", None)]);
        let backends = slice_backends(&s, Some("http"), 80, 3);
        assert_eq!(backends[0].port, 80);
        assert_eq!(backends[0].weight, 3);
    }

    #[test]
    fn skips_unready_endpoints() {
        let s = slice(
            vec![(None, 8080)],
            vec![("10.0.0.1", Some(true)), ("10.0.0.2", Some(false)), ("10.0.0.3", None)],
        );
        let ips = slice_backends(&s, None, 80, 1)
            .into_iter()
            .map(|b| b.ip_address)
            .collect::<Vec<_>>();
        assert_eq!(ips, vec!["10.0.0.1".to_string(), "10.0.0.3".to_string()]);
    }
}
