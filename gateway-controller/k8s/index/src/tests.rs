use super::*;
use k8s_openapi::{
    api::discovery::v1::EndpointSlice, apimachinery::pkg::apis::meta::v1::Time,
    ByteString,
};
use kube::runtime::{
    reflector::{store::Writer, ObjectRef},
    watcher,
};
use maplit::{btreemap, convert_args};
use oke_gateway_controller_k8s_api::{Gateway, HttpRoute, Secret};
use pretty_assertions::assert_eq;
use serde_json::json;

const CONTROLLER: &str = "example.com/gateway-controller";

fn gateway(ns: &str, name: &str, annotated: bool, certs: &[(&str, Option<&str>)]) -> Gateway {
    let refs = certs
        .iter()
        .map(|(name, ns)| match ns {
            Some(ns) => json!({"name": name, "namespace": ns}),
            None => json!({"name": name}),
        })
        .collect::<Vec<_>>();
    let annotations = if annotated {
        json!({ CONTROLLER: "true" })
    } else {
        json!({})
    };
    serde_json::from_value(json!({
        "apiVersion": "gateway.networking.k8s.io/v1",
        "kind": "Gateway",
        "metadata": {"namespace": ns, "name": name, "annotations": annotations},
        "spec": {
            "gatewayClassName": "oke",
            "listeners": [
                {"name": "http", "port": 80, "protocol": "HTTP"},
                {
                    "name": "https",
                    "port": 443,
                    "protocol": "HTTPS",
                    "tls": {"certificateRefs": refs}
                }
            ]
        }
    }))
    .expect("gateway must decode")
}

fn route(ns: &str, name: &str, resolved: Option<&str>, backends: &[&str]) -> HttpRoute {
    let refs = backends
        .iter()
        .map(|name| json!({"name": name, "port": 80}))
        .collect::<Vec<_>>();
    let parents = match resolved {
        Some(status) => json!([{
            "parentRef": {"name": "gw-0"},
            "controllerName": CONTROLLER,
            "conditions": [{
                "type": "ResolvedRefs",
                "status": status,
                "reason": "ResolvedRefs",
                "message": "",
                "lastTransitionTime": "2024-01-01T00:00:00Z"
            }]
        }]),
        None => json!([]),
    };
    serde_json::from_value(json!({
        "apiVersion": "gateway.networking.k8s.io/v1",
        "kind": "HTTPRoute",
        "metadata": {"namespace": ns, "name": name},
        "spec": {
            "parentRefs": [{"name": "gw-0"}],
            "rules": [{"backendRefs": refs}]
        },
        "status": {"parents": parents}
    }))
    .expect("route must decode")
}

fn tls_secret(ns: &str, name: &str) -> Secret {
    Secret {
        metadata: oke_gateway_controller_k8s_api::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(btreemap! {
            "tls.crt".to_string() => ByteString(b"cert".to_vec()),
            "tls.key".to_string() => ByteString(b"key".to_vec()),
        }),
        ..Default::default()
    }
}

fn slice(ns: &str, name: &str, service: Option<&str>) -> EndpointSlice {
    let labels = service.map(|svc| {
        convert_args!(btreemap!(
            "kubernetes.io/service-name" => svc,
        ))
    });
    EndpointSlice {
        metadata: oke_gateway_controller_k8s_api::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            labels,
            ..Default::default()
        },
        address_type: "IPv4".to_string(),
        endpoints: vec![],
        ports: None,
    }
}

fn model(gateways: Vec<Gateway>, routes: Vec<HttpRoute>) -> WatchesModel {
    let mut gw_writer = Writer::<Gateway>::default();
    for gw in gateways {
        gw_writer.apply_watcher_event(&watcher::Event::Applied(gw));
    }
    let mut route_writer = Writer::<HttpRoute>::default();
    for route in routes {
        route_writer.apply_watcher_event(&watcher::Event::Applied(route));
    }

    let indexer = Indexer::new(gw_writer.as_reader(), route_writer.as_reader());
    let model = WatchesModel::new(indexer.clone(), CONTROLLER);
    model
        .register_field_indexers(&indexer)
        .expect("indexers must register");
    model
}

fn sorted<K: kube::Resource<DynamicType = ()>>(mut refs: Vec<ObjectRef<K>>) -> Vec<String> {
    let mut names = refs
        .drain(..)
        .map(|r| format!("{}/{}", r.namespace.unwrap_or_default(), r.name))
        .collect::<Vec<_>>();
    names.sort();
    names
}

#[test]
fn certificate_keys_default_to_gateway_namespace() {
    let gw = gateway("ns-0", "gw-0", true, &[("cert-0", None), ("cert-1", Some("ns-1"))]);
    assert_eq!(
        gateway_certificate_keys(&gw, CONTROLLER),
        vec!["ns-0/cert-0".to_string(), "ns-1/cert-1".to_string()]
    );
}

#[test]
fn certificate_keys_deduplicate() {
    let gw = gateway("ns-0", "gw-0", true, &[("cert-0", None), ("cert-0", Some("ns-0"))]);
    assert_eq!(
        gateway_certificate_keys(&gw, CONTROLLER),
        vec!["ns-0/cert-0".to_string()]
    );
}

#[test]
fn certificate_keys_require_ownership() {
    let gw = gateway("ns-0", "gw-0", false, &[("cert-0", None)]);
    assert!(gateway_certificate_keys(&gw, CONTROLLER).is_empty());

    let mut gw = gateway("ns-0", "gw-0", true, &[("cert-0", None)]);
    gw.metadata.deletion_timestamp = Some(Time(Default::default()));
    assert!(gateway_certificate_keys(&gw, CONTROLLER).is_empty());
}

#[test]
fn backend_keys_require_resolved_refs() {
    let r = route("ns-0", "route-0", Some("True"), &["svc-1", "svc-0", "svc-1"]);
    assert_eq!(
        http_route_backend_keys(&r, CONTROLLER),
        vec!["ns-0/svc-0".to_string(), "ns-0/svc-1".to_string()]
    );

    let r = route("ns-0", "route-0", Some("False"), &["svc-0"]);
    assert!(http_route_backend_keys(&r, CONTROLLER).is_empty());

    let r = route("ns-0", "route-0", None, &["svc-0"]);
    assert!(http_route_backend_keys(&r, CONTROLLER).is_empty());
}

#[test]
fn maps_secret_to_referencing_gateways() {
    let model = model(
        vec![
            gateway("ns-0", "gw-0", true, &[("cert-0", None)]),
            gateway("ns-1", "gw-1", true, &[("cert-0", Some("ns-0"))]),
            gateway("ns-0", "gw-2", true, &[("cert-1", None)]),
            gateway("ns-0", "gw-3", false, &[("cert-0", None)]),
        ],
        vec![],
    );

    let refs = model.map_secret_to_gateway(&tls_secret("ns-0", "cert-0"));
    assert_eq!(
        sorted(refs),
        vec!["ns-0/gw-0".to_string(), "ns-1/gw-1".to_string()]
    );
}

#[test]
fn ignores_non_tls_secrets() {
    let model = model(vec![gateway("ns-0", "gw-0", true, &[("cert-0", None)])], vec![]);

    let mut secret = tls_secret("ns-0", "cert-0");
    secret.type_ = Some("Opaque".to_string());
    assert!(model.map_secret_to_gateway(&secret).is_empty());

    let mut secret = tls_secret("ns-0", "cert-0");
    if let Some(data) = secret.data.as_mut() {
        data.remove("tls.key");
    }
    assert!(model.map_secret_to_gateway(&secret).is_empty());

    let mut secret = tls_secret("ns-0", "cert-0");
    secret.metadata.deletion_timestamp = Some(Time(Default::default()));
    assert!(model.map_secret_to_gateway(&secret).is_empty());
}

#[test]
fn maps_endpoint_slice_to_routes() {
    let model = model(
        vec![],
        vec![
            route("ns-0", "route-0", Some("True"), &["svc-0"]),
            route("ns-0", "route-1", Some("True"), &["svc-1"]),
            route("ns-0", "route-2", Some("False"), &["svc-0"]),
            route("ns-1", "route-3", Some("True"), &["svc-0"]),
        ],
    );

    let refs = model.map_endpoint_slice_to_http_route(&slice("ns-0", "svc-0-abc", Some("svc-0")));
    assert_eq!(sorted(refs), vec!["ns-0/route-0".to_string()]);

    let refs = model.map_endpoint_slice_to_http_route(&slice("ns-0", "orphan", None));
    assert!(refs.is_empty());
}

#[test]
fn rejects_duplicate_registration() {
    let indexer = Indexer::new(
        Writer::<Gateway>::default().as_reader(),
        Writer::<HttpRoute>::default().as_reader(),
    );
    let model = WatchesModel::new(indexer.clone(), CONTROLLER);
    model.register_field_indexers(&indexer).expect("first registration");
    assert!(matches!(
        model.register_field_indexers(&indexer),
        Err(Error::DuplicateIndex(_))
    ));
}

#[test]
fn unknown_index_is_an_error() {
    let indexer = Indexer::new(
        Writer::<Gateway>::default().as_reader(),
        Writer::<HttpRoute>::default().as_reader(),
    );
    assert!(matches!(
        indexer.gateways.list("nope", "ns/name"),
        Err(Error::UnknownIndex(_))
    ));
}
