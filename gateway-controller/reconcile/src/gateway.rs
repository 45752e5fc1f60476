use crate::{
    backends::tcp_health_checker,
    finalizers_with, finalizers_without, has_finalizer,
    names::{GatewayNames, DEFAULT_CATCH_ALL_RULE},
    parents::{self, HTTP_ROUTE_KIND},
    routing_rules, Context, Snapshot, GATEWAY_FINALIZER,
};
use k8s_openapi::ByteString;
use kube::{runtime::reflector::ObjectRef, ResourceExt};
use once_cell::sync::Lazy;
use oke_gateway_controller_core::{
    Outcome, ReconcileError, Reconciler, Request, RequestContext, API_GROUP, GATEWAY_API_GROUP,
};
use oke_gateway_controller_k8s_api::{
    conditions::{reasons, ACCEPTED, PROGRAMMED, RESOLVED_REFS},
    gateway::{GatewayStatus, GatewayStatusAddress, ListenerStatus, RouteGroupKind},
    Gateway, GatewayConfig, SECRET_TYPE_TLS, TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY,
};
use oke_gateway_controller_k8s_status::{
    conditions::{is_true, set_all},
    Conditioned, NewCondition,
};
use oke_gateway_controller_oci::model::{
    BackendSet, CertificateDetails, Listener, ListenerProtocol, LoadBalancingPolicy,
    RoutingPolicy, RoutingRule, RuleAction, SslConfiguration,
};
use regex::Regex;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tracing::{debug, info, warn};

const DEFAULT_BACKEND_SET_PORT: u16 = 80;
const CA_CERT_KEY: &str = "ca.crt";

static LOAD_BALANCER_OCID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^ocid1\.loadbalancer\.[a-z0-9]+\.[a-z0-9-]*(\.[a-z0-9-]*)?\.[a-z0-9]+$")
        .expect("should compile")
});

/// Programs listeners, routing policies and certificates for Gateways of
/// classes this controller manages.
#[derive(Clone, Debug)]
pub struct GatewayReconciler {
    cx: Context,
}

/// The load balancer state a Gateway declares.
#[derive(Debug)]
struct Desired {
    default_backend_set: BackendSet,
    certificates: BTreeMap<String, CertificateDetails>,
    routing_policies: Vec<RoutingPolicy>,
    listeners: Vec<Listener>,
}

// === impl GatewayReconciler ===

impl GatewayReconciler {
    pub fn new(cx: Context) -> Self {
        Self { cx }
    }

    async fn program(&self, rcx: &RequestContext, gw: &mut Gateway) -> Result<(), ReconcileError> {
        let config = self.resolve_config(gw)?;
        let lb = config.spec.load_balancer_id.as_str();
        validate_listeners(gw)?;

        let names = GatewayNames::new(gw);
        let certificates = self.resolve_certificates(gw, &names)?;
        self.ensure_owned(gw).await?;

        let snapshot = {
            let _guard = self.cx.load_balancer.lock(lb).await;
            let snapshot = self.cx.load_balancer.snapshot(lb).await?;
            let desired = desired_state(gw, &names, certificates);
            self.apply(rcx, lb, &names, &desired, &snapshot).await?;
            snapshot
        };

        let addresses = snapshot
            .load_balancer
            .ip_addresses
            .iter()
            .map(|ip| GatewayStatusAddress {
                type_: Some("IPAddress".to_string()),
                value: ip.ip_address.clone(),
            })
            .collect();
        self.write_status(gw, addresses).await?;

        let accepted = NewCondition::new(
            ACCEPTED,
            true,
            reasons::ACCEPTED,
            format!("GatewayConfig accepted by {}", self.cx.controller_name),
        )
        .with_generation(config.metadata.generation);
        self.cx.status.set_condition(&*config, accepted).await?;
        Ok(())
    }

    fn resolve_config(&self, gw: &Gateway) -> Result<Arc<GatewayConfig>, ReconcileError> {
        let invalid = |message: String| {
            ReconcileError::terminal(message).with_condition(ACCEPTED, reasons::INVALID_PARAMETERS)
        };

        let Some(params) = gw
            .spec
            .infrastructure
            .as_ref()
            .and_then(|i| i.parameters_ref.as_ref())
        else {
            return Err(invalid(
                "spec.infrastructure.parametersRef must reference a GatewayConfig".to_string(),
            ));
        };
        if params.group != API_GROUP || params.kind != "GatewayConfig" {
            return Err(invalid(format!(
                "unsupported parametersRef {}/{}",
                params.group, params.kind
            )));
        }

        let Some(config) = self.cx.gateway_configs.get(&ObjectRef::new(&params.name)) else {
            return Err(invalid(format!("GatewayConfig {} not found", params.name)));
        };
        if !LOAD_BALANCER_OCID.is_match(&config.spec.load_balancer_id) {
            return Err(invalid(format!(
                "GatewayConfig {} has an invalid loadBalancerId {:?}",
                params.name, config.spec.load_balancer_id
            )));
        }
        Ok(config)
    }

    /// Loads the certificate of every HTTPS listener, keyed by listener name.
    fn resolve_certificates(
        &self,
        gw: &Gateway,
        names: &GatewayNames,
    ) -> Result<BTreeMap<String, CertificateDetails>, ReconcileError> {
        let invalid = |message: String| {
            ReconcileError::terminal(message).with_condition(ACCEPTED, reasons::LISTENERS_NOT_VALID)
        };
        let gw_ns = gw.namespace().unwrap_or_default();

        let mut certificates = BTreeMap::new();
        for listener in gw.spec.listeners.iter().filter(|l| l.protocol == "HTTPS") {
            // Validated to be present.
            let Some(cert_ref) = listener
                .tls
                .as_ref()
                .and_then(|tls| tls.certificate_refs.first())
            else {
                continue;
            };
            if cert_ref.kind.as_deref().unwrap_or("Secret") != "Secret"
                || !cert_ref.group.as_deref().unwrap_or_default().is_empty()
            {
                return Err(invalid(format!(
                    "listener {} references unsupported certificate kind",
                    listener.name
                )));
            }

            let ns = cert_ref.namespace.as_deref().unwrap_or(&gw_ns);
            let Some(secret) = self
                .cx
                .secrets
                .get(&ObjectRef::new(&cert_ref.name).within(ns))
            else {
                return Err(invalid(format!(
                    "listener {}: secret {ns}/{} not found",
                    listener.name, cert_ref.name
                )));
            };
            if secret.type_.as_deref() != Some(SECRET_TYPE_TLS) {
                return Err(invalid(format!(
                    "listener {}: secret {ns}/{} is not a TLS secret",
                    listener.name, cert_ref.name
                )));
            }

            let data = secret.data.clone().unwrap_or_default();
            let pem = |key: &str| -> Option<Result<String, ReconcileError>> {
                let ByteString(bytes) = data.get(key)?.clone();
                Some(String::from_utf8(bytes).map_err(|_| {
                    invalid(format!("secret {ns}/{} has a malformed {key}", cert_ref.name))
                }))
            };
            let (Some(public_certificate), Some(private_key)) =
                (pem(TLS_CERT_KEY), pem(TLS_PRIVATE_KEY_KEY))
            else {
                return Err(invalid(format!(
                    "listener {}: secret {ns}/{} must contain {TLS_CERT_KEY} and {TLS_PRIVATE_KEY_KEY}",
                    listener.name, cert_ref.name
                )));
            };

            let resource_version = secret.resource_version().unwrap_or_default();
            certificates.insert(
                listener.name.clone(),
                CertificateDetails {
                    certificate_name: names.certificate(ns, &cert_ref.name, &resource_version),
                    public_certificate: public_certificate?,
                    private_key: private_key?,
                    ca_certificate: pem(CA_CERT_KEY).transpose()?,
                },
            );
        }
        Ok(certificates)
    }

    /// Marks the Gateway as managed by this controller.
    async fn ensure_owned(&self, gw: &mut Gateway) -> Result<(), ReconcileError> {
        let controller = &*self.cx.controller_name;
        let annotated = gw.annotations().get(controller).map(String::as_str) == Some("true");
        if annotated && has_finalizer(&gw.metadata, GATEWAY_FINALIZER) {
            return Ok(());
        }

        let finalizers = finalizers_with(&gw.metadata, GATEWAY_FINALIZER);
        let patch = serde_json::json!({
            "annotations": { controller: "true" },
            "finalizers": finalizers,
        });
        if let Some(rv) = self.cx.status.patch_metadata(&*gw, patch).await? {
            gw.metadata.resource_version = Some(rv);
        }
        gw.annotations_mut()
            .insert(controller.to_string(), "true".to_string());
        gw.metadata.finalizers = Some(finalizers);
        debug!(gateway = %gw.name_any(), "Marked gateway as managed");
        Ok(())
    }

    async fn apply(
        &self,
        rcx: &RequestContext,
        lb: &str,
        names: &GatewayNames,
        desired: &Desired,
        snapshot: &Snapshot,
    ) -> Result<(), ReconcileError> {
        let cancel = rcx.cancellation();
        let model = &self.cx.load_balancer;

        let default_set = &desired.default_backend_set;
        model
            .ensure_backend_set(
                cancel,
                lb,
                default_set,
                snapshot.backend_sets.get(&default_set.name),
            )
            .await?;

        for cert in desired.certificates.values() {
            if !snapshot.certificates.contains_key(&cert.certificate_name) {
                model.create_certificate(cancel, lb, cert).await?;
            }
        }

        // Routes own the rules of existing policies.
        for policy in &desired.routing_policies {
            if !snapshot.routing_policies.contains_key(&policy.name) {
                model.ensure_routing_policy(cancel, lb, policy, None).await?;
            }
        }

        for listener in &desired.listeners {
            model
                .ensure_listener(
                    cancel,
                    lb,
                    listener,
                    snapshot.load_balancer.listeners.get(&listener.name),
                )
                .await?;
        }

        let listeners = desired
            .listeners
            .iter()
            .map(|l| l.name.as_str())
            .collect::<BTreeSet<_>>();
        for name in snapshot.load_balancer.listeners.keys() {
            if names.owns(name) && !listeners.contains(name.as_str()) {
                model.delete_listener(cancel, lb, name).await?;
            }
        }

        let policies = desired
            .routing_policies
            .iter()
            .map(|p| p.name.as_str())
            .collect::<BTreeSet<_>>();
        for name in snapshot.routing_policies.keys() {
            if names.owns(name) && !policies.contains(name.as_str()) {
                model.delete_routing_policy(cancel, lb, name).await?;
            }
        }

        let certificates = desired
            .certificates
            .values()
            .map(|c| c.certificate_name.as_str())
            .collect::<BTreeSet<_>>();
        for name in snapshot.certificates.keys() {
            if names.owns(name) && !certificates.contains(name.as_str()) {
                model.delete_certificate(cancel, lb, name).await?;
            }
        }
        Ok(())
    }

    async fn write_status(
        &self,
        gw: &Gateway,
        addresses: Vec<GatewayStatusAddress>,
    ) -> Result<(), ReconcileError> {
        let now = self.cx.status.now();
        let generation = gw.metadata.generation;
        let controller = &self.cx.controller_name;
        let routes = self.cx.http_routes.state();

        let mut status = gw.status.clone().unwrap_or_default();
        status.addresses = addresses;
        set_all(
            &mut status.conditions,
            [
                NewCondition::new(
                    ACCEPTED,
                    true,
                    reasons::ACCEPTED,
                    format!("Gateway accepted by {controller}"),
                ),
                NewCondition::new(
                    PROGRAMMED,
                    true,
                    reasons::PROGRAMMED,
                    format!("Gateway programmed by {controller}"),
                ),
            ]
            .map(|c| c.with_generation(generation)),
            &now,
        );

        let previous = std::mem::take(&mut status.listeners);
        status.listeners = gw
            .spec
            .listeners
            .iter()
            .map(|l| {
                let mut conditions = previous
                    .iter()
                    .find(|s| s.name == l.name)
                    .map(|s| s.conditions.clone())
                    .unwrap_or_default();
                set_all(
                    &mut conditions,
                    [
                        NewCondition::new(ACCEPTED, true, reasons::ACCEPTED, "Listener accepted"),
                        NewCondition::new(
                            RESOLVED_REFS,
                            true,
                            reasons::RESOLVED_REFS,
                            "References resolved",
                        ),
                        NewCondition::new(
                            PROGRAMMED,
                            true,
                            reasons::PROGRAMMED,
                            "Listener programmed",
                        ),
                    ]
                    .map(|c| c.with_generation(generation)),
                    &now,
                );
                let attached = routes
                    .iter()
                    .filter(|r| r.metadata.deletion_timestamp.is_none())
                    .filter(|r| parents::is_attached(r, gw, &l.name))
                    .count();
                ListenerStatus {
                    name: l.name.clone(),
                    supported_kinds: vec![RouteGroupKind {
                        group: Some(GATEWAY_API_GROUP.to_string()),
                        kind: HTTP_ROUTE_KIND.to_string(),
                    }],
                    attached_routes: i32::try_from(attached).unwrap_or(i32::MAX),
                    conditions,
                }
            })
            .collect();

        if gw.status.as_ref() == Some(&status) {
            debug!(gateway = %gw.name_any(), "Status unchanged");
            return Ok(());
        }
        self.cx.status.patch_status(gw, &status).await
    }

    /// Writes the condition a terminal error carries.
    async fn surface(&self, gw: &Gateway, error: &ReconcileError) -> Result<(), ReconcileError> {
        let Some(failed) = error.condition() else {
            return Ok(());
        };
        let condition = NewCondition::new(
            failed.type_.clone(),
            false,
            failed.reason.clone(),
            error.message(),
        )
        .with_generation(gw.metadata.generation);
        self.cx.status.set_condition(gw, condition).await?;
        Ok(())
    }

    async fn deprovision(&self, rcx: &RequestContext, gw: &Gateway) -> anyhow::Result<Outcome> {
        if !has_finalizer(&gw.metadata, GATEWAY_FINALIZER) {
            return Ok(Outcome::done());
        }

        match self.resolve_config(gw) {
            Ok(config) => {
                let lb = config.spec.load_balancer_id.as_str();
                let cancel = rcx.cancellation();
                let model = &self.cx.load_balancer;
                let names = GatewayNames::new(gw);
                let _guard = model.lock(lb).await;
                let snapshot = model.snapshot(lb).await?;

                for name in snapshot.load_balancer.listeners.keys() {
                    if names.owns(name) {
                        model.delete_listener(cancel, lb, name).await?;
                    }
                }
                for name in snapshot.routing_policies.keys() {
                    if names.owns(name) {
                        model.delete_routing_policy(cancel, lb, name).await?;
                    }
                }
                let default_set = names.default_backend_set();
                if snapshot.backend_sets.contains_key(&default_set) {
                    model.delete_backend_set(cancel, lb, &default_set).await?;
                }
                for name in snapshot.certificates.keys() {
                    if names.owns(name) {
                        model.delete_certificate(cancel, lb, name).await?;
                    }
                }
            }
            Err(error) => {
                warn!(gateway = %gw.name_any(), %error, "Load balancer unknown; skipping cleanup");
            }
        }

        let patch = serde_json::json!({
            "finalizers": finalizers_without(&gw.metadata, GATEWAY_FINALIZER),
        });
        self.cx.status.patch_metadata(gw, patch).await?;
        info!(gateway = %gw.name_any(), "Gateway deprovisioned");
        Ok(Outcome::done())
    }
}

#[async_trait::async_trait]
impl Reconciler for GatewayReconciler {
    async fn reconcile(&self, rcx: RequestContext, req: Request) -> anyhow::Result<Outcome> {
        let ns = req.namespace.as_deref().unwrap_or_default();
        let Some(gw) = self.cx.gateways.get(&ObjectRef::new(&req.name).within(ns)) else {
            debug!(gateway = %req, "Gateway removed");
            return Ok(Outcome::done());
        };
        if self.cx.owned_class(&gw).is_none() {
            debug!(
                gateway = %req,
                class = %gw.spec.gateway_class_name,
                "Gateway class not managed"
            );
            return Ok(Outcome::done());
        }

        let mut gw = (*gw).clone();
        if gw.metadata.deletion_timestamp.is_some() {
            return self.deprovision(&rcx, &gw).await;
        }

        match self.program(&rcx, &mut gw).await {
            Ok(()) => {
                info!(gateway = %req, "Gateway programmed");
                Ok(Outcome::done())
            }
            Err(error) => {
                self.surface(&gw, &error).await?;
                Err(error.into())
            }
        }
    }
}

fn validate_listeners(gw: &Gateway) -> Result<(), ReconcileError> {
    let invalid = |message: String| {
        ReconcileError::terminal(message).with_condition(ACCEPTED, reasons::LISTENERS_NOT_VALID)
    };

    let mut seen = BTreeSet::new();
    for l in &gw.spec.listeners {
        if !seen.insert(l.name.as_str()) {
            return Err(invalid(format!("duplicate listener {}", l.name)));
        }
        if !matches!(l.protocol.as_str(), "HTTP" | "HTTPS") {
            return Err(invalid(format!(
                "listener {} has unsupported protocol {}",
                l.name, l.protocol
            )));
        }
        if u16::try_from(l.port).map_or(true, |p| p == 0) {
            return Err(invalid(format!("listener {} has invalid port {}", l.name, l.port)));
        }
        let has_certificate = l
            .tls
            .as_ref()
            .map_or(false, |tls| !tls.certificate_refs.is_empty());
        if l.protocol == "HTTPS" && !has_certificate {
            return Err(invalid(format!(
                "HTTPS listener {} must reference a certificate",
                l.name
            )));
        }
    }
    Ok(())
}

fn desired_state(
    gw: &Gateway,
    names: &GatewayNames,
    certificates: BTreeMap<String, CertificateDetails>,
) -> Desired {
    let default_backend_set = BackendSet {
        name: names.default_backend_set(),
        policy: LoadBalancingPolicy::RoundRobin,
        backends: vec![],
        health_checker: tcp_health_checker(DEFAULT_BACKEND_SET_PORT),
    };

    let routing_policies = gw
        .spec
        .listeners
        .iter()
        .map(|l| RoutingPolicy {
            name: names.routing_policy(&l.name),
            condition_language_version: RoutingPolicy::CONDITION_LANGUAGE_V1.to_string(),
            rules: vec![catch_all_rule(&default_backend_set.name)],
        })
        .collect();

    let listeners = gw
        .spec
        .listeners
        .iter()
        .map(|l| Listener {
            name: names.listener(&l.name),
            default_backend_set_name: default_backend_set.name.clone(),
            port: u16::try_from(l.port).unwrap_or_default(),
            protocol: ListenerProtocol::Http,
            routing_policy_name: Some(names.routing_policy(&l.name)),
            ssl_configuration: certificates.get(&l.name).map(|c| SslConfiguration {
                certificate_name: Some(c.certificate_name.clone()),
                verify_peer_certificate: Some(false),
            }),
        })
        .collect();

    // Listeners sharing a secret share its certificate.
    let certificates = certificates
        .into_values()
        .map(|c| (c.certificate_name.clone(), c))
        .collect();

    Desired {
        default_backend_set,
        certificates,
        routing_policies,
        listeners,
    }
}

pub(crate) fn catch_all_rule(default_backend_set: &str) -> RoutingRule {
    RoutingRule {
        name: DEFAULT_CATCH_ALL_RULE.to_string(),
        condition: routing_rules::catch_all_condition(),
        actions: vec![RuleAction::forward_to(default_backend_set)],
    }
}

/// Returns true if the Gateway was accepted at its current generation.
pub(crate) fn is_accepted(gw: &Gateway) -> bool {
    is_true(gw.conditions(), ACCEPTED, gw.metadata.generation)
}
