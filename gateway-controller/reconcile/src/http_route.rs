use crate::{
    backends, finalizers_with, finalizers_without,
    gateway::{catch_all_rule, is_accepted},
    has_finalizer,
    names::{GatewayNames, RouteNames},
    parents, routing_rules, Context, HTTP_ROUTE_FINALIZER,
};
use kube::{runtime::reflector::ObjectRef, ResourceExt};
use oke_gateway_controller_core::{Outcome, ReconcileError, Reconciler, Request, RequestContext};
use oke_gateway_controller_k8s_api::{
    conditions::{reasons, ACCEPTED, RESOLVED_REFS},
    gateway::{HttpRouteStatus, ParentReference, RouteParentStatus},
    Gateway, HttpRoute,
};
use oke_gateway_controller_k8s_status::{conditions::set_all, NewCondition};
use oke_gateway_controller_oci::model::{BackendSet, RoutingPolicy, RoutingRule, RuleAction};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tracing::{debug, info, warn};

/// Programs routing rules and backend sets for HTTPRoutes attached to managed
/// Gateways.
#[derive(Clone, Debug)]
pub struct HttpRouteReconciler {
    cx: Context,
}

/// A managed Gateway the route references.
#[derive(Debug)]
struct Parent {
    parent_ref: ParentReference,
    gateway: Arc<Gateway>,
    load_balancer: String,
    /// The listeners the route attaches to, or why it attaches to none.
    listeners: Result<Vec<String>, &'static str>,
}

/// What the route programs on one load balancer.
#[derive(Debug, Default)]
struct Placement {
    listeners: Vec<(Arc<Gateway>, String)>,
}

// === impl HttpRouteReconciler ===

impl HttpRouteReconciler {
    pub fn new(cx: Context) -> Self {
        Self { cx }
    }

    /// Resolves the parent references that point at Gateways this controller
    /// manages.
    fn resolve_parents(&self, route: &HttpRoute) -> Vec<Parent> {
        let mut resolved = Vec::new();
        for parent_ref in &route.spec.parent_refs {
            let Some(gw_ref) = parents::gateway_ref(route, parent_ref) else {
                continue;
            };
            let Some(gateway) = self.cx.gateways.get(&gw_ref) else {
                debug!(gateway = %gw_ref, "Parent gateway not found");
                continue;
            };
            if self.cx.owned_class(&gateway).is_none() {
                continue;
            }
            let Some(load_balancer) = self.cx.load_balancer_id(&gateway) else {
                debug!(gateway = %gw_ref, "Parent gateway is not bound to a load balancer");
                continue;
            };
            let listeners = parents::attached_listeners(route, parent_ref, &gateway)
                .map(|ls| ls.into_iter().map(|l| l.name.clone()).collect());
            resolved.push(Parent {
                parent_ref: parent_ref.clone(),
                gateway,
                load_balancer,
                listeners,
            });
        }
        resolved
    }

    /// Load balancers this controller previously programmed the route on.
    fn previous_load_balancers(&self, route: &HttpRoute) -> BTreeSet<String> {
        route
            .status
            .iter()
            .flat_map(|s| s.parents.iter())
            .filter(|p| p.controller_name == *self.cx.controller_name)
            .filter_map(|p| parents::gateway_ref(route, &p.parent_ref))
            .filter_map(|gw_ref| self.cx.gateways.get(&gw_ref))
            .filter_map(|gw| self.cx.load_balancer_id(&gw))
            .collect()
    }

    async fn program(
        &self,
        rcx: &RequestContext,
        route: &mut HttpRoute,
        parents: &[Parent],
    ) -> Result<(), ReconcileError> {
        let ns = route.namespace().unwrap_or_default();
        let names = RouteNames::new(route);
        let rules = route_rules(route, &names)?;
        let backend_sets = route
            .spec
            .rules
            .iter()
            .enumerate()
            .map(|(idx, rule)| {
                backends::rule_backend_set(&self.cx, &ns, names.backend_set(idx), rule)
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.ensure_finalizer(route).await?;

        let mut placements = self
            .previous_load_balancers(route)
            .into_iter()
            .map(|lb| (lb, Placement::default()))
            .collect::<BTreeMap<_, _>>();
        for parent in parents {
            let Ok(listeners) = parent.listeners.as_ref() else {
                continue;
            };
            let placement = placements.entry(parent.load_balancer.clone()).or_default();
            for listener in listeners {
                placement
                    .listeners
                    .push((parent.gateway.clone(), listener.clone()));
            }
        }

        for (lb, placement) in &placements {
            let sets: &[BackendSet] = if placement.listeners.is_empty() {
                &[]
            } else {
                &backend_sets
            };
            self.sync_load_balancer(rcx, lb, route, &names, &placement.listeners, &rules, sets)
                .await?;
        }
        Ok(())
    }

    /// Converges one load balancer: the route's backend sets exist, the
    /// policies of the listeners it attaches to carry its rules, no other
    /// policy does, and backend sets it no longer uses are removed.
    #[allow(clippy::too_many_arguments)]
    async fn sync_load_balancer(
        &self,
        rcx: &RequestContext,
        lb: &str,
        route: &HttpRoute,
        names: &RouteNames,
        listeners: &[(Arc<Gateway>, String)],
        rules: &[RoutingRule],
        backend_sets: &[BackendSet],
    ) -> Result<(), ReconcileError> {
        let cancel = rcx.cancellation();
        let model = &self.cx.load_balancer;
        let _guard = model.lock(lb).await;
        let snapshot = model.snapshot(lb).await?;

        for set in backend_sets {
            model
                .ensure_backend_set(cancel, lb, set, snapshot.backend_sets.get(&set.name))
                .await?;
        }

        let mut updated = BTreeSet::new();
        for (gw, listener) in listeners {
            let gw_names = GatewayNames::new(gw);
            let policy_name = gw_names.routing_policy(listener);
            let Some(current) = snapshot.routing_policies.get(&policy_name) else {
                return Err(ReconcileError::retriable(format!(
                    "routing policy {policy_name} of gateway {}/{} not found",
                    gw.namespace().unwrap_or_default(),
                    gw.name_any()
                )));
            };
            let desired = self.listener_policy(gw, listener, &gw_names, current, route, rules);
            model
                .ensure_routing_policy(cancel, lb, &desired, Some(current))
                .await?;
            updated.insert(policy_name);
        }

        for (name, policy) in &snapshot.routing_policies {
            if updated.contains(name) || !policy.rules.iter().any(|r| names.owns(&r.name)) {
                continue;
            }
            let desired = RoutingPolicy {
                rules: policy
                    .rules
                    .iter()
                    .filter(|r| !names.owns(&r.name))
                    .cloned()
                    .collect(),
                ..policy.clone()
            };
            debug!(policy = %name, "Removing route rules from detached listener");
            model
                .ensure_routing_policy(cancel, lb, &desired, Some(policy))
                .await?;
        }

        let keep = backend_sets
            .iter()
            .map(|s| s.name.as_str())
            .collect::<BTreeSet<_>>();
        for name in snapshot.backend_sets.keys() {
            if names.owns(name) && !keep.contains(name.as_str()) {
                model.delete_backend_set(cancel, lb, name).await?;
            }
        }
        Ok(())
    }

    /// Computes a listener's policy from every route attached to it, oldest
    /// first, followed by the catch-all rule.
    ///
    /// Other routes count once they are programmed, either in the cache or on
    /// the policy itself. A route's status may reach the cache after its rules
    /// reach the load balancer.
    fn listener_policy(
        &self,
        gw: &Gateway,
        listener: &str,
        gw_names: &GatewayNames,
        current: &RoutingPolicy,
        route: &HttpRoute,
        rules: &[RoutingRule],
    ) -> RoutingPolicy {
        let route_ref = ObjectRef::from_obj(route);
        let mut attached = self
            .cx
            .http_routes
            .state()
            .into_iter()
            .filter(|r| ObjectRef::from_obj(&**r) != route_ref)
            .filter(|r| r.metadata.deletion_timestamp.is_none())
            .filter(|r| {
                parents::is_programmed(r, &self.cx.controller_name)
                    || programs_rules(current, r)
            })
            .filter(|r| parents::is_attached(r, gw, listener))
            .collect::<Vec<_>>();
        attached.push(Arc::new(route.clone()));
        attached.sort_by_key(|r| {
            (
                r.metadata.creation_timestamp.as_ref().map(|t| t.0),
                r.namespace().unwrap_or_default(),
                r.name_any(),
            )
        });

        let mut policy_rules = Vec::new();
        for r in &attached {
            if ObjectRef::from_obj(&**r) == route_ref {
                policy_rules.extend_from_slice(rules);
                continue;
            }
            match route_rules(r, &RouteNames::new(r)) {
                Ok(rules) => policy_rules.extend(rules),
                Err(error) => {
                    warn!(route = %r.name_any(), %error, "Skipping route with unsupported rules")
                }
            }
        }
        policy_rules.push(catch_all_rule(&gw_names.default_backend_set()));

        RoutingPolicy {
            name: current.name.clone(),
            condition_language_version: current.condition_language_version.clone(),
            rules: policy_rules,
        }
    }

    async fn ensure_finalizer(&self, route: &mut HttpRoute) -> Result<(), ReconcileError> {
        if has_finalizer(&route.metadata, HTTP_ROUTE_FINALIZER) {
            return Ok(());
        }
        let finalizers = finalizers_with(&route.metadata, HTTP_ROUTE_FINALIZER);
        let patch = serde_json::json!({ "finalizers": finalizers });
        if let Some(rv) = self.cx.status.patch_metadata(&*route, patch).await? {
            route.metadata.resource_version = Some(rv);
        }
        route.metadata.finalizers = Some(finalizers);
        Ok(())
    }

    /// Writes a status entry for each managed parent, preserving the entries
    /// of other controllers.
    async fn write_status(
        &self,
        route: &HttpRoute,
        parents: &[Parent],
        failure: Option<&ReconcileError>,
    ) -> Result<(), ReconcileError> {
        let now = self.cx.status.now();
        let generation = route.metadata.generation;
        let controller = &*self.cx.controller_name;
        let previous = route.status.clone().unwrap_or_default().parents;

        let mut statuses = previous
            .iter()
            .filter(|p| p.controller_name != controller)
            .cloned()
            .collect::<Vec<_>>();
        for parent in parents {
            let mut conditions = previous
                .iter()
                .find(|p| p.controller_name == controller && p.parent_ref == parent.parent_ref)
                .map(|p| p.conditions.clone())
                .unwrap_or_default();
            let new = parent_conditions(parent, failure)
                .into_iter()
                .map(|c| c.with_generation(generation));
            set_all(&mut conditions, new, &now);
            statuses.push(RouteParentStatus {
                parent_ref: parent.parent_ref.clone(),
                controller_name: controller.to_string(),
                conditions,
            });
        }

        let status = HttpRouteStatus { parents: statuses };
        if route.status.as_ref() == Some(&status) {
            debug!(route = %route.name_any(), "Status unchanged");
            return Ok(());
        }
        self.cx.status.patch_status(route, &status).await
    }

    async fn deprovision(
        &self,
        rcx: &RequestContext,
        route: &HttpRoute,
        parents: &[Parent],
    ) -> anyhow::Result<Outcome> {
        if !has_finalizer(&route.metadata, HTTP_ROUTE_FINALIZER) {
            return Ok(Outcome::done());
        }

        let names = RouteNames::new(route);
        let mut lbs = self.previous_load_balancers(route);
        lbs.extend(parents.iter().map(|p| p.load_balancer.clone()));
        for lb in &lbs {
            self.sync_load_balancer(rcx, lb, route, &names, &[], &[], &[])
                .await?;
        }

        let patch = serde_json::json!({
            "finalizers": finalizers_without(&route.metadata, HTTP_ROUTE_FINALIZER),
        });
        self.cx.status.patch_metadata(route, patch).await?;
        info!(route = %route.name_any(), "HTTPRoute deprovisioned");
        Ok(Outcome::done())
    }
}

#[async_trait::async_trait]
impl Reconciler for HttpRouteReconciler {
    async fn reconcile(&self, rcx: RequestContext, req: Request) -> anyhow::Result<Outcome> {
        let ns = req.namespace.as_deref().unwrap_or_default();
        let Some(route) = self.cx.http_routes.get(&ObjectRef::new(&req.name).within(ns)) else {
            debug!(route = %req, "HTTPRoute removed");
            return Ok(Outcome::done());
        };
        let mut route = (*route).clone();
        let parents = self.resolve_parents(&route);

        if route.metadata.deletion_timestamp.is_some() {
            return self.deprovision(&rcx, &route, &parents).await;
        }
        if parents.is_empty() {
            debug!(route = %req, "HTTPRoute has no managed parents");
            return Ok(Outcome::done());
        }
        if let Some(p) = parents.iter().find(|p| !is_accepted(&p.gateway)) {
            return Err(ReconcileError::retriable(format!(
                "parent gateway {} is not accepted yet",
                p.gateway.name_any()
            ))
            .into());
        }

        match self.program(&rcx, &mut route, &parents).await {
            Ok(()) => {
                self.write_status(&route, &parents, None).await?;
                info!(route = %req, "HTTPRoute programmed");
                Ok(Outcome::done())
            }
            Err(error) => {
                if error.condition().is_some() {
                    self.write_status(&route, &parents, Some(&error)).await?;
                }
                Err(error.into())
            }
        }
    }
}

/// Translates the route's rules into routing rules, in declaration order.
fn route_rules(route: &HttpRoute, names: &RouteNames) -> Result<Vec<RoutingRule>, ReconcileError> {
    route
        .spec
        .rules
        .iter()
        .enumerate()
        .map(|(idx, rule)| {
            let unsupported = |message: String| {
                ReconcileError::terminal(message)
                    .with_condition(ACCEPTED, reasons::UNSUPPORTED_VALUE)
            };
            if let Some(filter) = rule.filters.first() {
                return Err(unsupported(format!(
                    "rule {idx}: filter {} is not supported",
                    filter.type_
                )));
            }
            let condition = routing_rules::rule_condition(&route.spec.hostnames, &rule.matches)
                .map_err(|e| unsupported(format!("rule {idx}: {e}")))?;
            Ok(RoutingRule {
                name: names.routing_rule(idx, rule.name.as_deref()),
                condition,
                actions: vec![RuleAction::forward_to(names.backend_set(idx))],
            })
        })
        .collect()
}

/// Returns true if the policy carries any rule of `route`.
fn programs_rules(policy: &RoutingPolicy, route: &HttpRoute) -> bool {
    let names = RouteNames::new(route);
    policy.rules.iter().any(|r| names.owns(&r.name))
}

fn parent_conditions(parent: &Parent, failure: Option<&ReconcileError>) -> Vec<NewCondition> {
    if let Err(reason) = &parent.listeners {
        return vec![NewCondition::new(
            ACCEPTED,
            false,
            *reason,
            format!(
                "no listener of gateway {} accepts the route",
                parent.gateway.name_any()
            ),
        )];
    }

    let accepted = NewCondition::new(ACCEPTED, true, reasons::ACCEPTED, "Route accepted");
    let resolved = NewCondition::new(
        RESOLVED_REFS,
        true,
        reasons::RESOLVED_REFS,
        "References resolved",
    );
    match failure.and_then(|e| e.condition().map(|c| (e, c))) {
        None => vec![accepted, resolved],
        Some((error, failed)) if failed.type_ == RESOLVED_REFS => vec![
            accepted,
            NewCondition::new(RESOLVED_REFS, false, failed.reason.clone(), error.message()),
        ],
        Some((error, failed)) => vec![NewCondition::new(
            failed.type_.clone(),
            false,
            failed.reason.clone(),
            error.message(),
        )],
    }
}
