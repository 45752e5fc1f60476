use crate::{
    client::{LoadBalancerClient, WorkRequestsClient},
    model::{
        BackendSet, Certificate, CertificateDetails, IpAddress, Listener, LoadBalancer,
        RoutingPolicy, WorkRequest, WorkRequestState,
    },
    Error, WorkRequestId,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
};

/// An in-memory load balancer service.
///
/// Load balancers are created on first use. Mutations are validated the way
/// the OCI API validates them (unknown names, duplicates, references between
/// listeners, routing policies and backend sets) and complete immediately.
#[derive(Clone, Debug, Default)]
pub struct MemoryLoadBalancer(Arc<Mutex<State>>);

/// Counts of accepted mutations.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Mutations {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

#[derive(Debug, Default)]
struct State {
    lbs: HashMap<String, Lb>,
    work_requests: HashMap<String, WorkRequest>,
    next_work_request: usize,
    mutations: Mutations,
    failures: VecDeque<Error>,
}

#[derive(Debug, Default)]
struct Lb {
    ip_addresses: Vec<IpAddress>,
    listeners: BTreeMap<String, Listener>,
    backend_sets: BTreeMap<String, BackendSet>,
    routing_policies: BTreeMap<String, RoutingPolicy>,
    certificates: BTreeMap<String, Certificate>,
}

enum Op {
    Create,
    Update,
    Delete,
}

// === impl MemoryLoadBalancer ===

impl MemoryLoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a load balancer with the given public addresses.
    pub fn with_load_balancer(self, id: &str, addrs: &[&str]) -> Self {
        {
            let mut state = self.0.lock();
            let lb = state.lbs.entry(id.to_string()).or_default();
            lb.ip_addresses = addrs
                .iter()
                .map(|ip| IpAddress {
                    ip_address: ip.to_string(),
                    is_public: Some(true),
                })
                .collect();
        }
        self
    }

    pub fn mutations(&self) -> Mutations {
        self.0.lock().mutations
    }

    /// Fails the next mutation with `error`.
    pub fn fail_next(&self, error: Error) {
        self.0.lock().failures.push_back(error);
    }

    fn mutate<F>(&self, lb: &str, op: Op, f: F) -> Result<WorkRequestId, Error>
    where
        F: FnOnce(&mut Lb) -> Result<(), Error>,
    {
        let mut state = self.0.lock();
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        f(state.lbs.entry(lb.to_string()).or_default())?;

        match op {
            Op::Create => state.mutations.created += 1,
            Op::Update => state.mutations.updated += 1,
            Op::Delete => state.mutations.deleted += 1,
        }
        state.next_work_request += 1;
        let id = format!(
            "ocid1.loadbalancerworkrequest.memory.{}",
            state.next_work_request
        );
        state.work_requests.insert(
            id.clone(),
            WorkRequest {
                id: id.clone(),
                lifecycle_state: WorkRequestState::Succeeded,
                message: None,
            },
        );
        Ok(WorkRequestId(id))
    }

    fn read<T>(&self, lb: &str, f: impl FnOnce(&Lb) -> T) -> T {
        let mut state = self.0.lock();
        f(state.lbs.entry(lb.to_string()).or_default())
    }
}

fn not_found(kind: &str, name: &str) -> Error {
    Error::service(
        404,
        "NotAuthorizedOrNotFound",
        format!("{kind} {name} not found"),
    )
}

fn conflict(kind: &str, name: &str) -> Error {
    Error::service(409, "Conflict", format!("{kind} {name} already exists"))
}

fn invalid(message: String) -> Error {
    Error::service(400, "InvalidParameter", message)
}

// === impl Lb ===

impl Lb {
    fn validate_listener(&self, listener: &Listener) -> Result<(), Error> {
        if !self
            .backend_sets
            .contains_key(&listener.default_backend_set_name)
        {
            return Err(invalid(format!(
                "backend set {} does not exist",
                listener.default_backend_set_name
            )));
        }
        if let Some(policy) = listener.routing_policy_name.as_deref() {
            if !self.routing_policies.contains_key(policy) {
                return Err(invalid(format!("routing policy {policy} does not exist")));
            }
        }
        if let Some(cert) = listener
            .ssl_configuration
            .as_ref()
            .and_then(|ssl| ssl.certificate_name.as_deref())
        {
            if !self.certificates.contains_key(cert) {
                return Err(invalid(format!("certificate {cert} does not exist")));
            }
        }
        Ok(())
    }

    fn validate_policy(&self, policy: &RoutingPolicy) -> Result<(), Error> {
        if policy.rules.is_empty() {
            return Err(invalid(format!("routing policy {} has no rules", policy.name)));
        }
        for set in policy.backend_set_names() {
            if !self.backend_sets.contains_key(set) {
                return Err(invalid(format!("backend set {set} does not exist")));
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl LoadBalancerClient for MemoryLoadBalancer {
    async fn get_load_balancer(&self, id: &str) -> Result<LoadBalancer, Error> {
        Ok(self.read(id, |lb| LoadBalancer {
            id: id.to_string(),
            display_name: None,
            ip_addresses: lb.ip_addresses.clone(),
            listeners: lb.listeners.clone(),
        }))
    }

    async fn create_listener(&self, lb: &str, listener: &Listener) -> Result<WorkRequestId, Error> {
        self.mutate(lb, Op::Create, |lb| {
            if lb.listeners.contains_key(&listener.name) {
                return Err(conflict("listener", &listener.name));
            }
            lb.validate_listener(listener)?;
            lb.listeners.insert(listener.name.clone(), listener.clone());
            Ok(())
        })
    }

    async fn update_listener(&self, lb: &str, listener: &Listener) -> Result<WorkRequestId, Error> {
        self.mutate(lb, Op::Update, |lb| {
            if !lb.listeners.contains_key(&listener.name) {
                return Err(not_found("listener", &listener.name));
            }
            lb.validate_listener(listener)?;
            lb.listeners.insert(listener.name.clone(), listener.clone());
            Ok(())
        })
    }

    async fn delete_listener(&self, lb: &str, name: &str) -> Result<WorkRequestId, Error> {
        self.mutate(lb, Op::Delete, |lb| {
            lb.listeners
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| not_found("listener", name))
        })
    }

    async fn list_backend_sets(&self, lb: &str) -> Result<Vec<BackendSet>, Error> {
        Ok(self.read(lb, |lb| lb.backend_sets.values().cloned().collect()))
    }

    async fn create_backend_set(&self, lb: &str, set: &BackendSet) -> Result<WorkRequestId, Error> {
        self.mutate(lb, Op::Create, |lb| {
            if lb.backend_sets.contains_key(&set.name) {
                return Err(conflict("backend set", &set.name));
            }
            lb.backend_sets.insert(set.name.clone(), set.clone());
            Ok(())
        })
    }

    async fn update_backend_set(&self, lb: &str, set: &BackendSet) -> Result<WorkRequestId, Error> {
        self.mutate(lb, Op::Update, |lb| {
            if !lb.backend_sets.contains_key(&set.name) {
                return Err(not_found("backend set", &set.name));
            }
            lb.backend_sets.insert(set.name.clone(), set.clone());
            Ok(())
        })
    }

    async fn delete_backend_set(&self, lb: &str, name: &str) -> Result<WorkRequestId, Error> {
        self.mutate(lb, Op::Delete, |lb| {
            if !lb.backend_sets.contains_key(name) {
                return Err(not_found("backend set", name));
            }
            if lb
                .listeners
                .values()
                .any(|l| l.default_backend_set_name == name)
            {
                return Err(invalid(format!("backend set {name} is used by a listener")));
            }
            if lb
                .routing_policies
                .values()
                .any(|p| p.backend_set_names().any(|s| s == name))
            {
                return Err(invalid(format!(
                    "backend set {name} is used in routing policy"
                )));
            }
            lb.backend_sets.remove(name);
            Ok(())
        })
    }

    async fn list_routing_policies(&self, lb: &str) -> Result<Vec<RoutingPolicy>, Error> {
        Ok(self.read(lb, |lb| lb.routing_policies.values().cloned().collect()))
    }

    async fn create_routing_policy(
        &self,
        lb: &str,
        policy: &RoutingPolicy,
    ) -> Result<WorkRequestId, Error> {
        self.mutate(lb, Op::Create, |lb| {
            if lb.routing_policies.contains_key(&policy.name) {
                return Err(conflict("routing policy", &policy.name));
            }
            lb.validate_policy(policy)?;
            lb.routing_policies
                .insert(policy.name.clone(), policy.clone());
            Ok(())
        })
    }

    async fn update_routing_policy(
        &self,
        lb: &str,
        policy: &RoutingPolicy,
    ) -> Result<WorkRequestId, Error> {
        self.mutate(lb, Op::Update, |lb| {
            if !lb.routing_policies.contains_key(&policy.name) {
                return Err(not_found("routing policy", &policy.name));
            }
            lb.validate_policy(policy)?;
            lb.routing_policies
                .insert(policy.name.clone(), policy.clone());
            Ok(())
        })
    }

    async fn delete_routing_policy(&self, lb: &str, name: &str) -> Result<WorkRequestId, Error> {
        self.mutate(lb, Op::Delete, |lb| {
            if !lb.routing_policies.contains_key(name) {
                return Err(not_found("routing policy", name));
            }
            if lb
                .listeners
                .values()
                .any(|l| l.routing_policy_name.as_deref() == Some(name))
            {
                return Err(invalid(format!(
                    "routing policy {name} is used by a listener"
                )));
            }
            lb.routing_policies.remove(name);
            Ok(())
        })
    }

    async fn list_certificates(&self, lb: &str) -> Result<Vec<Certificate>, Error> {
        Ok(self.read(lb, |lb| lb.certificates.values().cloned().collect()))
    }

    async fn create_certificate(
        &self,
        lb: &str,
        cert: &CertificateDetails,
    ) -> Result<WorkRequestId, Error> {
        self.mutate(lb, Op::Create, |lb| {
            if lb.certificates.contains_key(&cert.certificate_name) {
                return Err(conflict("certificate", &cert.certificate_name));
            }
            lb.certificates.insert(
                cert.certificate_name.clone(),
                Certificate {
                    certificate_name: cert.certificate_name.clone(),
                    public_certificate: Some(cert.public_certificate.clone()),
                    ca_certificate: cert.ca_certificate.clone(),
                },
            );
            Ok(())
        })
    }

    async fn delete_certificate(&self, lb: &str, name: &str) -> Result<WorkRequestId, Error> {
        self.mutate(lb, Op::Delete, |lb| {
            if !lb.certificates.contains_key(name) {
                return Err(not_found("certificate", name));
            }
            if lb.listeners.values().any(|l| {
                l.ssl_configuration
                    .as_ref()
                    .and_then(|ssl| ssl.certificate_name.as_deref())
                    == Some(name)
            }) {
                return Err(invalid(format!("certificate {name} is used by a listener")));
            }
            lb.certificates.remove(name);
            Ok(())
        })
    }
}

#[async_trait::async_trait]
impl WorkRequestsClient for MemoryLoadBalancer {
    async fn get_work_request(&self, id: &WorkRequestId) -> Result<WorkRequest, Error> {
        self.0
            .lock()
            .work_requests
            .get(&id.0)
            .cloned()
            .ok_or_else(|| not_found("work request", &id.0))
    }
}
