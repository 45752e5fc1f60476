use oke_gateway_controller_core::ReconcileError;
use oke_gateway_controller_oci::{
    model::{
        BackendSet, Certificate, CertificateDetails, Listener, LoadBalancer, RoutingPolicy,
    },
    Error, SharedClient, WorkRequestId, WorkRequestsWatcher,
};
use ahash::AHashMap;
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Applies changes to OCI load balancers, waiting for each change to complete
/// before returning.
#[derive(Clone)]
pub struct LoadBalancerModel {
    client: SharedClient,
    work_requests: WorkRequestsWatcher,
    locks: Arc<Mutex<AHashMap<String, Arc<AsyncMutex<()>>>>>,
}

/// The programmed state of a load balancer, keyed by name.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub load_balancer: LoadBalancer,
    pub backend_sets: BTreeMap<String, BackendSet>,
    pub routing_policies: BTreeMap<String, RoutingPolicy>,
    pub certificates: BTreeMap<String, Certificate>,
}

// === impl LoadBalancerModel ===

impl LoadBalancerModel {
    pub fn new(client: SharedClient, work_requests: WorkRequestsWatcher) -> Self {
        Self {
            client,
            work_requests,
            locks: Default::default(),
        }
    }

    /// Serializes read-modify-write sequences against one load balancer.
    ///
    /// Routing policies are shared by every route attached to a listener, so
    /// a snapshot is only valid while the guard is held.
    pub async fn lock(&self, lb: &str) -> OwnedMutexGuard<()> {
        let lock = self.locks.lock().entry(lb.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    pub async fn snapshot(&self, lb: &str) -> Result<Snapshot, ReconcileError> {
        let load_balancer = self
            .client
            .get_load_balancer(lb)
            .await
            .map_err(|e| oci_error(format!("failed to get load balancer {lb}"), e))?;
        let backend_sets = self
            .client
            .list_backend_sets(lb)
            .await
            .map_err(|e| oci_error(format!("failed to list backend sets of {lb}"), e))?;
        let routing_policies = self
            .client
            .list_routing_policies(lb)
            .await
            .map_err(|e| oci_error(format!("failed to list routing policies of {lb}"), e))?;
        let certificates = self
            .client
            .list_certificates(lb)
            .await
            .map_err(|e| oci_error(format!("failed to list certificates of {lb}"), e))?;

        Ok(Snapshot {
            load_balancer,
            backend_sets: backend_sets
                .into_iter()
                .map(|s| (s.name.clone(), s))
                .collect(),
            routing_policies: routing_policies
                .into_iter()
                .map(|p| (p.name.clone(), p))
                .collect(),
            certificates: certificates
                .into_iter()
                .map(|c| (c.certificate_name.clone(), c))
                .collect(),
        })
    }

    /// Creates the backend set or updates it if it differs. Returns true if a
    /// change was made.
    pub async fn ensure_backend_set(
        &self,
        cancel: &CancellationToken,
        lb: &str,
        desired: &BackendSet,
        current: Option<&BackendSet>,
    ) -> Result<bool, ReconcileError> {
        match current {
            None => {
                let wr = self.client.create_backend_set(lb, desired).await;
                self.commit(cancel, "create", "backend set", &desired.name, wr)
                    .await?;
            }
            Some(current) if backend_set_differs(current, desired) => {
                let wr = self.client.update_backend_set(lb, desired).await;
                self.commit(cancel, "update", "backend set", &desired.name, wr)
                    .await?;
            }
            Some(_) => {
                debug!(name = %desired.name, "Backend set up to date");
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub async fn create_certificate(
        &self,
        cancel: &CancellationToken,
        lb: &str,
        cert: &CertificateDetails,
    ) -> Result<(), ReconcileError> {
        let wr = self.client.create_certificate(lb, cert).await;
        self.commit(cancel, "create", "certificate", &cert.certificate_name, wr)
            .await
    }

    /// Creates or updates the routing policy. Returns true if a change was
    /// made.
    pub async fn ensure_routing_policy(
        &self,
        cancel: &CancellationToken,
        lb: &str,
        desired: &RoutingPolicy,
        current: Option<&RoutingPolicy>,
    ) -> Result<bool, ReconcileError> {
        match current {
            None => {
                let wr = self.client.create_routing_policy(lb, desired).await;
                self.commit(cancel, "create", "routing policy", &desired.name, wr)
                    .await?;
            }
            Some(current) if current.rules != desired.rules => {
                let wr = self.client.update_routing_policy(lb, desired).await;
                self.commit(cancel, "update", "routing policy", &desired.name, wr)
                    .await?;
            }
            Some(_) => {
                debug!(name = %desired.name, "Routing policy up to date");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Creates the listener or updates it if it differs. Returns true if a
    /// change was made.
    pub async fn ensure_listener(
        &self,
        cancel: &CancellationToken,
        lb: &str,
        desired: &Listener,
        current: Option<&Listener>,
    ) -> Result<bool, ReconcileError> {
        match current {
            None => {
                let wr = self.client.create_listener(lb, desired).await;
                self.commit(cancel, "create", "listener", &desired.name, wr)
                    .await?;
            }
            Some(current) if listener_differs(current, desired) => {
                let wr = self.client.update_listener(lb, desired).await;
                self.commit(cancel, "update", "listener", &desired.name, wr)
                    .await?;
            }
            Some(_) => {
                debug!(name = %desired.name, "Listener up to date");
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub async fn delete_listener(
        &self,
        cancel: &CancellationToken,
        lb: &str,
        name: &str,
    ) -> Result<(), ReconcileError> {
        let wr = self.client.delete_listener(lb, name).await;
        self.commit_delete(cancel, "listener", name, wr).await
    }

    pub async fn delete_routing_policy(
        &self,
        cancel: &CancellationToken,
        lb: &str,
        name: &str,
    ) -> Result<(), ReconcileError> {
        let wr = self.client.delete_routing_policy(lb, name).await;
        self.commit_delete(cancel, "routing policy", name, wr).await
    }

    pub async fn delete_backend_set(
        &self,
        cancel: &CancellationToken,
        lb: &str,
        name: &str,
    ) -> Result<(), ReconcileError> {
        let wr = self.client.delete_backend_set(lb, name).await;
        self.commit_delete(cancel, "backend set", name, wr).await
    }

    pub async fn delete_certificate(
        &self,
        cancel: &CancellationToken,
        lb: &str,
        name: &str,
    ) -> Result<(), ReconcileError> {
        let wr = self.client.delete_certificate(lb, name).await;
        self.commit_delete(cancel, "certificate", name, wr).await
    }

    async fn commit(
        &self,
        cancel: &CancellationToken,
        op: &'static str,
        kind: &'static str,
        name: &str,
        wr: Result<WorkRequestId, Error>,
    ) -> Result<(), ReconcileError> {
        let id = wr.map_err(|e| oci_error(format!("failed to {op} {kind} {name}"), e))?;
        debug!(work_request = %id, op, kind, name, "Waiting for work request");
        self.work_requests
            .wait_for(cancel, &id)
            .await
            .map_err(|e| oci_error(format!("failed to {op} {kind} {name}"), e))?;
        info!(op, kind, name, "Load balancer updated");
        Ok(())
    }

    // Resources that are already gone count as deleted.
    async fn commit_delete(
        &self,
        cancel: &CancellationToken,
        kind: &'static str,
        name: &str,
        wr: Result<WorkRequestId, Error>,
    ) -> Result<(), ReconcileError> {
        match wr {
            Err(error) if error.is_not_found() => {
                debug!(kind, name, "Already deleted");
                Ok(())
            }
            wr => self.commit(cancel, "delete", kind, name, wr).await,
        }
    }
}

impl std::fmt::Debug for LoadBalancerModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancerModel").finish_non_exhaustive()
    }
}

fn oci_error(context: String, error: Error) -> ReconcileError {
    ReconcileError::new(format!("{context}: {error}"), error.is_retriable()).with_source(error)
}

/// Backend order and the optional health-check tuning reported by OCI are not
/// significant.
pub(crate) fn backend_set_differs(current: &BackendSet, desired: &BackendSet) -> bool {
    let mut current_backends = current.backends.clone();
    current_backends.sort();
    let mut desired_backends = desired.backends.clone();
    desired_backends.sort();

    current.policy != desired.policy
        || current_backends != desired_backends
        || current.health_checker.protocol != desired.health_checker.protocol
        || current.health_checker.port != desired.health_checker.port
}

pub(crate) fn listener_differs(current: &Listener, desired: &Listener) -> bool {
    let certificate = |l: &Listener| {
        l.ssl_configuration
            .as_ref()
            .and_then(|ssl| ssl.certificate_name.clone())
    };
    current.default_backend_set_name != desired.default_backend_set_name
        || current.port != desired.port
        || current.protocol != desired.protocol
        || current.routing_policy_name != desired.routing_policy_name
        || certificate(current) != certificate(desired)
}
