use crate::{
    model::{
        BackendSet, Certificate, CertificateDetails, Listener, LoadBalancer, RoutingPolicy,
        WorkRequest,
    },
    Error,
};
use std::{fmt, sync::Arc};

/// The handle of an asynchronous OCI operation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WorkRequestId(pub String);

pub type SharedClient = Arc<dyn LoadBalancerClient>;

/// Operations on a single OCI load balancer.
///
/// Every mutation is asynchronous on the OCI side and returns the id of a work
/// request that completes when the change has been applied.
#[async_trait::async_trait]
pub trait LoadBalancerClient: Send + Sync + 'static {
    async fn get_load_balancer(&self, lb: &str) -> Result<LoadBalancer, Error>;

    async fn list_listeners(&self, lb: &str) -> Result<Vec<Listener>, Error> {
        let lb = self.get_load_balancer(lb).await?;
        Ok(lb.listeners.into_values().collect())
    }

    async fn create_listener(&self, lb: &str, listener: &Listener) -> Result<WorkRequestId, Error>;

    async fn update_listener(&self, lb: &str, listener: &Listener) -> Result<WorkRequestId, Error>;

    async fn delete_listener(&self, lb: &str, name: &str) -> Result<WorkRequestId, Error>;

    async fn list_backend_sets(&self, lb: &str) -> Result<Vec<BackendSet>, Error>;

    async fn create_backend_set(&self, lb: &str, set: &BackendSet)
        -> Result<WorkRequestId, Error>;

    async fn update_backend_set(&self, lb: &str, set: &BackendSet)
        -> Result<WorkRequestId, Error>;

    async fn delete_backend_set(&self, lb: &str, name: &str) -> Result<WorkRequestId, Error>;

    async fn list_routing_policies(&self, lb: &str) -> Result<Vec<RoutingPolicy>, Error>;

    async fn create_routing_policy(
        &self,
        lb: &str,
        policy: &RoutingPolicy,
    ) -> Result<WorkRequestId, Error>;

    async fn update_routing_policy(
        &self,
        lb: &str,
        policy: &RoutingPolicy,
    ) -> Result<WorkRequestId, Error>;

    async fn delete_routing_policy(&self, lb: &str, name: &str) -> Result<WorkRequestId, Error>;

    async fn list_certificates(&self, lb: &str) -> Result<Vec<Certificate>, Error>;

    async fn create_certificate(
        &self,
        lb: &str,
        cert: &CertificateDetails,
    ) -> Result<WorkRequestId, Error>;

    async fn delete_certificate(&self, lb: &str, name: &str) -> Result<WorkRequestId, Error>;
}

/// Reads the state of work requests.
#[async_trait::async_trait]
pub trait WorkRequestsClient: Send + Sync + 'static {
    async fn get_work_request(&self, id: &WorkRequestId) -> Result<WorkRequest, Error>;
}

// === impl WorkRequestId ===

impl fmt::Display for WorkRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for WorkRequestId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}
