use crate::{
    client::{LoadBalancerClient, WorkRequestsClient},
    config::OciConfig,
    model::{
        BackendSet, Certificate, CertificateDetails, Listener, LoadBalancer, RoutingPolicy,
        WorkRequest,
    },
    Error, RequestSigner, WorkRequestId,
};
use reqwest::{Method, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, instrument};

const API_VERSION: &str = "20170115";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Talks to the OCI load balancer REST API.
#[derive(Clone, Debug)]
pub struct HttpLoadBalancerClient {
    http: reqwest::Client,
    endpoint: String,
    signer: RequestSigner,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

// === impl HttpLoadBalancerClient ===

impl HttpLoadBalancerClient {
    pub fn new(config: &OciConfig) -> Result<Self, Error> {
        let signer = RequestSigner::from_config(config)?;
        let endpoint = format!("https://iaas.{}.oraclecloud.com/{API_VERSION}", config.region);
        Self::with_endpoint(endpoint, signer)
    }

    pub fn with_endpoint(endpoint: String, signer: RequestSigner) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(Error::Transport)?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            signer,
        })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, Error> {
        let url = Url::parse(&format!("{}{path}", self.endpoint))
            .map_err(|e| Error::Config(format!("invalid endpoint: {e}")))?;
        let body = body
            .map(|b| serde_json::to_vec(&b))
            .transpose()
            .map_err(Error::Decode)?;
        let headers = self
            .signer
            .sign(&method, &url, body.as_deref(), chrono::Utc::now())?;

        let mut req = self.http.request(method, url);
        for (name, value) in headers {
            req = req.header(name, value);
        }
        if let Some(body) = body {
            req = req.body(body);
        }

        let rsp = req.send().await.map_err(Error::Transport)?;
        let status = rsp.status();
        if status.is_success() {
            return Ok(rsp);
        }

        let opc_request_id = rsp
            .headers()
            .get("opc-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = rsp.bytes().await.map_err(Error::Transport)?;
        let ServiceError { code, message } = serde_json::from_slice(&bytes).unwrap_or_default();
        Err(Error::Service {
            status: status.as_u16(),
            code,
            message,
            opc_request_id,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let rsp = self.send(Method::GET, path, None).await?;
        let bytes = rsp.bytes().await.map_err(Error::Transport)?;
        serde_json::from_slice(&bytes).map_err(Error::Decode)
    }

    async fn mutate(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<WorkRequestId, Error> {
        let rsp = self.send(method, path, body).await?;
        let id = rsp
            .headers()
            .get("opc-work-request-id")
            .and_then(|v| v.to_str().ok())
            .ok_or(Error::MissingWorkRequestId)?;
        debug!(work_request = %id, "Accepted");
        Ok(WorkRequestId(id.to_string()))
    }
}

fn lb_path(lb: &str, rest: &str) -> String {
    format!("/loadBalancers/{lb}{rest}")
}

/// Serializes `value` without its `name` field, as update endpoints expect.
fn without_name<T: Serialize>(value: &T) -> Result<serde_json::Value, Error> {
    let mut value = serde_json::to_value(value).map_err(Error::Decode)?;
    if let Some(obj) = value.as_object_mut() {
        obj.remove("name");
    }
    Ok(value)
}

fn to_value<T: Serialize>(value: &T) -> Result<serde_json::Value, Error> {
    serde_json::to_value(value).map_err(Error::Decode)
}

#[async_trait::async_trait]
impl LoadBalancerClient for HttpLoadBalancerClient {
    #[instrument(skip(self))]
    async fn get_load_balancer(&self, lb: &str) -> Result<LoadBalancer, Error> {
        self.get(&lb_path(lb, "")).await
    }

    #[instrument(skip(self, listener), fields(listener = %listener.name))]
    async fn create_listener(&self, lb: &str, listener: &Listener) -> Result<WorkRequestId, Error> {
        let body = to_value(listener)?;
        self.mutate(Method::POST, &lb_path(lb, "/listeners"), Some(body))
            .await
    }

    #[instrument(skip(self, listener), fields(listener = %listener.name))]
    async fn update_listener(&self, lb: &str, listener: &Listener) -> Result<WorkRequestId, Error> {
        let body = without_name(listener)?;
        let path = lb_path(lb, &format!("/listeners/{}", listener.name));
        self.mutate(Method::PUT, &path, Some(body)).await
    }

    #[instrument(skip(self))]
    async fn delete_listener(&self, lb: &str, name: &str) -> Result<WorkRequestId, Error> {
        let path = lb_path(lb, &format!("/listeners/{name}"));
        self.mutate(Method::DELETE, &path, None).await
    }

    #[instrument(skip(self))]
    async fn list_backend_sets(&self, lb: &str) -> Result<Vec<BackendSet>, Error> {
        self.get(&lb_path(lb, "/backendSets")).await
    }

    #[instrument(skip(self, set), fields(backend_set = %set.name))]
    async fn create_backend_set(&self, lb: &str, set: &BackendSet) -> Result<WorkRequestId, Error> {
        let body = to_value(set)?;
        self.mutate(Method::POST, &lb_path(lb, "/backendSets"), Some(body))
            .await
    }

    #[instrument(skip(self, set), fields(backend_set = %set.name))]
    async fn update_backend_set(&self, lb: &str, set: &BackendSet) -> Result<WorkRequestId, Error> {
        let body = without_name(set)?;
        let path = lb_path(lb, &format!("/backendSets/{}", set.name));
        self.mutate(Method::PUT, &path, Some(body)).await
    }

    #[instrument(skip(self))]
    async fn delete_backend_set(&self, lb: &str, name: &str) -> Result<WorkRequestId, Error> {
        let path = lb_path(lb, &format!("/backendSets/{name}"));
        self.mutate(Method::DELETE, &path, None).await
    }

    #[instrument(skip(self))]
    async fn list_routing_policies(&self, lb: &str) -> Result<Vec<RoutingPolicy>, Error> {
        self.get(&lb_path(lb, "/routingPolicies")).await
    }

    #[instrument(skip(self, policy), fields(routing_policy = %policy.name))]
    async fn create_routing_policy(
        &self,
        lb: &str,
        policy: &RoutingPolicy,
    ) -> Result<WorkRequestId, Error> {
        let body = to_value(policy)?;
        self.mutate(Method::POST, &lb_path(lb, "/routingPolicies"), Some(body))
            .await
    }

    #[instrument(skip(self, policy), fields(routing_policy = %policy.name))]
    async fn update_routing_policy(
        &self,
        lb: &str,
        policy: &RoutingPolicy,
    ) -> Result<WorkRequestId, Error> {
        let body = without_name(policy)?;
        let path = lb_path(lb, &format!("/routingPolicies/{}", policy.name));
        self.mutate(Method::PUT, &path, Some(body)).await
    }

    #[instrument(skip(self))]
    async fn delete_routing_policy(&self, lb: &str, name: &str) -> Result<WorkRequestId, Error> {
        let path = lb_path(lb, &format!("/routingPolicies/{name}"));
        self.mutate(Method::DELETE, &path, None).await
    }

    #[instrument(skip(self))]
    async fn list_certificates(&self, lb: &str) -> Result<Vec<Certificate>, Error> {
        self.get(&lb_path(lb, "/certificates")).await
    }

    #[instrument(skip(self, cert), fields(certificate = %cert.certificate_name))]
    async fn create_certificate(
        &self,
        lb: &str,
        cert: &CertificateDetails,
    ) -> Result<WorkRequestId, Error> {
        let mut body = json!({
            "certificateName": cert.certificate_name,
            "publicCertificate": cert.public_certificate,
            "privateKey": cert.private_key,
        });
        if let Some(ca) = cert.ca_certificate.as_ref() {
            body["caCertificate"] = json!(ca);
        }
        self.mutate(Method::POST, &lb_path(lb, "/certificates"), Some(body))
            .await
    }

    #[instrument(skip(self))]
    async fn delete_certificate(&self, lb: &str, name: &str) -> Result<WorkRequestId, Error> {
        let path = lb_path(lb, &format!("/certificates/{name}"));
        self.mutate(Method::DELETE, &path, None).await
    }
}

#[async_trait::async_trait]
impl WorkRequestsClient for HttpLoadBalancerClient {
    async fn get_work_request(&self, id: &WorkRequestId) -> Result<WorkRequest, Error> {
        self.get(&format!("/loadBalancerWorkRequests/{id}")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ListenerProtocol, SslConfiguration};

    #[test]
    fn update_bodies_omit_name() {
        let listener = Listener {
            name: "http".to_string(),
            default_backend_set_name: "default".to_string(),
            port: 443,
            protocol: ListenerProtocol::Http,
            routing_policy_name: Some("http_policy".to_string()),
            ssl_configuration: Some(SslConfiguration {
                certificate_name: Some("cert".to_string()),
                verify_peer_certificate: Some(false),
            }),
        };
        let body = without_name(&listener).unwrap();
        assert_eq!(
            body,
            json!({
                "defaultBackendSetName": "default",
                "port": 443,
                "protocol": "HTTP",
                "routingPolicyName": "http_policy",
                "sslConfiguration": {
                    "certificateName": "cert",
                    "verifyPeerCertificate": false
                }
            })
        );
    }

    #[test]
    fn paths() {
        assert_eq!(lb_path("lb-0", "/listeners"), "/loadBalancers/lb-0/listeners");
    }
}
