//! Orchestrator abstraction and the Kubernetes reference integration
//!
//! The scale controller needs exactly three operations: read a deployment's
//! replica count, write it, and probe an HTTP health endpoint. Anything that
//! can do those three can back the proxy; production uses the Kubernetes
//! `apps/v1` scale subresource over plain HTTPS, tests use a scripted mock.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Current replica count of `deployment`.
    async fn get_replicas(&self, deployment: &str) -> Result<u32>;

    /// Set the desired replica count of `deployment`.
    async fn set_replicas(&self, deployment: &str, replicas: u32) -> Result<()>;

    /// HTTP GET `url`, returning the status code. Connection failures are
    /// errors, not statuses; the caller treats both as "not yet healthy".
    async fn health_probe(&self, url: &str) -> Result<u16>;
}

// ============================================================================
// Kubernetes Integration
// ============================================================================

const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_ACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
const IN_CLUSTER_API_SERVER: &str = "https://kubernetes.default.svc";

/// Talks to the Kubernetes API server directly: GET and PATCH on the
/// deployment scale subresource, bearer auth from the mounted service
/// account.
pub struct KubernetesOrchestrator {
    client: reqwest::Client,
    api_server: String,
    namespace: String,
    token: Option<String>,
}

impl KubernetesOrchestrator {
    /// In-cluster construction: service account token and CA from the pod
    /// filesystem, API server at the cluster-internal address.
    pub fn in_cluster(namespace: impl Into<String>) -> Result<Self> {
        let token = std::fs::read_to_string(SERVICE_ACCOUNT_TOKEN)
            .context("reading service account token (is this running in a pod?)")?;

        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .http1_only();
        if let Ok(ca_pem) = std::fs::read(SERVICE_ACCOUNT_CA) {
            let cert = reqwest::Certificate::from_pem(&ca_pem)
                .context("parsing service account CA certificate")?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder.build().context("building Kubernetes HTTP client")?;

        Ok(Self {
            client,
            api_server: IN_CLUSTER_API_SERVER.to_string(),
            namespace: namespace.into(),
            token: Some(token.trim().to_string()),
        })
    }

    /// Construction against an explicit API server, for tests and for
    /// out-of-cluster runs via a proxy like `kubectl proxy`.
    pub fn with_api_server(
        api_server: impl Into<String>,
        namespace: impl Into<String>,
        token: Option<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .http1_only()
            .build()
            .context("building Kubernetes HTTP client")?;
        Ok(Self {
            client,
            api_server: api_server.into(),
            namespace: namespace.into(),
            token,
        })
    }

    fn scale_url(&self, deployment: &str) -> String {
        format!(
            "{}/apis/apps/v1/namespaces/{}/deployments/{}/scale",
            self.api_server, self.namespace, deployment
        )
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl Orchestrator for KubernetesOrchestrator {
    async fn get_replicas(&self, deployment: &str) -> Result<u32> {
        let response = self
            .authorized(self.client.get(self.scale_url(deployment)))
            .send()
            .await
            .context("fetching deployment scale")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("scale read returned {}", status);
        }
        let scale: serde_json::Value = response.json().await.context("decoding scale object")?;
        Ok(scale
            .pointer("/spec/replicas")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0) as u32)
    }

    async fn set_replicas(&self, deployment: &str, replicas: u32) -> Result<()> {
        let patch = json!({"spec": {"replicas": replicas}});
        let response = self
            .authorized(
                self.client
                    .patch(self.scale_url(deployment))
                    .header("content-type", "application/merge-patch+json")
                    .json(&patch),
            )
            .send()
            .await
            .context("patching deployment scale")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("scale patch returned {}: {}", status, body);
        }
        tracing::info!(deployment, replicas, "scaled deployment");
        Ok(())
    }

    async fn health_probe(&self, url: &str) -> Result<u16> {
        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .context("health probe request")?;
        Ok(response.status().as_u16())
    }
}

// ============================================================================
// Scripted Mock (tests)
// ============================================================================

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct MockState {
        replicas: u32,
        set_calls: Vec<(String, u32)>,
        health_queue: VecDeque<u16>,
        health_calls: usize,
        default_health: u16,
        reject_scale: bool,
    }

    /// Orchestrator with scripted health responses and recorded scale calls.
    #[derive(Debug)]
    pub struct MockOrchestrator {
        state: Mutex<MockState>,
    }

    impl MockOrchestrator {
        pub fn new() -> Self {
            Self {
                state: Mutex::new(MockState {
                    default_health: 200,
                    ..Default::default()
                }),
            }
        }

        /// Queue health probe responses; once drained, `default_health`
        /// applies.
        pub fn script_health(&self, responses: &[u16]) {
            self.state
                .lock()
                .unwrap()
                .health_queue
                .extend(responses.iter().copied());
        }

        pub fn set_default_health(&self, status: u16) {
            self.state.lock().unwrap().default_health = status;
        }

        pub fn reject_scale(&self) {
            self.state.lock().unwrap().reject_scale = true;
        }

        pub fn allow_scale(&self) {
            self.state.lock().unwrap().reject_scale = false;
        }

        /// Seed the replica count without recording a scale call.
        pub fn set_replicas_direct(&self, replicas: u32) {
            self.state.lock().unwrap().replicas = replicas;
        }

        pub fn health_calls(&self) -> usize {
            self.state.lock().unwrap().health_calls
        }

        pub fn set_calls(&self) -> Vec<(String, u32)> {
            self.state.lock().unwrap().set_calls.clone()
        }

        pub fn scale_up_calls(&self) -> usize {
            self.state
                .lock()
                .unwrap()
                .set_calls
                .iter()
                .filter(|(_, n)| *n > 0)
                .count()
        }

        pub fn scale_down_calls(&self) -> usize {
            self.state
                .lock()
                .unwrap()
                .set_calls
                .iter()
                .filter(|(_, n)| *n == 0)
                .count()
        }
    }

    #[async_trait]
    impl Orchestrator for MockOrchestrator {
        async fn get_replicas(&self, _deployment: &str) -> Result<u32> {
            Ok(self.state.lock().unwrap().replicas)
        }

        async fn set_replicas(&self, deployment: &str, replicas: u32) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.reject_scale {
                anyhow::bail!("scale rejected by test script");
            }
            state.set_calls.push((deployment.to_string(), replicas));
            state.replicas = replicas;
            Ok(())
        }

        async fn health_probe(&self, _url: &str) -> Result<u16> {
            let mut state = self.state.lock().unwrap();
            state.health_calls += 1;
            Ok(state
                .health_queue
                .pop_front()
                .unwrap_or(state.default_health))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_get_replicas_reads_scale_subresource() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apis/apps/v1/namespaces/ai-apps/deployments/vllm/scale"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "spec": {"replicas": 1},
                "status": {"replicas": 1}
            })))
            .mount(&server)
            .await;

        let orchestrator =
            KubernetesOrchestrator::with_api_server(server.uri(), "ai-apps", None).unwrap();
        assert_eq!(orchestrator.get_replicas("vllm").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_set_replicas_patches_scale_subresource() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/apis/apps/v1/namespaces/ai-apps/deployments/vllm/scale"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "spec": {"replicas": 0}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let orchestrator =
            KubernetesOrchestrator::with_api_server(server.uri(), "ai-apps", None).unwrap();
        orchestrator.set_replicas("vllm", 0).await.unwrap();
    }

    #[tokio::test]
    async fn test_set_replicas_surfaces_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let orchestrator =
            KubernetesOrchestrator::with_api_server(server.uri(), "ai-apps", None).unwrap();
        let err = orchestrator.set_replicas("vllm", 1).await.unwrap_err();
        assert!(err.to_string().contains("403"));
    }

    #[tokio::test]
    async fn test_health_probe_returns_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let orchestrator =
            KubernetesOrchestrator::with_api_server(server.uri(), "ai-apps", None).unwrap();
        let status = orchestrator
            .health_probe(&format!("{}/health", server.uri()))
            .await
            .unwrap();
        assert_eq!(status, 503);
    }

    #[tokio::test]
    async fn test_health_probe_connection_refused_is_error() {
        let orchestrator =
            KubernetesOrchestrator::with_api_server("http://127.0.0.1:9", "ns", None).unwrap();
        assert!(orchestrator
            .health_probe("http://127.0.0.1:9/health")
            .await
            .is_err());
    }
}
