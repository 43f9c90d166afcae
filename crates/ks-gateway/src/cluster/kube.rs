//! Kubernetes REST client
//!
//! Talks to the API server directly over HTTPS with a bearer token. Only the
//! endpoints the provisioner needs are covered.

use std::path::PathBuf;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use ks_core::config::ClusterConfig;
use ks_core::error::ConfigError;
use ks_core::manifest::{Deployment, NamedObject, Namespace, ObjectList, ObjectMeta, Service};
use ks_core::traits::ClusterApi;
use ks_core::types::PodSummary;
use ks_core::UpstreamError;

/// Where the bearer token comes from
#[derive(Debug, Clone)]
enum TokenSource {
    /// Fixed token from configuration
    Static(String),
    /// Token file, re-read on every request so rotated tokens are picked up
    File(PathBuf),
    /// No authentication
    Anonymous,
}

/// Cluster API client backed by reqwest
pub struct KubeClient {
    http: Client,
    base_url: String,
    token: TokenSource,
}

impl KubeClient {
    /// Build a client from cluster configuration
    pub fn from_config(config: &ClusterConfig) -> Result<Self, ConfigError> {
        let mut builder = Client::builder().danger_accept_invalid_certs(config.accept_invalid_certs);

        if let Some(ca_path) = config.ca_cert_path.as_ref().filter(|p| p.exists()) {
            let pem = std::fs::read(ca_path).map_err(|e| {
                ConfigError::Invalid(format!("Failed to read CA bundle {:?}: {}", ca_path, e))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                ConfigError::Invalid(format!("Invalid CA bundle {:?}: {}", ca_path, e))
            })?;
            builder = builder.add_root_certificate(cert);
            tracing::debug!("Using cluster CA bundle {:?}", ca_path);
        }

        let token = match (&config.token, &config.token_path) {
            (Some(token), _) => TokenSource::Static(token.clone()),
            (None, Some(path)) if path.exists() => TokenSource::File(path.clone()),
            (None, Some(path)) => {
                tracing::warn!(
                    "Token file {:?} not found, talking to the cluster anonymously",
                    path
                );
                TokenSource::Anonymous
            }
            (None, None) => TokenSource::Anonymous,
        };

        let http = builder
            .build()
            .map_err(|e| ConfigError::Invalid(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder, UpstreamError> {
        let token = match &self.token {
            TokenSource::Static(token) => token.clone(),
            TokenSource::File(path) => tokio::fs::read_to_string(path)
                .await
                .map_err(|e| UpstreamError::Request(format!("failed to read token {:?}: {}", path, e)))?
                .trim()
                .to_string(),
            TokenSource::Anonymous => return Ok(request),
        };
        Ok(request.bearer_auth(token))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, UpstreamError> {
        tracing::debug!("GET {}", path);
        let request = self.authorize(self.http.get(self.url(path))).await?;
        let response = request
            .send()
            .await
            .map_err(|e| UpstreamError::Request(e.to_string()))?;
        decode(check(response).await?).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, UpstreamError> {
        tracing::debug!("POST {}", path);
        let request = self.authorize(self.http.post(self.url(path)).json(body)).await?;
        let response = request
            .send()
            .await
            .map_err(|e| UpstreamError::Request(e.to_string()))?;
        decode(check(response).await?).await
    }
}

/// Map non-success statuses onto upstream errors
async fn check(response: Response) -> Result<Response, UpstreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<StatusBody>(&body)
        .ok()
        .and_then(|s| s.message)
        .unwrap_or(body);

    if status == StatusCode::CONFLICT {
        Err(UpstreamError::Conflict(message))
    } else {
        Err(UpstreamError::Cluster {
            status: status.as_u16(),
            message,
        })
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, UpstreamError> {
    response
        .json::<T>()
        .await
        .map_err(|e| UpstreamError::Request(format!("invalid response body: {}", e)))
}

/// `meta/v1/Status` as returned with error responses
#[derive(Deserialize)]
struct StatusBody {
    message: Option<String>,
}

#[derive(Deserialize)]
struct CreatedService {
    spec: CreatedServiceSpec,
}

#[derive(Deserialize)]
struct CreatedServiceSpec {
    #[serde(default)]
    ports: Vec<AllocatedPort>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AllocatedPort {
    node_port: Option<u16>,
}

#[derive(Deserialize)]
struct Pod {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Default, Deserialize)]
struct PodStatus {
    phase: Option<String>,
}

#[async_trait]
impl ClusterApi for KubeClient {
    async fn list_namespaces(&self) -> Result<Vec<String>, UpstreamError> {
        let list: ObjectList<NamedObject> = self.get("/api/v1/namespaces").await?;
        Ok(list.items.into_iter().map(|o| o.metadata.name).collect())
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), UpstreamError> {
        let _: NamedObject = self.post("/api/v1/namespaces", namespace).await?;
        tracing::info!("Created namespace {}", namespace.metadata.name);
        Ok(())
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<String>, UpstreamError> {
        let path = format!("/apis/apps/v1/namespaces/{}/deployments", namespace);
        let list: ObjectList<NamedObject> = self.get(&path).await?;
        Ok(list.items.into_iter().map(|o| o.metadata.name).collect())
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<(), UpstreamError> {
        let namespace = deployment.metadata.namespace.as_deref().unwrap_or("default");
        let path = format!("/apis/apps/v1/namespaces/{}/deployments", namespace);
        let _: NamedObject = self.post(&path, deployment).await?;
        tracing::info!(
            "Created deployment {}/{}",
            namespace,
            deployment.metadata.name
        );
        Ok(())
    }

    async fn create_service(&self, service: &Service) -> Result<u16, UpstreamError> {
        let namespace = service.metadata.namespace.as_deref().unwrap_or("default");
        let path = format!("/api/v1/namespaces/{}/services", namespace);
        let created: CreatedService = self.post(&path, service).await?;

        let node_port = created
            .spec
            .ports
            .iter()
            .find_map(|p| p.node_port)
            .ok_or_else(|| {
                UpstreamError::Request(format!(
                    "service {} was created without a node port",
                    service.metadata.name
                ))
            })?;

        tracing::info!(
            "Created service {}/{} on node port {}",
            namespace,
            service.metadata.name,
            node_port
        );
        Ok(node_port)
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodSummary>, UpstreamError> {
        let path = format!("/api/v1/namespaces/{}/pods", namespace);
        let list: ObjectList<Pod> = self.get(&path).await?;
        Ok(list
            .items
            .into_iter()
            .map(|p| PodSummary {
                name: p.metadata.name,
                phase: p.status.phase,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};

    /// Serve a fake API server on an ephemeral port, returning its base URL
    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client(base_url: String, token: Option<&str>) -> KubeClient {
        KubeClient::from_config(&ClusterConfig {
            api_url: base_url,
            token: token.map(str::to_string),
            token_path: None,
            ca_cert_path: None,
            accept_invalid_certs: false,
            node_host: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_list_namespaces_sends_bearer_token() {
        let router = Router::new().route(
            "/api/v1/namespaces",
            get(|headers: HeaderMap| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                if auth != "Bearer sekret" {
                    return (StatusCode::UNAUTHORIZED, Json(json!({"message": "Unauthorized"})));
                }
                (
                    StatusCode::OK,
                    Json(json!({
                        "kind": "NamespaceList",
                        "items": [
                            {"metadata": {"name": "default", "uid": "1"}},
                            {"metadata": {"name": "j19k1107", "uid": "2"}}
                        ]
                    })),
                )
            }),
        );
        let base = serve(router).await;

        let names = client(base.clone(), Some("sekret")).list_namespaces().await.unwrap();
        assert_eq!(names, vec!["default", "j19k1107"]);

        let err = client(base, None).list_namespaces().await.unwrap_err();
        assert!(matches!(err, UpstreamError::Cluster { status: 401, message } if message == "Unauthorized"));
    }

    #[tokio::test]
    async fn test_conflict_status_maps_to_conflict() {
        let router = Router::new().route(
            "/apis/apps/v1/namespaces/:ns/deployments",
            post(|Path(ns): Path<String>| async move {
                (
                    StatusCode::CONFLICT,
                    Json(json!({
                        "kind": "Status",
                        "reason": "AlreadyExists",
                        "message": format!("deployments.apps \"app\" already exists in {}", ns)
                    })),
                )
            }),
        );
        let base = serve(router).await;

        let mut deployment = crate::provision::deployment_manifest(
            &ks_core::types::ResourceNames::derive(
                &ks_core::UserIdentity::new("bob"),
                &ks_core::ImageRef::new("app"),
            )
            .unwrap(),
            &ks_core::ImageRef::new("app"),
            22,
        );
        deployment.metadata.name = "app".to_string();

        let err = client(base, None).create_deployment(&deployment).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Conflict(msg) if msg.contains("already exists in bob")));
    }

    #[tokio::test]
    async fn test_create_service_returns_node_port() {
        let router = Router::new().route(
            "/api/v1/namespaces/:ns/services",
            post(|Json(mut body): Json<Value>| async move {
                body["spec"]["ports"][0]["nodePort"] = json!(31022);
                (StatusCode::CREATED, Json(body))
            }),
        );
        let base = serve(router).await;

        let names = ks_core::types::ResourceNames::derive(
            &ks_core::UserIdentity::new("bob"),
            &ks_core::ImageRef::new("ubuntu"),
        )
        .unwrap();
        let service = crate::provision::service_manifest(&names, 22);

        let port = client(base, None).create_service(&service).await.unwrap();
        assert_eq!(port, 31022);
    }

    #[tokio::test]
    async fn test_list_pods_reads_phase() {
        let router = Router::new().route(
            "/api/v1/namespaces/:ns/pods",
            get(|| async {
                Json(json!({
                    "items": [
                        {"metadata": {"name": "p-1"}, "status": {"phase": "Running"}},
                        {"metadata": {"name": "p-2"}}
                    ]
                }))
            }),
        );
        let base = serve(router).await;

        let pods = client(base, None).list_pods("bob").await.unwrap();
        assert_eq!(pods.len(), 2);
        assert_eq!(pods[0].phase.as_deref(), Some("Running"));
        assert_eq!(pods[1].phase, None);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_request_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client(format!("http://{}", addr), None)
            .list_namespaces()
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Request(_)));
    }

    #[test]
    fn test_static_token_wins_over_file() {
        let client = KubeClient::from_config(&ClusterConfig {
            api_url: "https://example:6443/".to_string(),
            token: Some("abc".to_string()),
            token_path: Some(PathBuf::from("/does/not/exist")),
            ca_cert_path: Some(PathBuf::from("/does/not/exist")),
            accept_invalid_certs: false,
            node_host: None,
        })
        .unwrap();

        assert!(matches!(client.token, TokenSource::Static(ref t) if t == "abc"));
        assert_eq!(client.url("/api/v1/namespaces"), "https://example:6443/api/v1/namespaces");
    }
}
