//! Docker Engine API candidate source.
//!
//! Lists running containers through `GET /containers/json` on a TCP
//! endpoint (e.g. `http://localhost:2375`).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;

use super::types::{CandidateSource, RawRecord};
use crate::errors::RouterError;

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Total request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Wire Types ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerContainer {
    id: String,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
    #[serde(default)]
    network_settings: Option<DockerNetworkSettings>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerNetworkSettings {
    #[serde(default)]
    networks: HashMap<String, DockerNetwork>,
}

#[derive(Debug, Deserialize)]
struct DockerNetwork {
    #[serde(rename = "IPAddress", default)]
    ip_address: Option<String>,
}

impl From<DockerContainer> for RawRecord {
    fn from(container: DockerContainer) -> Self {
        // First non-empty address, by network name for stable results.
        let ip = container.network_settings.and_then(|settings| {
            let mut networks: Vec<_> = settings.networks.into_iter().collect();
            networks.sort_by(|a, b| a.0.cmp(&b.0));
            networks
                .into_iter()
                .filter_map(|(_, net)| net.ip_address)
                .find(|ip| !ip.is_empty())
        });
        RawRecord {
            id: container.id,
            names: container.names,
            labels: container.labels.unwrap_or_default(),
            ip,
        }
    }
}

// ─── DockerSource ────────────────────────────────────────────────────────────

/// Lists containers from a Docker daemon.
pub struct DockerSource {
    http: HttpClient,
    endpoint: String,
}

impl DockerSource {
    /// Create a source for the daemon at `endpoint`.
    pub fn new(endpoint: &str) -> Result<Self, RouterError> {
        let endpoint = endpoint.trim_end_matches('/').to_string();
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| {
                RouterError::connection(endpoint.clone(), format!("failed to build HTTP client: {e}"))
            })?;
        Ok(Self { http, endpoint })
    }
}

#[async_trait]
impl CandidateSource for DockerSource {
    async fn list_candidates(&self) -> Result<Vec<RawRecord>, RouterError> {
        let url = format!("{}/containers/json", self.endpoint);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| RouterError::connection(url.clone(), e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RouterError::connection(
                url,
                format!("HTTP {}: {body}", status.as_u16()),
            ));
        }

        let containers: Vec<DockerContainer> = response
            .json()
            .await
            .map_err(|e| RouterError::connection(url.clone(), format!("malformed container list: {e}")))?;
        Ok(containers.into_iter().map(RawRecord::from).collect())
    }

    fn describe(&self) -> String {
        format!("docker@{}", self.endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const CONTAINERS: &str = r#"[
        {
            "Id": "abc123def456789",
            "Names": ["/weather"],
            "Labels": {"mcp.server": "true", "mcp.server.port": "9000"},
            "NetworkSettings": {"Networks": {
                "bridge": {"IPAddress": "172.17.0.2"},
                "zz_other": {"IPAddress": "10.1.1.1"}
            }}
        },
        {
            "Id": "fff000",
            "Names": ["/postgres"],
            "Labels": null,
            "NetworkSettings": {"Networks": {"host": {"IPAddress": ""}}}
        }
    ]"#;

    /// One-shot HTTP server answering with `status` and `body`.
    async fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/")
    }

    #[test]
    fn test_container_mapping() {
        let containers: Vec<DockerContainer> = serde_json::from_str(CONTAINERS).unwrap();
        let records: Vec<RawRecord> = containers.into_iter().map(RawRecord::from).collect();

        assert_eq!(records[0].id, "abc123def456789");
        assert_eq!(records[0].ip.as_deref(), Some("172.17.0.2"));
        assert_eq!(records[0].labels["mcp.server.port"], "9000");
        assert!(records[1].labels.is_empty());
        assert!(records[1].ip.is_none());
    }

    #[tokio::test]
    async fn test_lists_containers_over_http() {
        let endpoint = serve_once("200 OK", CONTAINERS).await;
        let source = DockerSource::new(&endpoint).unwrap();
        let records = source.list_candidates().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].names, vec!["/weather"]);
    }

    #[tokio::test]
    async fn test_http_error_is_connection_error() {
        let endpoint = serve_once("500 Internal Server Error", "{\"message\":\"boom\"}").await;
        let source = DockerSource::new(&endpoint).unwrap();
        let err = source.list_candidates().await.unwrap_err();
        assert_eq!(err.code(), "connection_error");
        assert!(err.to_string().contains("500"));
    }
}
