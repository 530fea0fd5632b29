//! Discovery seams and candidate → record conversion.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::errors::RouterError;
use crate::router::ServerRecord;

// ─── Seams ───────────────────────────────────────────────────────────────────

/// One entry reported by a candidate source (e.g. a container).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRecord {
    pub id: String,
    pub names: Vec<String>,
    pub labels: HashMap<String, String>,
    /// Reachable IP address, if the source knows one.
    pub ip: Option<String>,
}

/// Where discovery looks for servers.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn list_candidates(&self) -> Result<Vec<RawRecord>, RouterError>;

    /// Name for logs.
    fn describe(&self) -> String;
}

/// Receives every server found by a discovery pass.
#[async_trait]
pub trait ServerDiscoveryHandler: Send + Sync {
    async fn on_server_discovered(&self, record: ServerRecord);
}

// ─── Settings ────────────────────────────────────────────────────────────────

/// Polling and label conventions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverySettings {
    pub interval: Duration,
    /// Marker label; a candidate is a server when it is `"true"`.
    /// Hints live under `<label>.name`, `<label>.port`, `<label>.protocol`.
    pub label: String,
    pub default_port: u16,
    pub default_protocol: String,
    pub default_host: String,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            label: "mcp.server".into(),
            default_port: 8080,
            default_protocol: "http".into(),
            default_host: "localhost".into(),
        }
    }
}

// ─── Conversion ──────────────────────────────────────────────────────────────

/// Length of the container id prefix used as server id.
const SHORT_ID_LEN: usize = 12;

/// Convert a candidate into a server record, or `None` if it is not marked.
///
/// Address is `{protocol}://{host}:{port}` built from the label hints, with
/// the configured defaults for anything missing.
pub fn to_server_record(raw: &RawRecord, settings: &DiscoverySettings) -> Option<ServerRecord> {
    let marker = raw.labels.get(&settings.label)?;
    if !marker.trim().eq_ignore_ascii_case("true") {
        return None;
    }

    let hint = |suffix: &str| label_hint(&raw.labels, &settings.label, suffix);

    let short_id: String = raw.id.chars().take(SHORT_ID_LEN).collect();
    let name = hint("name")
        .map(str::to_string)
        .or_else(|| {
            raw.names
                .first()
                .map(|n| n.trim_start_matches('/').to_string())
                .filter(|n| !n.is_empty())
        })
        .unwrap_or_else(|| short_id.clone());

    let port = match hint("port") {
        Some(p) => match p.parse::<u16>() {
            Ok(port) => port,
            Err(_) => {
                tracing::warn!(container = %short_id, port = p, "invalid port label, using default");
                settings.default_port
            }
        },
        None => settings.default_port,
    };
    let protocol = hint("protocol").unwrap_or(settings.default_protocol.as_str());
    let host = raw
        .ip
        .as_deref()
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .unwrap_or(settings.default_host.as_str());

    let address = format!("{protocol}://{host}:{port}");
    let labels: serde_json::Map<String, Value> = raw
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();

    Some(
        ServerRecord::new(&short_id, &name, &address)
            .with_metadata("source", json!("discovery"))
            .with_metadata("container_id", json!(raw.id))
            .with_metadata("labels", Value::Object(labels)),
    )
}

fn label_hint<'a>(
    labels: &'a HashMap<String, String>,
    prefix: &str,
    suffix: &str,
) -> Option<&'a str> {
    labels
        .get(&format!("{prefix}.{suffix}"))
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}
