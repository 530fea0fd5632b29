//! Polling discovery loop.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::types::{to_server_record, CandidateSource, DiscoverySettings, ServerDiscoveryHandler};
use crate::errors::RouterError;

/// Periodically polls a [`CandidateSource`] and reports marked candidates.
///
/// `Stopped → Running → Stopped`. Stopping discovery never touches live
/// connections; it only cancels the poll timer.
pub struct DiscoveryService {
    inner: Arc<DiscoveryInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct DiscoveryInner {
    source: Arc<dyn CandidateSource>,
    handler: Arc<dyn ServerDiscoveryHandler>,
    settings: DiscoverySettings,
}

impl DiscoveryService {
    pub fn new(
        source: Arc<dyn CandidateSource>,
        handler: Arc<dyn ServerDiscoveryHandler>,
        settings: DiscoverySettings,
    ) -> Self {
        Self {
            inner: Arc::new(DiscoveryInner {
                source,
                handler,
                settings,
            }),
            task: Mutex::new(None),
        }
    }

    /// Run one pass now, then keep polling at the configured interval.
    ///
    /// No-op if already running. A failing first pass is logged and the
    /// service still starts.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        tracing::info!(
            source = %self.inner.source.describe(),
            interval_secs = self.inner.settings.interval.as_secs_f64(),
            "starting discovery"
        );
        if let Err(e) = self.inner.poll_once().await {
            tracing::warn!(error = %e, "initial discovery pass failed");
        }

        let inner = self.inner.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; the initial pass already ran.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = inner.poll_once().await {
                    tracing::warn!(error = %e, "discovery pass failed");
                }
            }
        }));
    }

    /// Cancel the poll timer. Idempotent.
    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
            tracing::info!("discovery stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }

    /// Run a single pass. Returns how many servers were reported.
    pub async fn poll_once(&self) -> Result<usize, RouterError> {
        self.inner.poll_once().await
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

impl DiscoveryInner {
    async fn poll_once(&self) -> Result<usize, RouterError> {
        let candidates = self.source.list_candidates().await?;
        let total = candidates.len();

        let mut found = 0;
        for record in candidates
            .iter()
            .filter_map(|raw| to_server_record(raw, &self.settings))
        {
            tracing::debug!(server = %record.id, address = %record.address, "discovered server");
            self.handler.on_server_discovered(record).await;
            found += 1;
        }

        tracing::debug!(candidates = total, found, "discovery pass complete");
        Ok(found)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
