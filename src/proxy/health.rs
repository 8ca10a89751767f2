//! Upstream liveness engine.
//!
//! Probes every configured upstream on a fixed minimum interval. Three
//! consecutive failures mark an upstream offline; a single success brings
//! it straight back to healthy with the failure counter reset. The router
//! and the backup-upstream fallback consult this state to skip offline
//! upstreams.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::tenant::{RepositoryRegistry, UpstreamConfig};

const OFFLINE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamStatus {
    Healthy,
    Degraded,
    Offline,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamHealth {
    pub status: UpstreamStatus,
    pub response_time_ms: u64,
    pub consecutive_failures: u32,
    pub last_check: Option<DateTime<Utc>>,
}

impl Default for UpstreamHealth {
    fn default() -> Self {
        Self {
            status: UpstreamStatus::Healthy,
            response_time_ms: 0,
            consecutive_failures: 0,
            last_check: None,
        }
    }
}

pub struct HealthMonitor {
    client: reqwest::Client,
    states: DashMap<String, UpstreamHealth>,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(probe_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            states: DashMap::new(),
            probe_timeout,
        }
    }

    /// Unknown upstreams count as available until a probe says otherwise.
    pub fn is_available(&self, upstream_id: &str) -> bool {
        self.states
            .get(upstream_id)
            .map(|h| h.status != UpstreamStatus::Offline)
            .unwrap_or(true)
    }

    pub fn status(&self, upstream_id: &str) -> Option<UpstreamHealth> {
        self.states.get(upstream_id).map(|h| h.clone())
    }

    pub fn snapshot(&self) -> Vec<(String, UpstreamHealth)> {
        let mut out: Vec<_> = self
            .states
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Probe one upstream and update its state. Any HTTP response counts as
    /// alive; only transport errors and timeouts are failures.
    pub async fn probe(&self, upstream: &UpstreamConfig) {
        let started = Instant::now();
        let result = self
            .client
            .get(&upstream.url)
            .timeout(self.probe_timeout)
            .send()
            .await;
        match result {
            Ok(_) => self.record_success(&upstream.id, started.elapsed()),
            Err(err) => {
                tracing::debug!(upstream = %upstream.id, error = %err, "health probe failed");
                self.record_failure(&upstream.id);
            }
        }
    }

    pub fn record_success(&self, upstream_id: &str, elapsed: Duration) {
        let mut entry = self.states.entry(upstream_id.to_string()).or_default();
        if entry.status == UpstreamStatus::Offline {
            tracing::info!(upstream = %upstream_id, "upstream back online");
        }
        entry.status = UpstreamStatus::Healthy;
        entry.response_time_ms = elapsed.as_millis() as u64;
        entry.consecutive_failures = 0;
        entry.last_check = Some(Utc::now());
    }

    pub fn record_failure(&self, upstream_id: &str) {
        let mut entry = self.states.entry(upstream_id.to_string()).or_default();
        entry.consecutive_failures += 1;
        entry.last_check = Some(Utc::now());
        entry.status = if entry.consecutive_failures >= OFFLINE_THRESHOLD {
            if entry.status != UpstreamStatus::Offline {
                tracing::warn!(upstream = %upstream_id, "upstream marked offline");
            }
            UpstreamStatus::Offline
        } else {
            UpstreamStatus::Degraded
        };
    }

    /// Background probe loop over every upstream the registry knows.
    pub fn spawn(
        self: &Arc<Self>,
        registry: Arc<RepositoryRegistry>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for upstream in registry.all_upstreams() {
                    monitor.probe(&upstream).await;
                }
            }
        })
    }
}
