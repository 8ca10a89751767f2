//! Security-scan hand-off.
//!
//! Scanning itself is an external process; this queue only records that a
//! payload should be scanned and hands the request to a background worker
//! over a bounded channel. Enqueueing never blocks and never fails the
//! triggering request: a full queue drops the request with a warning.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::metrics::MetricsRegistry;
use crate::tenant::{RepoId, TenantId};

const RECENT_CAPACITY: usize = 256;

/// One scan request.
#[derive(Debug, Clone, Serialize)]
pub struct ScanRequest {
    pub tenant: TenantId,
    pub repo: RepoId,
    /// Artifact id for stored payloads, cache key for proxied ones.
    pub subject: String,
    pub size: u64,
    pub requested_at: DateTime<Utc>,
}

/// Cloneable producer handle.
#[derive(Clone)]
pub struct ScanQueue {
    tx: mpsc::Sender<ScanRequest>,
    recent: Arc<Mutex<VecDeque<ScanRequest>>>,
    metrics: Arc<MetricsRegistry>,
}

impl ScanQueue {
    /// Start the worker and return the producer handle.
    pub fn spawn(capacity: usize, metrics: Arc<MetricsRegistry>) -> Self {
        let (tx, mut rx) = mpsc::channel::<ScanRequest>(capacity);
        let recent: Arc<Mutex<VecDeque<ScanRequest>>> =
            Arc::new(Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)));

        let worker_recent = recent.clone();
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                tracing::info!(
                    tenant = %request.tenant,
                    repo = %request.repo,
                    subject = %request.subject,
                    size = request.size,
                    "scan requested"
                );
                let mut recent = worker_recent.lock();
                if recent.len() == RECENT_CAPACITY {
                    recent.pop_front();
                }
                recent.push_back(request);
            }
        });

        Self {
            tx,
            recent,
            metrics,
        }
    }

    /// Non-blocking enqueue.
    pub fn enqueue(&self, request: ScanRequest) {
        match self.tx.try_send(request) {
            Ok(()) => self.metrics.record_scan_enqueued(),
            Err(err) => {
                self.metrics.record_scan_dropped();
                tracing::warn!(error = %err, "scan queue full, dropping request");
            }
        }
    }

    /// Most recent requests the worker has seen, newest last.
    pub fn recent(&self) -> Vec<ScanRequest> {
        self.recent.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(subject: &str) -> ScanRequest {
        ScanRequest {
            tenant: TenantId::new("acme").unwrap(),
            repo: RepoId::new("releases").unwrap(),
            subject: subject.to_string(),
            size: 1,
            requested_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn worker_records_requests() {
        let queue = ScanQueue::spawn(8, Arc::new(MetricsRegistry::new()));
        queue.enqueue(request("a1"));
        queue.enqueue(request("a2"));

        // Give the worker a moment to drain.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let recent = queue.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].subject, "a1");
    }
}
