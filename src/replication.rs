//! Replication hand-off.
//!
//! The blob store notifies a [`ReplicationSink`] after every successful
//! commit. The sink is constructor-injected so tests and single-node
//! deployments substitute a no-op; a real deployment wires a sink that
//! forwards to the replication scheduler. Sink failures never affect the
//! triggering upload.

use async_trait::async_trait;
use bytes::Bytes;

use crate::tenant::{RepoId, TenantId};

/// Payload handed to the replication sink after a blob commit.
#[derive(Debug, Clone)]
pub struct ReplicationRequest {
    pub tenant: TenantId,
    pub repo: RepoId,
    pub artifact_id: String,
    pub size: u64,
    pub checksum: String,
    pub payload: Bytes,
}

/// Receiver for post-commit replication requests.
#[async_trait]
pub trait ReplicationSink: Send + Sync {
    async fn replicate(&self, request: ReplicationRequest) -> anyhow::Result<()>;
}

/// Sink that drops every request. Default for tests and single-node runs.
#[derive(Debug, Default)]
pub struct NoopReplication;

#[async_trait]
impl ReplicationSink for NoopReplication {
    async fn replicate(&self, request: ReplicationRequest) -> anyhow::Result<()> {
        tracing::debug!(
            tenant = %request.tenant,
            repo = %request.repo,
            artifact = %request.artifact_id,
            size = request.size,
            "replication skipped (no-op sink)"
        );
        Ok(())
    }
}

/// Sink backed by a bounded channel, for deployments where a separate task
/// drains replication work. A full channel drops the request with a warning.
pub struct ChannelReplication {
    tx: tokio::sync::mpsc::Sender<ReplicationRequest>,
}

impl ChannelReplication {
    pub fn new(capacity: usize) -> (Self, tokio::sync::mpsc::Receiver<ReplicationRequest>) {
        let (tx, rx) = tokio::sync::mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ReplicationSink for ChannelReplication {
    async fn replicate(&self, request: ReplicationRequest) -> anyhow::Result<()> {
        if let Err(err) = self.tx.try_send(request) {
            tracing::warn!(error = %err, "replication queue full, dropping request");
        }
        Ok(())
    }
}
