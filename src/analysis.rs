//! Cluster membership deltas and the sink they are published to.
//!
//! Every committed change to a chunk's clustering state leaves the crate as a
//! [`ClustersUpdate`] tagged with the store's commit time. Consumers must
//! tolerate out-of-order delivery across chunks and use the commit time to
//! resolve the latest state of each `(cluster, failure)` pair.

use crate::model::{ChunkId, ClusterId, ClusterSet, Failure};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Change of one failure's cluster membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureUpdate {
    pub failure: Failure,
    pub previous: ClusterSet,
    pub new: ClusterSet,
}

impl FailureUpdate {
    /// Clusters the failure joined.
    pub fn added(&self) -> Vec<ClusterId> {
        self.new.difference(&self.previous)
    }

    /// Clusters the failure left.
    pub fn removed(&self) -> Vec<ClusterId> {
        self.previous.difference(&self.new)
    }
}

/// Membership changes of one chunk produced by a single commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClustersUpdate {
    pub project: String,
    pub chunk_id: ChunkId,
    pub updates: Vec<FailureUpdate>,
}

impl ClustersUpdate {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// Per-failure updates for the failures whose cluster set differs between
/// `previous` and `new`. A missing previous entry counts as no clusters.
pub fn diff_results(previous: &[ClusterSet], new: &[ClusterSet], failures: &[Failure]) -> Vec<FailureUpdate> {
    let empty = ClusterSet::empty();
    failures
        .iter()
        .zip(new)
        .enumerate()
        .filter_map(|(index, (failure, new))| {
            let previous = previous.get(index).unwrap_or(&empty);
            (previous != new).then(|| FailureUpdate {
                failure: failure.clone(),
                previous: previous.clone(),
                new: new.clone(),
            })
        })
        .collect()
}

/// Downstream consumer of cluster membership changes.
#[async_trait]
pub trait AnalysisSink: Send + Sync {
    async fn clusters_updated(&self, update: &ClustersUpdate, commit_time: DateTime<Utc>) -> Result<()>;
}

/// Sink that records every notification, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryAnalysisSink {
    received: Mutex<Vec<(ClustersUpdate, DateTime<Utc>)>>,
}

impl MemoryAnalysisSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<(ClustersUpdate, DateTime<Utc>)> {
        self.received.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.received.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.received.lock().is_empty()
    }

    pub fn clear(&self) {
        self.received.lock().clear();
    }
}

#[async_trait]
impl AnalysisSink for MemoryAnalysisSink {
    async fn clusters_updated(&self, update: &ClustersUpdate, commit_time: DateTime<Utc>) -> Result<()> {
        self.received.lock().push((update.clone(), commit_time));
        Ok(())
    }
}
