//! Coordination record of a fleet-wide reclustering attempt.
//!
//! A run splits the chunk id space into contiguous shards, hands each shard
//! to a worker as a [`ReclusteringTask`] and collects their progress. The
//! run is complete once every shard has reported.

use super::{ReclusteringTask, ShardProgress, PROGRESS_COMPLETE};
use crate::config::ReclusteringConfig;
use crate::model::{ChunkId, RulesVersion};
use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Split the chunk id space into `shard_count` contiguous `[start, end)`
/// ranges. The first starts at the smallest id; the last is unbounded.
pub fn split_keyspace(shard_count: usize) -> Vec<(ChunkId, Option<ChunkId>)> {
    if shard_count == 0 {
        return Vec::new();
    }
    let step = u128::MAX / shard_count as u128;
    let starts: Vec<ChunkId> = (0..shard_count)
        .map(|index| ChunkId::from_u128(step * index as u128))
        .collect();
    starts
        .iter()
        .enumerate()
        .map(|(index, start)| (*start, starts.get(index + 1).copied()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclusteringRun {
    pub project: String,
    /// Deadline of every shard of this attempt.
    pub attempt_time: DateTime<Utc>,
    pub algorithms_version: i64,
    pub rules_version: RulesVersion,
    pub shard_count: usize,
    shard_progress: Vec<Option<u32>>,
}

impl ReclusteringRun {
    pub fn new(
        project: impl Into<String>,
        attempt_time: DateTime<Utc>,
        algorithms_version: i64,
        rules_version: RulesVersion,
        shard_count: usize,
    ) -> Result<Self> {
        if shard_count == 0 {
            bail!("a reclustering run needs at least one shard");
        }
        Ok(Self {
            project: project.into(),
            attempt_time,
            algorithms_version,
            rules_version,
            shard_count,
            shard_progress: vec![None; shard_count],
        })
    }

    /// A run split into the configured number of shards.
    pub fn from_config(
        project: impl Into<String>,
        attempt_time: DateTime<Utc>,
        algorithms_version: i64,
        rules_version: RulesVersion,
        config: &ReclusteringConfig,
    ) -> Result<Self> {
        Self::new(project, attempt_time, algorithms_version, rules_version, config.shard_count)
    }

    /// One task per shard, in key order.
    pub fn shard_tasks(&self) -> Vec<ReclusteringTask> {
        split_keyspace(self.shard_count)
            .into_iter()
            .map(|(start_chunk_id, end_chunk_id)| ReclusteringTask {
                project: self.project.clone(),
                attempt_deadline: self.attempt_time,
                start_chunk_id,
                end_chunk_id,
                algorithms_version: self.algorithms_version,
                rules_version: self.rules_version,
            })
            .collect()
    }

    /// Record a shard's progress. A later report for the same shard replaces
    /// the earlier one.
    pub fn report_shard(&mut self, shard_index: usize, progress: &ShardProgress) -> Result<()> {
        let slot = self.shard_progress.get_mut(shard_index).ok_or_else(|| {
            anyhow!(
                "shard {shard_index} out of range for run with {} shards",
                self.shard_count
            )
        })?;
        *slot = Some(progress.progress_thousandths.min(PROGRESS_COMPLETE));
        Ok(())
    }

    pub fn shards_reported(&self) -> usize {
        self.shard_progress.iter().filter(|p| p.is_some()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.shards_reported() == self.shard_count
    }

    /// Sum of reported shard progress, in thousandths of a shard.
    pub fn progress(&self) -> u64 {
        self.shard_progress.iter().flatten().map(|p| u64::from(*p)).sum()
    }

    /// Every shard reported scanning its whole range.
    pub fn is_fully_progressed(&self) -> bool {
        self.shard_progress
            .iter()
            .all(|p| *p == Some(PROGRESS_COMPLETE))
    }
}
