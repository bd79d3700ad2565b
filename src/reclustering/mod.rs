//! # Reclustering
//!
//! A [`Worker`] brings the clustering state of one key range of chunks up to
//! date with the algorithms it runs and the project's current rules.
//!
//! Each chunk is an independent read, recompute, compare-and-swap cycle. No
//! lock is held while recomputing; if another writer advanced the row in the
//! meantime the recomputed result is discarded. Chunks already at or past
//! the worker's versions are left untouched, so versions never regress and
//! repeated runs are no-ops.

pub mod run;

pub use run::{split_keyspace, ReclusteringRun};

use crate::analysis::{diff_results, AnalysisSink, ClustersUpdate};
use crate::clustering::AlgorithmRegistry;
use crate::config::{ReclusteringConfig, DEFAULT_MAX_CONCURRENT_CHUNKS, DEFAULT_RECLUSTERING_BATCH_SIZE};
use crate::model::{ChunkId, ClusteringState, RulesVersion};
use crate::rules::{Ruleset, RulesetCache};
use crate::store::{BlobStore, CommitOutcome, StateStore};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// Progress is reported in thousandths of a shard's key range.
pub const PROGRESS_COMPLETE: u32 = 1000;

/// One shard of a reclustering run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclusteringTask {
    pub project: String,
    /// No chunk is started at or after this time.
    pub attempt_deadline: DateTime<Utc>,
    pub start_chunk_id: ChunkId,
    /// Exclusive; `None` scans to the end of the keyspace.
    pub end_chunk_id: Option<ChunkId>,
    /// Minimum algorithms version the worker must run.
    pub algorithms_version: i64,
    /// Minimum rules version to recluster against.
    pub rules_version: RulesVersion,
}

/// What a worker achieved on one task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardProgress {
    /// Last chunk fully processed, if any.
    pub scanned_up_to: Option<ChunkId>,
    pub chunks_scanned: usize,
    pub chunks_updated: usize,
    /// Chunks whose update lost a compare-and-swap to another writer.
    pub chunks_conflicted: usize,
    pub progress_thousandths: u32,
    pub deadline_reached: bool,
}

impl ShardProgress {
    pub fn is_complete(&self) -> bool {
        self.progress_thousandths >= PROGRESS_COMPLETE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkOutcome {
    Current,
    Updated,
    Conflicted,
}

#[derive(Clone)]
pub struct Worker {
    registry: Arc<AlgorithmRegistry>,
    rules: Arc<RulesetCache>,
    states: Arc<dyn StateStore>,
    blobs: Arc<dyn BlobStore>,
    analysis: Arc<dyn AnalysisSink>,
    batch_size: usize,
    max_concurrent_chunks: usize,
}

impl Worker {
    pub fn new(
        registry: Arc<AlgorithmRegistry>,
        rules: Arc<RulesetCache>,
        states: Arc<dyn StateStore>,
        blobs: Arc<dyn BlobStore>,
        analysis: Arc<dyn AnalysisSink>,
    ) -> Self {
        Self {
            registry,
            rules,
            states,
            blobs,
            analysis,
            batch_size: DEFAULT_RECLUSTERING_BATCH_SIZE,
            max_concurrent_chunks: DEFAULT_MAX_CONCURRENT_CHUNKS,
        }
    }

    pub fn with_config(mut self, config: &ReclusteringConfig) -> Self {
        self.batch_size = config.batch_size.max(1);
        self.max_concurrent_chunks = config.max_concurrent_chunks.max(1);
        self
    }

    /// Recluster the chunks of `task`'s key range in ascending order.
    ///
    /// Returns partial progress when the deadline passes. Fails without
    /// writing if this worker runs algorithms older than the task requires.
    #[instrument(
        skip(self, task),
        fields(project = %task.project, start = %task.start_chunk_id),
        level = "debug"
    )]
    pub async fn do_task(&self, task: &ReclusteringTask) -> Result<ShardProgress> {
        if task.algorithms_version > self.registry.version() {
            bail!(
                "worker runs algorithms version {} but task requires {}",
                self.registry.version(),
                task.algorithms_version
            );
        }
        let mut progress = ShardProgress::default();
        if Utc::now() >= task.attempt_deadline {
            progress.deadline_reached = true;
            return Ok(progress);
        }
        let ruleset = self.rules.ruleset(&task.project, Some(task.rules_version)).await?;

        let mut cursor = Some(task.start_chunk_id);

        'scan: while let Some(start) = cursor {
            let batch = self
                .states
                .read_range(&task.project, start, task.end_chunk_id, self.batch_size)
                .await?;
            let batch_len = batch.len();
            cursor = match batch.last() {
                Some(last) if batch_len == self.batch_size => last.chunk_id.successor(),
                _ => None,
            };

            let mut pending = batch.into_iter().peekable();
            while pending.peek().is_some() {
                let mut tasks = JoinSet::new();
                let mut window_last = None;
                for state in pending.by_ref().take(self.max_concurrent_chunks) {
                    if Utc::now() >= task.attempt_deadline {
                        progress.deadline_reached = true;
                        break;
                    }
                    window_last = Some(state.chunk_id);
                    let worker = self.clone();
                    let ruleset = Arc::clone(&ruleset);
                    tasks.spawn(async move { worker.recluster_chunk(ruleset, state).await });
                }

                // Every started chunk runs to completion, even after a sibling
                // failed: dropping the set would abort chunks that committed
                // but have not yet notified analysis.
                let mut failure = None;
                while let Some(joined) = tasks.join_next().await {
                    let outcome = match joined.map_err(anyhow::Error::from).and_then(|outcome| outcome) {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            warn!(error = %err, "chunk reclustering failed");
                            failure.get_or_insert(err);
                            continue;
                        }
                    };
                    match outcome {
                        ChunkOutcome::Current => {}
                        ChunkOutcome::Updated => progress.chunks_updated += 1,
                        ChunkOutcome::Conflicted => progress.chunks_conflicted += 1,
                    }
                    progress.chunks_scanned += 1;
                }
                if let Some(err) = failure {
                    return Err(err);
                }
                if window_last.is_some() {
                    progress.scanned_up_to = window_last;
                }
                if progress.deadline_reached {
                    break 'scan;
                }
            }
        }

        progress.progress_thousandths = if progress.deadline_reached {
            partial_progress(task, progress.scanned_up_to)
        } else {
            PROGRESS_COMPLETE
        };
        info!(
            scanned = progress.chunks_scanned,
            updated = progress.chunks_updated,
            conflicted = progress.chunks_conflicted,
            progress = progress.progress_thousandths,
            "reclustering task finished"
        );
        Ok(progress)
    }

    async fn recluster_chunk(&self, ruleset: Arc<Ruleset>, state: ClusteringState) -> Result<ChunkOutcome> {
        let stored = &state.results;
        if stored.algorithms_version > self.registry.version() {
            debug!(chunk = %state.chunk_id, version = stored.algorithms_version, "chunk clustered by newer algorithms");
            return Ok(ChunkOutcome::Current);
        }
        // Another writer used newer rules than this worker has seen; catch
        // up instead of recomputing against an older ruleset.
        let ruleset = if stored.rules_version > ruleset.version() {
            self.rules
                .ruleset(&state.project, Some(stored.rules_version))
                .await?
        } else {
            ruleset
        };
        if stored.is_at_least(self.registry.version(), ruleset.version()) {
            return Ok(ChunkOutcome::Current);
        }

        let chunk = self.blobs.get(&state.project, &state.object_id).await?;
        if chunk.len() != stored.clusters.len() {
            bail!(
                "chunk {} of project {} has {} failures but {} cluster sets",
                state.chunk_id,
                state.project,
                chunk.len(),
                stored.clusters.len()
            );
        }
        let results = self.registry.cluster(&ruleset, stored, &chunk.failures);
        let updates = diff_results(&stored.clusters, &results.clusters, &chunk.failures);

        let expected = state.stamp();
        let next = ClusteringState {
            results,
            ..state.clone()
        };
        match self.states.update_if_unchanged(&expected, next).await? {
            CommitOutcome::Conflict => {
                debug!(chunk = %state.chunk_id, "chunk advanced concurrently, discarding update");
                Ok(ChunkOutcome::Conflicted)
            }
            CommitOutcome::Committed { commit_time } => {
                if !updates.is_empty() {
                    let update = ClustersUpdate {
                        project: state.project.clone(),
                        chunk_id: state.chunk_id,
                        updates,
                    };
                    self.analysis.clusters_updated(&update, commit_time).await?;
                }
                Ok(ChunkOutcome::Updated)
            }
        }
    }
}

/// Thousandths of the task's key range lying at or before `scanned_up_to`.
/// Never reports completion; only a finished scan does.
fn partial_progress(task: &ReclusteringTask, scanned_up_to: Option<ChunkId>) -> u32 {
    let Some(last) = scanned_up_to else {
        return 0;
    };
    let start = task.start_chunk_id.to_u128();
    let end = task.end_chunk_id.map_or(u128::MAX, |end| end.to_u128());
    if end <= start || last.to_u128() < start {
        return 0;
    }
    let span = end - start;
    let done = (last.to_u128() - start).saturating_add(1).min(span);
    // Scale both sides down until `done * 1000` fits in a u128.
    let shift = (u128::BITS - span.leading_zeros()).saturating_sub(u128::BITS - 10);
    let (done, span) = (done >> shift, (span >> shift).max(1));
    ((done * PROGRESS_COMPLETE as u128 / span) as u32).min(PROGRESS_COMPLETE - 1)
}
