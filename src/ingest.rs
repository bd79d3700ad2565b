//! # Ingestion
//!
//! Turns the test results of one invocation into chunks, stores their
//! content, clusters them and creates one clustering state row per chunk.
//!
//! Ingestion is safe to retry at invocation granularity: chunk ids are
//! derived from `(invocation, page)`, and a chunk whose state row already
//! exists is skipped.

use crate::analysis::{diff_results, AnalysisSink, ClustersUpdate};
use crate::chunking::{chunk_failures, chunk_id};
use crate::clustering::AlgorithmRegistry;
use crate::config::IngestionConfig;
use crate::failures::{failures_from_test_variants, TestVariant};
use crate::model::{ClusterResults, ClusteringState, PresubmitContext};
use crate::rules::RulesetCache;
use crate::store::{BlobStore, CreateOutcome, StateStore};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Describes the invocation being ingested.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOptions {
    pub project: String,
    pub realm: String,
    pub invocation_id: String,
    pub partition_time: DateTime<Utc>,
    pub presubmit: Option<PresubmitContext>,
    pub implicitly_exonerate_blocking_failures: bool,
    /// Ingestion stops before the next chunk once this time has passed.
    pub deadline: Option<DateTime<Utc>>,
}

impl IngestOptions {
    pub fn new(
        project: impl Into<String>,
        realm: impl Into<String>,
        invocation_id: impl Into<String>,
        partition_time: DateTime<Utc>,
    ) -> Self {
        Self {
            project: project.into(),
            realm: realm.into(),
            invocation_id: invocation_id.into(),
            partition_time,
            presubmit: None,
            implicitly_exonerate_blocking_failures: false,
            deadline: None,
        }
    }

    /// Apply the configured ingestion policy.
    pub fn with_config(mut self, config: &IngestionConfig) -> Self {
        self.implicitly_exonerate_blocking_failures = config.implicitly_exonerate_blocking_failures;
        self
    }

    pub fn with_presubmit(mut self, presubmit: PresubmitContext) -> Self {
        self.presubmit = Some(presubmit);
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Outcome of a completed ingestion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub failures: usize,
    pub chunks_written: usize,
    /// Chunks some earlier or concurrent attempt had already ingested.
    pub chunks_skipped: usize,
}

/// Ingestion stopped at its deadline. Chunks before `next_page` are
/// committed; retrying the ingestion resumes after them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlineExceeded {
    pub invocation_id: String,
    pub next_page: usize,
}

impl fmt::Display for DeadlineExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "deadline exceeded ingesting invocation {} before page {}",
            self.invocation_id, self.next_page
        )
    }
}

impl std::error::Error for DeadlineExceeded {}

pub struct Ingester {
    registry: Arc<AlgorithmRegistry>,
    rules: Arc<RulesetCache>,
    states: Arc<dyn StateStore>,
    blobs: Arc<dyn BlobStore>,
    analysis: Arc<dyn AnalysisSink>,
}

impl Ingester {
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
        }
    }

    /// Ingest the test variants of one invocation.
    ///
    /// The first store or sink error aborts; chunks committed before it stay
    /// committed. A passed deadline aborts with [`DeadlineExceeded`].
    #[instrument(
        skip(self, options, test_variants),
        fields(project = %options.project, invocation = %options.invocation_id),
        level = "debug"
    )]
    pub async fn ingest(&self, options: &IngestOptions, test_variants: &[TestVariant]) -> Result<IngestSummary> {
        let failures = failures_from_test_variants(options, test_variants);
        let mut summary = IngestSummary {
            failures: failures.len(),
            ..IngestSummary::default()
        };
        let chunks = chunk_failures(failures);
        if chunks.is_empty() {
            return Ok(summary);
        }

        let ruleset = self.rules.ruleset(&options.project, None).await?;

        for (page, chunk) in chunks.into_iter().enumerate() {
            if let Some(deadline) = options.deadline {
                if Utc::now() >= deadline {
                    return Err(DeadlineExceeded {
                        invocation_id: options.invocation_id.clone(),
                        next_page: page,
                    }
                    .into());
                }
            }

            let id = chunk_id(&options.invocation_id, page);
            if self.states.read(&options.project, id).await?.is_some() {
                debug!(chunk = %id, page, "chunk already ingested");
                summary.chunks_skipped += 1;
                continue;
            }

            let object_id = self.blobs.put(&options.project, &chunk).await?;
            let results = self
                .registry
                .cluster(&ruleset, &ClusterResults::unclustered(chunk.len()), &chunk.failures);
            let state = ClusteringState {
                project: options.project.clone(),
                chunk_id: id,
                object_id,
                partition_time: options.partition_time,
                results,
                last_updated: DateTime::<Utc>::MIN_UTC,
            };
            let updates = diff_results(&[], &state.results.clusters, &chunk.failures);

            match self.states.create(state).await? {
                CreateOutcome::AlreadyExists => {
                    debug!(chunk = %id, page, "chunk ingested concurrently");
                    summary.chunks_skipped += 1;
                }
                CreateOutcome::Created { commit_time } => {
                    summary.chunks_written += 1;
                    if !updates.is_empty() {
                        let update = ClustersUpdate {
                            project: options.project.clone(),
                            chunk_id: id,
                            updates,
                        };
                        self.analysis.clusters_updated(&update, commit_time).await?;
                    }
                }
            }
        }

        info!(
            failures = summary.failures,
            written = summary.chunks_written,
            skipped = summary.chunks_skipped,
            "ingested invocation"
        );
        Ok(summary)
    }
}
