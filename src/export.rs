//! Shapes cluster membership deltas into denormalized export rows.
//!
//! One row is produced per `(cluster, failure)` pair touched by an update,
//! covering both clusters the failure left and clusters it is in. Rows carry
//! the commit time as `last_updated`; a consumer keeps the latest row per
//! pair.

use crate::analysis::{AnalysisSink, ClustersUpdate};
use crate::clustering::rules;
use crate::model::{ClusterSet, ExonerationReason, ExonerationStatus, TestStatus};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

/// Export row for one failure in one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusteredFailureRow {
    pub project: String,
    pub cluster_algorithm: String,
    pub cluster_id: String,
    pub chunk_id: String,
    pub chunk_index: u32,
    /// Whether the failure is currently in the cluster. False rows retract
    /// earlier memberships.
    pub is_included: bool,
    /// Included, and the cluster is the failure's best home: a rule cluster,
    /// or any cluster when no rule matched the failure.
    pub is_included_with_high_priority: bool,
    pub last_updated: DateTime<Utc>,

    pub partition_time: DateTime<Utc>,
    pub realm: String,
    pub ingested_invocation_id: String,
    pub test_id: String,
    pub variant: BTreeMap<String, String>,
    pub variant_hash: String,
    pub result_id: String,
    pub test_run_id: String,
    pub status: TestStatus,
    pub failure_reason: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub is_exonerated: bool,
    pub exoneration_reasons: Vec<ExonerationReason>,
    pub presubmit_run_id: Option<String>,
    pub presubmit_run_owner: Option<String>,
    pub ingested_invocation_result_index: u32,
    pub ingested_invocation_result_count: u32,
    pub is_ingested_invocation_blocked: bool,
    pub test_run_result_index: u32,
    pub test_run_result_count: u32,
    pub is_test_run_blocked: bool,
}

fn has_rule_cluster(set: &ClusterSet) -> bool {
    set.for_algorithm(rules::NAME).next().is_some()
}

/// Rows for every `(cluster, failure)` pair in `previous ∪ new` of each
/// failure update.
pub fn clustered_failure_rows(update: &ClustersUpdate, commit_time: DateTime<Utc>) -> Vec<ClusteredFailureRow> {
    let mut rows = Vec::new();
    for failure_update in &update.updates {
        let failure = &failure_update.failure;
        let new = &failure_update.new;
        let matched_rule = has_rule_cluster(new);

        let exoneration_reasons = match &failure.exoneration {
            ExonerationStatus::Explicit(reasons) => reasons.clone(),
            _ => Vec::new(),
        };

        let touched = new
            .iter()
            .chain(failure_update.removed().iter())
            .cloned()
            .collect::<Vec<_>>();
        for cluster in ClusterSet::new(touched).iter() {
            let is_included = new.contains(cluster);
            let is_included_with_high_priority =
                is_included && (cluster.algorithm == rules::NAME || !matched_rule);
            rows.push(ClusteredFailureRow {
                project: update.project.clone(),
                cluster_algorithm: cluster.algorithm.clone(),
                cluster_id: cluster.id.clone(),
                chunk_id: update.chunk_id.to_hex(),
                chunk_index: failure.chunk_index,
                is_included,
                is_included_with_high_priority,
                last_updated: commit_time,
                partition_time: failure.partition_time,
                realm: failure.realm.clone(),
                ingested_invocation_id: failure.ingested_invocation_id.clone(),
                test_id: failure.test_id.clone(),
                variant: failure.variant.0.clone(),
                variant_hash: failure.variant_hash.clone(),
                result_id: failure.result_id.clone(),
                test_run_id: failure.test_run_id.clone(),
                status: failure.status,
                failure_reason: failure.failure_reason.clone(),
                start_time: failure.start_time,
                duration_secs: failure.duration.map(|d| d.as_secs_f64()),
                is_exonerated: failure.exoneration.is_exonerated(),
                exoneration_reasons: exoneration_reasons.clone(),
                presubmit_run_id: failure.presubmit.as_ref().map(|p| p.run_id.clone()),
                presubmit_run_owner: failure.presubmit.as_ref().map(|p| p.owner.clone()),
                ingested_invocation_result_index: failure.ingested_invocation_result_index,
                ingested_invocation_result_count: failure.ingested_invocation_result_count,
                is_ingested_invocation_blocked: failure.is_ingested_invocation_blocked,
                test_run_result_index: failure.test_run_result_index,
                test_run_result_count: failure.test_run_result_count,
                is_test_run_blocked: failure.is_test_run_blocked,
            });
        }
    }
    rows
}

/// Destination of export rows.
#[async_trait]
pub trait RowWriter: Send + Sync {
    async fn write_rows(&self, rows: Vec<ClusteredFailureRow>) -> Result<()>;
}

/// Analysis sink that shapes updates into rows and hands them to a writer.
pub struct ExportSink {
    writer: Arc<dyn RowWriter>,
}

impl ExportSink {
    pub fn new(writer: Arc<dyn RowWriter>) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl AnalysisSink for ExportSink {
    async fn clusters_updated(&self, update: &ClustersUpdate, commit_time: DateTime<Utc>) -> Result<()> {
        let rows = clustered_failure_rows(update, commit_time);
        if rows.is_empty() {
            return Ok(());
        }
        self.writer.write_rows(rows).await
    }
}

/// Row writer that keeps rows in memory.
#[derive(Debug, Default)]
pub struct MemoryRowWriter {
    rows: Mutex<Vec<ClusteredFailureRow>>,
}

impl MemoryRowWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<ClusteredFailureRow> {
        self.rows.lock().clone()
    }
}

#[async_trait]
impl RowWriter for MemoryRowWriter {
    async fn write_rows(&self, rows: Vec<ClusteredFailureRow>) -> Result<()> {
        self.rows.lock().extend(rows);
        Ok(())
    }
}

/// Row writer emitting newline-delimited JSON.
pub struct JsonLinesWriter<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

#[async_trait]
impl<W: Write + Send> RowWriter for JsonLinesWriter<W> {
    async fn write_rows(&self, rows: Vec<ClusteredFailureRow>) -> Result<()> {
        let mut out = self.out.lock();
        for row in &rows {
            serde_json::to_writer(&mut *out, row)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        Ok(())
    }
}
