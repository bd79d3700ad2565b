//! # Failure Normalization
//!
//! Turns the raw results of an ingested invocation, grouped by test variant,
//! into immutable [`Failure`]s. Only unexpected failing results survive, but
//! every result counts toward the ordering and blocking counters.

use crate::ingest::IngestOptions;
use crate::model::{
    ExonerationReason, ExonerationStatus, Failure, TestStatus, Variant,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// All results of one test variant within an ingested invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestVariant {
    pub test_id: String,
    pub variant: Variant,
    pub exonerations: Vec<ExonerationRecord>,
    pub results: Vec<TestResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExonerationRecord {
    pub reason: ExonerationReason,
    pub explanation: String,
}

/// A single execution of a test variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub result_id: String,
    /// The execution run (child invocation) that produced this result.
    pub run_id: String,
    pub status: TestStatus,
    pub expected: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub failure_reason: Option<String>,
}

impl TestResult {
    /// A pass, or any explicitly expected result other than a skip.
    fn is_pass(&self) -> bool {
        self.status == TestStatus::Pass || (self.expected && self.status != TestStatus::Skip)
    }
}

/// Normalize test variants into failures, preserving input order of variants
/// and start-time order of results within each variant.
pub fn failures_from_test_variants(options: &IngestOptions, variants: &[TestVariant]) -> Vec<Failure> {
    let mut failures = Vec::new();
    for variant in variants {
        failures_from_test_variant(options, variant, &mut failures);
    }
    failures
}

fn failures_from_test_variant(options: &IngestOptions, tv: &TestVariant, out: &mut Vec<Failure>) {
    let mut results: Vec<&TestResult> = tv.results.iter().collect();
    // Stable sort; results without a start time keep their relative order
    // ahead of timed ones.
    results.sort_by_key(|result| result.start_time);

    let has_pass = results.iter().any(|result| result.is_pass());
    let (runs, placement) = group_by_run(&results);
    let variant_hash = tv.variant.hash();

    let exoneration = if !tv.exonerations.is_empty() {
        ExonerationStatus::Explicit(tv.exonerations.iter().map(|e| e.reason).collect())
    } else if options.implicitly_exonerate_blocking_failures && !has_pass {
        ExonerationStatus::Implicit
    } else {
        ExonerationStatus::NotExonerated
    };

    for (index, result) in results.iter().enumerate() {
        if result.expected || !result.status.is_failure() {
            continue;
        }
        let (run_slot, run_index) = placement[index];
        let run = &runs[run_slot];

        out.push(Failure {
            chunk_index: 0,
            ingested_invocation_id: options.invocation_id.clone(),
            realm: options.realm.clone(),
            partition_time: options.partition_time,
            test_id: tv.test_id.clone(),
            variant: tv.variant.clone(),
            variant_hash: variant_hash.clone(),
            result_id: result.result_id.clone(),
            test_run_id: result.run_id.clone(),
            status: result.status,
            failure_reason: result.failure_reason.clone(),
            start_time: result.start_time,
            duration: result.duration,
            exoneration: exoneration.clone(),
            presubmit: options.presubmit.clone(),
            ingested_invocation_result_index: index as u32,
            ingested_invocation_result_count: results.len() as u32,
            is_ingested_invocation_blocked: !has_pass,
            test_run_result_index: run_index as u32,
            test_run_result_count: run.count as u32,
            is_test_run_blocked: !run.has_pass,
        });
    }
}

struct RunGroup<'a> {
    run_id: &'a str,
    count: usize,
    has_pass: bool,
}

/// Group sorted results by run. Returns the groups and, for each result, its
/// group slot and its index within that group.
fn group_by_run<'a>(results: &[&'a TestResult]) -> (Vec<RunGroup<'a>>, Vec<(usize, usize)>) {
    let mut runs: Vec<RunGroup<'a>> = Vec::new();
    let mut placement = Vec::with_capacity(results.len());
    for result in results {
        let slot = match runs.iter().position(|run| run.run_id == result.run_id) {
            Some(slot) => slot,
            None => {
                runs.push(RunGroup {
                    run_id: &result.run_id,
                    count: 0,
                    has_pass: false,
                });
                runs.len() - 1
            }
        };
        let run = &mut runs[slot];
        placement.push((slot, run.count));
        run.count += 1;
        run.has_pass |= result.is_pass();
    }
    (runs, placement)
}
