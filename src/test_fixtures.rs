//! Failure builders for unit tests.

use crate::model::{ExonerationStatus, Failure, TestStatus, Variant};
use chrono::{TimeZone, Utc};

pub fn failure(test_id: &str, reason: Option<&str>) -> Failure {
    let variant = Variant::from_pairs([("builder", "linux-rel")]);
    Failure {
        chunk_index: 0,
        ingested_invocation_id: "build-1".to_string(),
        realm: "chromium:ci".to_string(),
        partition_time: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        test_id: test_id.to_string(),
        variant_hash: variant.hash(),
        variant,
        result_id: "result-1".to_string(),
        test_run_id: "run-1".to_string(),
        status: TestStatus::Fail,
        failure_reason: reason.map(str::to_string),
        start_time: None,
        duration: None,
        exoneration: ExonerationStatus::NotExonerated,
        presubmit: None,
        ingested_invocation_result_index: 0,
        ingested_invocation_result_count: 1,
        is_ingested_invocation_blocked: true,
        test_run_result_index: 0,
        test_run_result_count: 1,
        is_test_run_blocked: true,
    }
}
