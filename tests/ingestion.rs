#[path = "../src/test_support.rs"]
mod test_support;

use failcluster::chunking::chunk_id;
use failcluster::clustering::{reason, rules as rules_algorithm, testname};
use failcluster::ingest::DeadlineExceeded;
use failcluster::model::{ClusterId, ExonerationStatus, TestStatus};
use failcluster::{AlgorithmRegistry, ALGORITHMS_VERSION};
use test_support::*;

#[tokio::test]
async fn single_failure_gets_test_name_and_reason_clusters() {
    let harness = Harness::new();
    let ingester = harness.ingester(AlgorithmRegistry::standard());
    let variants = vec![failing_variant("ninja://test_name/1", "Failure reason.")];

    let summary = ingester.ingest(&options("build-1234"), &variants).await.unwrap();
    assert_eq!(summary.failures, 1);
    assert_eq!(summary.chunks_written, 1);

    let state = harness.states.snapshot(PROJECT).pop().unwrap();
    assert_eq!(state.chunk_id, chunk_id("build-1234", 0));
    assert_eq!(state.results.algorithms_version, ALGORITHMS_VERSION);
    let clusters: Vec<ClusterId> = state.results.clusters[0].iter().cloned().collect();
    assert_eq!(
        clusters,
        vec![
            ClusterId::new(reason::NAME, "5b4886907ba205f9ee2d8815452cb6e7"),
            ClusterId::new(testname::NAME, "13d1df0296adafcf0ff286097537f502"),
        ]
    );

    let notifications = harness.analysis.notifications();
    assert_eq!(notifications.len(), 1);
    let (update, commit_time) = &notifications[0];
    assert_eq!(*commit_time, state.last_updated);
    let failure = &update.updates[0].failure;
    assert!(failure.is_ingested_invocation_blocked);
    assert_eq!(failure.ingested_invocation_result_index, 0);
    assert_eq!(failure.ingested_invocation_result_count, 1);
    assert!(update.updates[0].previous.is_empty());
}

#[tokio::test]
async fn ingesting_twice_is_idempotent() {
    let harness = Harness::new();
    let ingester = harness.ingester(AlgorithmRegistry::standard());
    let variants = generate_variants(2500, 7);

    let first = ingester.ingest(&options("build-1"), &variants).await.unwrap();
    assert_eq!(first.chunks_written, 3);
    let snapshot = harness.states.snapshot(PROJECT);
    let notified = harness.analysis.len();
    let objects = harness.blobs.object_count();
    assert_eq!(notified, 3);

    let second = ingester.ingest(&options("build-1"), &variants).await.unwrap();
    assert_eq!(second.chunks_written, 0);
    assert_eq!(second.chunks_skipped, 3);
    assert_eq!(harness.states.snapshot(PROJECT), snapshot);
    assert_eq!(harness.analysis.len(), notified);
    assert_eq!(harness.blobs.object_count(), objects);
}

#[tokio::test]
async fn concurrent_duplicate_ingestion_notifies_once_per_chunk() {
    let harness = Harness::new();
    let left = harness.ingester(AlgorithmRegistry::standard());
    let right = harness.ingester(AlgorithmRegistry::standard());
    let variants = generate_variants(1200, 11);
    let options = options("build-dup");

    let (a, b) = tokio::join!(left.ingest(&options, &variants), right.ingest(&options, &variants));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.chunks_written + b.chunks_written, 2);
    assert_eq!(a.chunks_skipped + b.chunks_skipped, 2);
    assert_eq!(harness.states.len(), 2);
    assert_eq!(harness.analysis.len(), 2);
}

#[tokio::test]
async fn chunk_ids_are_distinct_per_page_and_stable() {
    assert_eq!(chunk_id("build-1234", 0), chunk_id("build-1234", 0));
    let ids: std::collections::BTreeSet<_> = (0..500).map(|page| chunk_id("build-1234", page)).collect();
    assert_eq!(ids.len(), 500);
    assert_eq!(chunk_id("build-1234", 1).to_hex(), "1a62eb1feca9c679d497e3578337602a");
}

#[tokio::test]
async fn deadline_stops_ingestion_and_retry_resumes() {
    let harness = Harness::new();
    let ingester = harness.ingester(AlgorithmRegistry::standard());
    let variants = generate_variants(2100, 3);

    let expired = options("build-late").with_deadline(chrono::Utc::now() - chrono::Duration::seconds(5));
    let err = ingester.ingest(&expired, &variants).await.unwrap_err();
    assert!(err.downcast_ref::<DeadlineExceeded>().is_some());
    assert!(harness.states.is_empty());

    let summary = ingester.ingest(&options("build-late"), &variants).await.unwrap();
    assert_eq!(summary.chunks_written, 3);
}

#[tokio::test]
async fn rules_in_force_at_ingestion_are_applied() {
    let harness = Harness::new();
    harness
        .provider
        .upsert(rule("timeouts", r#"reason LIKE "timeout%""#, day(1)));
    let ingester = harness.ingester(AlgorithmRegistry::standard());
    let variants = vec![
        failing_variant("ninja://a", "timeout after 30s"),
        failing_variant("ninja://b", "assertion failed"),
    ];
    ingester.ingest(&options("build-rules"), &variants).await.unwrap();

    let state = harness.states.snapshot(PROJECT).pop().unwrap();
    assert_eq!(state.results.rules_version.timestamp(), day(1));
    let rule_cluster = ClusterId::new(rules_algorithm::NAME, "timeouts");
    assert!(state.results.clusters[0].contains(&rule_cluster));
    assert!(!state.results.clusters[1].contains(&rule_cluster));
}

#[tokio::test]
async fn passing_results_block_nothing_and_are_not_ingested() {
    let harness = Harness::new();
    let ingester = harness.ingester(AlgorithmRegistry::standard());
    let flaky = variant(
        "ninja://flaky",
        vec![
            result("r0", "run-0", TestStatus::Fail, false, Some("flaked")),
            result("r1", "run-0", TestStatus::Pass, true, None),
        ],
    );
    let mut opts = options("build-flaky");
    opts.implicitly_exonerate_blocking_failures = true;
    let summary = ingester.ingest(&opts, &[flaky]).await.unwrap();
    assert_eq!(summary.failures, 1);

    let (update, _) = harness.analysis.notifications().pop().unwrap();
    let failure = &update.updates[0].failure;
    assert!(!failure.is_ingested_invocation_blocked);
    assert!(!failure.is_test_run_blocked);
    assert_eq!(failure.ingested_invocation_result_count, 2);
    assert_eq!(failure.exoneration, ExonerationStatus::NotExonerated);
}
