#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use failcluster::config::ReclusteringConfig;
use failcluster::failures::{ExonerationRecord, TestResult, TestVariant};
use failcluster::model::{ChunkId, RulesVersion, TestStatus, Variant};
use failcluster::reclustering::ReclusteringTask;
use failcluster::{
    AlgorithmRegistry, AnalysisSink, BlobStore, IngestOptions, Ingester, MemoryAnalysisSink, MemoryBlobStore, MemoryRuleProvider,
    MemoryStateStore, RuleDefinition, RulesetCache, StateStore, Worker,
};

pub const PROJECT: &str = "chromium";

/// In-memory collaborators shared by an ingester and its workers.
pub struct Harness {
    pub provider: Arc<MemoryRuleProvider>,
    pub rules: Arc<RulesetCache>,
    pub states: Arc<MemoryStateStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub analysis: Arc<MemoryAnalysisSink>,
}

impl Harness {
    pub fn new() -> Self {
        let provider = Arc::new(MemoryRuleProvider::new());
        // Zero refresh interval: every unconstrained lookup sees the latest rules.
        let rules = Arc::new(RulesetCache::new(provider.clone(), 16, Duration::ZERO));
        Self {
            provider,
            rules,
            states: Arc::new(MemoryStateStore::new()),
            blobs: Arc::new(MemoryBlobStore::new()),
            analysis: Arc::new(MemoryAnalysisSink::new()),
        }
    }

    pub fn ingester(&self, registry: AlgorithmRegistry) -> Ingester {
        self.ingester_with_stores(registry, self.states.clone(), self.blobs.clone())
    }

    pub fn ingester_with_stores(
        &self,
        registry: AlgorithmRegistry,
        states: Arc<dyn StateStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Ingester {
        Ingester::new(
            Arc::new(registry),
            self.rules.clone(),
            states,
            blobs,
            self.analysis.clone(),
        )
    }

    pub fn worker(&self, registry: AlgorithmRegistry) -> Worker {
        self.worker_with_stores(registry, self.states.clone(), self.blobs.clone())
    }

    pub fn worker_with_stores(
        &self,
        registry: AlgorithmRegistry,
        states: Arc<dyn StateStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Worker {
        self.worker_with_parts(registry, states, blobs, self.analysis.clone())
    }

    pub fn worker_with_parts(
        &self,
        registry: AlgorithmRegistry,
        states: Arc<dyn StateStore>,
        blobs: Arc<dyn BlobStore>,
        analysis: Arc<dyn AnalysisSink>,
    ) -> Worker {
        let config = ReclusteringConfig {
            batch_size: 3,
            max_concurrent_chunks: 2,
            ..ReclusteringConfig::default()
        };
        Worker::new(
            Arc::new(registry),
            self.rules.clone(),
            states,
            blobs,
            analysis,
        )
        .with_config(&config)
    }
}

pub fn partition_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
}

pub fn options(invocation_id: &str) -> IngestOptions {
    IngestOptions::new(PROJECT, "chromium:ci", invocation_id, partition_time())
}

pub fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 7, d, 0, 0, 0).unwrap()
}

pub fn rule(id: &str, predicate: &str, updated: DateTime<Utc>) -> RuleDefinition {
    RuleDefinition {
        project: PROJECT.to_string(),
        rule_id: id.to_string(),
        predicate: predicate.to_string(),
        is_active: true,
        predicate_last_updated: updated,
    }
}

pub fn result(id: &str, run: &str, status: TestStatus, expected: bool, reason: Option<&str>) -> TestResult {
    TestResult {
        result_id: id.to_string(),
        run_id: run.to_string(),
        status,
        expected,
        start_time: None,
        duration: Some(Duration::from_millis(1500)),
        failure_reason: reason.map(str::to_string),
    }
}

pub fn variant(test_id: &str, results: Vec<TestResult>) -> TestVariant {
    TestVariant {
        test_id: test_id.to_string(),
        variant: Variant::from_pairs([("builder", "linux-rel"), ("os", "Ubuntu-22.04")]),
        exonerations: Vec::<ExonerationRecord>::new(),
        results,
    }
}

pub fn failing_variant(test_id: &str, reason: &str) -> TestVariant {
    variant(test_id, vec![result("r0", "run-0", TestStatus::Fail, false, Some(reason))])
}

/// Seeded test variants, each with one unexpected failure.
pub fn generate_variants(count: usize, seed: u64) -> Vec<TestVariant> {
    let mut rng = StdRng::seed_from_u64(seed);
    let reasons = [
        "timeout after {}s waiting for renderer",
        "assertion failed: expected {} got 0",
        "segfault at address 0x7ffd{}beef",
        "Failure reason.",
    ];
    (0..count)
        .map(|i| {
            let suite = rng.random_range(0..20);
            let template = reasons[rng.random_range(0..reasons.len())];
            let reason = template.replace("{}", &rng.random_range(1..10_000).to_string());
            failing_variant(&format!("ninja://suite_{suite}/test_{i}"), &reason)
        })
        .collect()
}

/// A task covering the whole keyspace.
pub fn full_range_task(
    deadline: DateTime<Utc>,
    algorithms_version: i64,
    rules_version: RulesVersion,
) -> ReclusteringTask {
    ReclusteringTask {
        project: PROJECT.to_string(),
        attempt_deadline: deadline,
        start_chunk_id: ChunkId::MIN,
        end_chunk_id: None,
        algorithms_version,
        rules_version,
    }
}

pub fn far_future() -> DateTime<Utc> {
    Utc::now() + chrono::Duration::hours(1)
}
