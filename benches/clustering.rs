//! Throughput benchmarks for normalization, chunking and clustering.

use chrono::{TimeZone, Utc};
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use failcluster::chunking::chunk_failures;
use failcluster::clustering::reason;
use failcluster::failures::{failures_from_test_variants, TestResult, TestVariant};
use failcluster::model::{ClusterResults, TestStatus, Variant};
use failcluster::{AlgorithmRegistry, IngestOptions, RuleDefinition, Ruleset};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;
use std::time::Duration;

fn variants(count: usize, seed: u64) -> Vec<TestVariant> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|i| TestVariant {
            test_id: format!("ninja://suite_{}/test_{i}", rng.random_range(0..50)),
            variant: Variant::from_pairs([("builder", "linux-rel")]),
            exonerations: Vec::new(),
            results: vec![TestResult {
                result_id: "r0".to_string(),
                run_id: "run-0".to_string(),
                status: TestStatus::Fail,
                expected: false,
                start_time: None,
                duration: Some(Duration::from_millis(rng.random_range(10..5000))),
                failure_reason: Some(format!(
                    "timeout after {}s at 0x{:08x}",
                    rng.random_range(1..600),
                    rng.random::<u32>()
                )),
            }],
        })
        .collect()
}

fn options() -> IngestOptions {
    IngestOptions::new(
        "bench",
        "bench:ci",
        "build-1",
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    )
}

fn definitions(rule_count: usize) -> Vec<RuleDefinition> {
    (0..rule_count)
        .map(|i| RuleDefinition {
            project: "bench".to_string(),
            rule_id: format!("rule-{i}"),
            predicate: format!(r#"test LIKE "ninja://suite_{i}/%" OR reason LIKE "timeout after {i}s%""#),
            is_active: true,
            predicate_last_updated: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        })
        .collect()
}

fn ruleset(rule_count: usize) -> Ruleset {
    Ruleset::new("bench", definitions(rule_count))
}

fn bench_normalize_and_chunk(c: &mut Criterion) {
    let mut group = c.benchmark_group("normalize_and_chunk");
    for &count in &[1_000usize, 10_000] {
        let input = variants(count, 1);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &input, |b, input| {
            b.iter(|| chunk_failures(failures_from_test_variants(&options(), black_box(input))))
        });
    }
    group.finish();
}

fn bench_cluster_chunk(c: &mut Criterion) {
    let mut group = c.benchmark_group("cluster_chunk");
    group.sample_size(30);
    let chunk = chunk_failures(failures_from_test_variants(&options(), &variants(1000, 2)))
        .into_iter()
        .next()
        .unwrap();
    let registry = AlgorithmRegistry::standard();
    group.throughput(Throughput::Elements(chunk.len() as u64));

    for &rules in &[0usize, 10, 100] {
        let ruleset = ruleset(rules);
        group.bench_with_input(BenchmarkId::new("fresh", rules), &ruleset, |b, ruleset| {
            b.iter(|| registry.cluster(ruleset, &ClusterResults::unclustered(chunk.len()), black_box(&chunk.failures)))
        });
    }

    // Reclustering with one new rule re-evaluates only that rule.
    let before = ruleset(100);
    let existing = registry.cluster(&before, &ClusterResults::unclustered(chunk.len()), &chunk.failures);
    let mut updated_rules = definitions(100);
    updated_rules.push(RuleDefinition {
        project: "bench".to_string(),
        rule_id: "rule-new".to_string(),
        predicate: r#"reason LIKE "%0x0%""#.to_string(),
        is_active: true,
        predicate_last_updated: Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
    });
    let after = Ruleset::new("bench", updated_rules);
    assert!(after.version() > before.version());
    group.bench_function("incremental_one_new_rule", |b| {
        b.iter_batched(
            || existing.clone(),
            |existing| registry.cluster(&after, &existing, black_box(&chunk.failures)),
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

fn bench_reason_pattern(c: &mut Criterion) {
    let reasons: Vec<String> = variants(1000, 3)
        .into_iter()
        .filter_map(|v| v.results[0].failure_reason.clone())
        .collect();
    c.bench_function("reason_pattern", |b| {
        b.iter(|| {
            for reason_text in &reasons {
                black_box(reason::pattern(reason_text));
            }
        })
    });
}

criterion_group!(benches, bench_normalize_and_chunk, bench_cluster_chunk, bench_reason_pattern);
criterion_main!(benches);
