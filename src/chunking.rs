//! Deterministic partitioning of an invocation's failures into chunks.

use crate::model::{Chunk, ChunkId, Failure, CHUNK_ID_BYTES};
use sha2::{Digest, Sha256};

/// Maximum number of failures per chunk.
pub const CHUNK_SIZE: usize = 1000;

/// Split failures into consecutive pages of `CHUNK_SIZE`, the last page
/// possibly shorter, and stamp each failure with its index in its chunk.
pub fn chunk_failures(failures: Vec<Failure>) -> Vec<Chunk> {
    let mut chunks = Vec::with_capacity(failures.len().div_ceil(CHUNK_SIZE));
    let mut current = Vec::with_capacity(CHUNK_SIZE.min(failures.len()));
    for mut failure in failures {
        failure.chunk_index = current.len() as u32;
        current.push(failure);
        if current.len() == CHUNK_SIZE {
            chunks.push(Chunk {
                failures: std::mem::take(&mut current),
            });
        }
    }
    if !current.is_empty() {
        chunks.push(Chunk { failures: current });
    }
    chunks
}

/// Identifier of page `page` of an ingested invocation.
///
/// Stable across processes: re-ingesting an invocation maps each page to the
/// same id, and SHA-256 spreads ids uniformly over the keyspace.
pub fn chunk_id(invocation_id: &str, page: usize) -> ChunkId {
    let digest = Sha256::digest(format!("{invocation_id}/{page}").as_bytes());
    let mut id = [0u8; CHUNK_ID_BYTES];
    id.copy_from_slice(&digest[..CHUNK_ID_BYTES]);
    ChunkId(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExonerationStatus, TestStatus, Variant};
    use chrono::Utc;

    fn failure(n: usize) -> Failure {
        Failure {
            chunk_index: u32::MAX,
            ingested_invocation_id: "build-1234".to_string(),
            realm: "chromium:ci".to_string(),
            partition_time: Utc::now(),
            test_id: format!("ninja://test/{n}"),
            variant: Variant::default(),
            variant_hash: Variant::default().hash(),
            result_id: format!("result-{n}"),
            test_run_id: "run-1".to_string(),
            status: TestStatus::Fail,
            failure_reason: None,
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

    #[test]
    fn empty_input_has_no_chunks() {
        assert!(chunk_failures(Vec::new()).is_empty());
    }

    #[test]
    fn pages_are_full_except_the_last() {
        let failures: Vec<Failure> = (0..2500).map(failure).collect();
        let chunks = chunk_failures(failures);
        let sizes: Vec<usize> = chunks.iter().map(Chunk::len).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);

        for chunk in &chunks {
            for (index, failure) in chunk.failures.iter().enumerate() {
                assert_eq!(failure.chunk_index as usize, index);
            }
        }
        assert_eq!(chunks[1].failures[0].test_id, "ninja://test/1000");
        assert_eq!(chunks[2].failures[499].test_id, "ninja://test/2499");
    }

    #[test]
    fn exact_multiple_has_no_trailing_chunk() {
        let chunks = chunk_failures((0..CHUNK_SIZE).map(failure).collect());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), CHUNK_SIZE);
    }

    #[test]
    fn chunking_is_deterministic() {
        let first = chunk_failures((0..1200).map(failure).collect());
        let second = chunk_failures((0..1200).map(failure).collect());
        assert_eq!(
            first.iter().map(|c| c.failures.len()).collect::<Vec<_>>(),
            second.iter().map(|c| c.failures.len()).collect::<Vec<_>>()
        );
        assert_eq!(first[1].failures[3].test_id, second[1].failures[3].test_id);
    }

    #[test]
    fn chunk_id_is_stable() {
        assert_eq!(
            chunk_id("build-1234", 0).to_hex(),
            "e78193edb8d1cea5fd1e1b53317714eb"
        );
        assert_eq!(
            chunk_id("build-1234", 1).to_hex(),
            "1a62eb1feca9c679d497e3578337602a"
        );
        assert_eq!(chunk_id("build-1234", 7), chunk_id("build-1234", 7));
    }

    #[test]
    fn chunk_ids_do_not_collide_across_pages() {
        let mut seen = std::collections::HashSet::new();
        for page in 0..10_000 {
            assert!(seen.insert(chunk_id("build-1234", page)));
        }
        assert_ne!(chunk_id("build-1234", 0), chunk_id("build-1235", 0));
    }
}
