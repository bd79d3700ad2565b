//! # failcluster
//!
//! Versioned clustering of test failures.
//!
//! Failures of an invocation are normalized, split into chunks and assigned
//! to clusters by a set of versioned algorithms and user-authored rules. The
//! per-chunk clustering state is created once at ingestion and afterwards
//! only advanced by reclustering workers through compare-and-swap, so
//! ingestion is idempotent and concurrent writers never corrupt state.
//! Every committed membership change is published to an [`AnalysisSink`].

pub mod analysis;
pub mod chunking;
pub mod clustering;
pub mod config;
pub mod export;
pub mod failures;
pub mod ingest;
pub mod model;
pub mod persistence;
pub mod reclustering;
pub mod rules;
pub mod store;

#[cfg(test)]
mod test_fixtures;

// Re-export main types for convenience
pub use analysis::{AnalysisSink, ClustersUpdate, FailureUpdate, MemoryAnalysisSink};
pub use clustering::{Algorithm, AlgorithmRegistry, ALGORITHMS_VERSION};
pub use config::ClusteringConfig;
pub use failures::{ExonerationRecord, TestResult, TestVariant};
pub use ingest::{IngestOptions, IngestSummary, Ingester};
pub use model::{Chunk, ChunkId, ClusterId, ClusterResults, ClusterSet, ClusteringState, Failure, RulesVersion};
pub use persistence::PersistentStore;
pub use reclustering::{ReclusteringRun, ReclusteringTask, ShardProgress, Worker};
pub use rules::{MemoryRuleProvider, RuleDefinition, RuleProvider, Ruleset, RulesetCache};
pub use store::{BlobStore, MemoryBlobStore, MemoryStateStore, StateStore};
