//! # Clustering Algorithms
//!
//! A closed set of algorithms maps each failure to zero or more cluster ids.
//! An [`AlgorithmRegistry`] names the algorithms a process runs and the
//! algorithms version they jointly represent; it is constructed explicitly
//! and passed to the ingester and the reclustering worker.

pub mod reason;
pub mod rules;
pub mod testname;

use crate::model::{ClusterId, ClusterResults, ClusterSet, Failure};
use crate::rules::Ruleset;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Version of the standard algorithm set. Bumped whenever any algorithm
/// changes what it produces, which also changes that algorithm's name.
pub const ALGORITHMS_VERSION: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    TestName,
    FailureReason,
    Rules,
}

impl Algorithm {
    pub const ALL: [Algorithm; 3] = [Algorithm::TestName, Algorithm::FailureReason, Algorithm::Rules];

    pub fn name(self) -> &'static str {
        match self {
            Algorithm::TestName => testname::NAME,
            Algorithm::FailureReason => reason::NAME,
            Algorithm::Rules => rules::NAME,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|algorithm| algorithm.name() == name)
    }

    /// Suggested algorithms derive clusters from the failure alone; the
    /// rules algorithm depends on the ruleset.
    pub fn is_suggested(self) -> bool {
        !matches!(self, Algorithm::Rules)
    }

    /// Clusters this algorithm assigns to the failure.
    pub fn cluster(self, ruleset: &Ruleset, failure: &Failure) -> Vec<ClusterId> {
        let ids = match self {
            Algorithm::TestName => testname::cluster(failure).into_iter().collect(),
            Algorithm::FailureReason => reason::cluster(failure).into_iter().collect(),
            Algorithm::Rules => rules::cluster(ruleset, failure),
        };
        ids.into_iter()
            .map(|id| ClusterId::new(self.name(), id))
            .collect()
    }
}

/// The algorithms run by this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmRegistry {
    algorithms: Vec<Algorithm>,
    version: i64,
}

impl AlgorithmRegistry {
    pub fn new(algorithms: impl IntoIterator<Item = Algorithm>, version: i64) -> Self {
        let mut algorithms: Vec<Algorithm> = algorithms.into_iter().collect();
        algorithms.sort();
        algorithms.dedup();
        Self { algorithms, version }
    }

    /// Every algorithm at [`ALGORITHMS_VERSION`].
    pub fn standard() -> Self {
        Self::new(Algorithm::ALL, ALGORITHMS_VERSION)
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn algorithms(&self) -> &[Algorithm] {
        &self.algorithms
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.algorithms
            .iter()
            .map(|algorithm| algorithm.name().to_string())
            .collect()
    }

    /// Cluster a chunk's failures, reusing `existing` results where they are
    /// still valid.
    ///
    /// Output of a suggested algorithm named in `existing.algorithms` is kept
    /// verbatim. Rule matches are kept for rules unchanged since
    /// `existing.rules_version`, and only rules updated after it are
    /// evaluated. Clusters of algorithms not in this registry are dropped.
    /// Pass [`ClusterResults::unclustered`] to cluster from scratch.
    pub fn cluster(&self, ruleset: &Ruleset, existing: &ClusterResults, failures: &[Failure]) -> ClusterResults {
        let empty = ClusterSet::empty();
        let clusters = failures
            .iter()
            .enumerate()
            .map(|(index, failure)| {
                let previous = existing.clusters.get(index);
                let mut ids = Vec::new();
                for &algorithm in &self.algorithms {
                    let name = algorithm.name();
                    let reusable = existing.algorithms.contains(name) && previous.is_some();
                    match algorithm {
                        Algorithm::Rules if reusable => {
                            let previous = previous.unwrap_or(&empty);
                            ids.extend(
                                rules::cluster_incremental(ruleset, existing.rules_version, previous, failure)
                                    .into_iter()
                                    .map(|id| ClusterId::new(name, id)),
                            );
                        }
                        _ if reusable && algorithm.is_suggested() => {
                            let previous = previous.unwrap_or(&empty);
                            ids.extend(previous.for_algorithm(name).cloned());
                        }
                        _ => ids.extend(algorithm.cluster(ruleset, failure)),
                    }
                }
                ClusterSet::new(ids)
            })
            .collect();

        ClusterResults {
            algorithms_version: self.version,
            rules_version: ruleset.version(),
            algorithms: self.names(),
            clusters,
        }
    }
}

impl Default for AlgorithmRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Hex rendering of the first 16 bytes of SHA-256 of `value`.
pub(crate) fn hash_id(value: &str) -> String {
    hex::encode(&Sha256::digest(value.as_bytes())[..16])
}
