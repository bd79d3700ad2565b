//! # Data Model
//!
//! Core data structures for failure clustering: chunk and object identifiers,
//! cluster identifiers and sets, version stamps, failures, and the per-chunk
//! clustering state that is the single source of truth for cluster membership.

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

/// Number of bytes in a chunk identifier.
pub const CHUNK_ID_BYTES: usize = 16;

/// Identifier of a chunk: a 128-bit prefix of a SHA-256 digest.
///
/// Ordering is byte-wise, which equals both the numeric order of the 128-bit
/// value and the lexicographic order of the hex rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(pub [u8; CHUNK_ID_BYTES]);

impl ChunkId {
    /// The smallest possible chunk identifier.
    pub const MIN: ChunkId = ChunkId([0; CHUNK_ID_BYTES]);
    /// The largest possible chunk identifier.
    pub const MAX: ChunkId = ChunkId([0xff; CHUNK_ID_BYTES]);

    pub fn from_u128(value: u128) -> Self {
        ChunkId(value.to_be_bytes())
    }

    pub fn to_u128(&self) -> u128 {
        u128::from_be_bytes(self.0)
    }

    /// The identifier immediately after this one, if any.
    pub fn successor(&self) -> Option<ChunkId> {
        self.to_u128().checked_add(1).map(ChunkId::from_u128)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 32-character hex rendering.
    pub fn parse_hex(value: &str) -> Result<Self> {
        let mut bytes = [0u8; CHUNK_ID_BYTES];
        hex::decode_to_slice(value, &mut bytes).map_err(|err| anyhow!("invalid chunk id {value:?}: {err}"))?;
        Ok(ChunkId(bytes))
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Reference to chunk content held by the blob store.
///
/// Always freshly generated and never derived from content, so references
/// cannot be guessed from a chunk id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub String);

impl ObjectId {
    pub fn generate() -> Self {
        ObjectId(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a cluster: the algorithm that produced it and an id opaque to
/// everyone but that algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId {
    pub algorithm: String,
    pub id: String,
}

impl ClusterId {
    pub fn new(algorithm: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.id)
    }
}

/// A set of cluster ids held in canonical order (algorithm, then id), with no
/// duplicates. Equality is therefore independent of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterSet(Vec<ClusterId>);

impl ClusterSet {
    pub fn new(ids: impl IntoIterator<Item = ClusterId>) -> Self {
        let mut ids: Vec<ClusterId> = ids.into_iter().collect();
        ids.sort();
        ids.dedup();
        Self(ids)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ClusterId> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: &ClusterId) -> bool {
        self.0.binary_search(id).is_ok()
    }

    /// Ids produced by a single algorithm.
    pub fn for_algorithm<'a>(&'a self, algorithm: &'a str) -> impl Iterator<Item = &'a ClusterId> {
        self.0.iter().filter(move |id| id.algorithm == algorithm)
    }

    /// Ids in `self` that are not in `other`, in canonical order.
    pub fn difference(&self, other: &ClusterSet) -> Vec<ClusterId> {
        self.0
            .iter()
            .filter(|id| !other.contains(id))
            .cloned()
            .collect()
    }

    pub fn as_slice(&self) -> &[ClusterId] {
        &self.0
    }
}

impl<'a> IntoIterator for &'a ClusterSet {
    type Item = &'a ClusterId;
    type IntoIter = std::slice::Iter<'a, ClusterId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Version of a project's rules: the last time any rule predicate changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RulesVersion(pub DateTime<Utc>);

impl RulesVersion {
    /// Version of a project that has never had rules.
    pub fn starting_epoch() -> Self {
        RulesVersion(
            Utc.with_ymd_and_hms(1900, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        )
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.0
    }
}

impl fmt::Display for RulesVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// The stamp compared by optimistic-concurrency writes to a clustering state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionStamp {
    pub algorithms_version: i64,
    pub rules_version: RulesVersion,
    pub last_updated: DateTime<Utc>,
}

/// Clusters assigned to each failure of a chunk plus the versions that
/// produced them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterResults {
    pub algorithms_version: i64,
    pub rules_version: RulesVersion,
    /// Names of the algorithms whose output is contained in `clusters`.
    pub algorithms: BTreeSet<String>,
    /// One set per failure, indexed by the failure's position in the chunk.
    pub clusters: Vec<ClusterSet>,
}

impl ClusterResults {
    /// Results that no algorithm has contributed to yet.
    pub fn unclustered(failure_count: usize) -> Self {
        Self {
            algorithms_version: 0,
            rules_version: RulesVersion::starting_epoch(),
            algorithms: BTreeSet::new(),
            clusters: vec![ClusterSet::empty(); failure_count],
        }
    }

    /// True if these results were produced by at least the given versions.
    pub fn is_at_least(&self, algorithms_version: i64, rules_version: RulesVersion) -> bool {
        self.algorithms_version >= algorithms_version && self.rules_version >= rules_version
    }
}

/// Durable per-chunk record of current cluster membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusteringState {
    pub project: String,
    pub chunk_id: ChunkId,
    pub object_id: ObjectId,
    pub partition_time: DateTime<Utc>,
    pub results: ClusterResults,
    /// Commit time of the write that produced this row.
    pub last_updated: DateTime<Utc>,
}

impl ClusteringState {
    pub fn stamp(&self) -> VersionStamp {
        VersionStamp {
            algorithms_version: self.results.algorithms_version,
            rules_version: self.results.rules_version,
            last_updated: self.last_updated,
        }
    }
}

/// Status of a single test execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestStatus {
    Unspecified,
    Pass,
    Fail,
    Crash,
    Abort,
    Skip,
}

impl TestStatus {
    /// Abort, crash and fail are failure kinds; pass and skip are not.
    pub fn is_failure(self) -> bool {
        matches!(self, TestStatus::Fail | TestStatus::Crash | TestStatus::Abort)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExonerationReason {
    OccursOnMainline,
    OccursOnOtherCls,
    NotCritical,
    UnexpectedPass,
}

/// Whether a failure should be disregarded for pass/fail signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExonerationStatus {
    NotExonerated,
    /// The test variant carried exoneration records.
    Explicit(Vec<ExonerationReason>),
    /// The invocation never passed the variant and the ingestion policy
    /// exonerates such blocking failures.
    Implicit,
}

impl ExonerationStatus {
    pub fn is_exonerated(&self) -> bool {
        !matches!(self, ExonerationStatus::NotExonerated)
    }
}

/// Key/value dimensions a test was run with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variant(pub BTreeMap<String, String>);

impl Variant {
    pub fn from_pairs<K: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (K, V)>) -> Self {
        Variant(
            pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }

    /// Stable short hash of the variant: first 8 bytes of SHA-256 over the
    /// sorted `key:value` lines.
    pub fn hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        for (key, value) in &self.0 {
            hasher.update(key.as_bytes());
            hasher.update(b":");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(&hasher.finalize()[..8])
    }
}

/// Presubmit (pre-merge CI) run the ingested invocation was part of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresubmitContext {
    pub run_id: String,
    pub owner: String,
    pub mode: String,
    pub critical: bool,
}

/// One unexpected failing test result, enriched for clustering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Position within the owning chunk.
    pub chunk_index: u32,
    pub ingested_invocation_id: String,
    pub realm: String,
    pub partition_time: DateTime<Utc>,
    pub test_id: String,
    pub variant: Variant,
    pub variant_hash: String,
    pub result_id: String,
    pub test_run_id: String,
    pub status: TestStatus,
    pub failure_reason: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub exoneration: ExonerationStatus,
    pub presubmit: Option<PresubmitContext>,
    pub ingested_invocation_result_index: u32,
    pub ingested_invocation_result_count: u32,
    pub is_ingested_invocation_blocked: bool,
    pub test_run_result_index: u32,
    pub test_run_result_count: u32,
    pub is_test_run_blocked: bool,
}

impl Failure {
    /// The primary failure reason, if one was recorded and is non-empty.
    pub fn primary_reason(&self) -> Option<&str> {
        self.failure_reason
            .as_deref()
            .filter(|reason| !reason.is_empty())
    }
}

/// A bounded, ordered batch of failures stored and clustered as one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub failures: Vec<Failure>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}
