//! # Store Module
//!
//! Interfaces to the durable clustering-state store and the chunk blob store,
//! with in-memory implementations.
//!
//! The state store is the only shared mutable state in the system. Rows are
//! created once with create-if-absent semantics and afterwards replaced only
//! through a compare-and-swap on their [`VersionStamp`].

use crate::model::{Chunk, ChunkId, ClusteringState, ObjectId, VersionStamp};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

/// Result of creating a clustering state row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created { commit_time: DateTime<Utc> },
    /// Another writer created the row first.
    AlreadyExists,
}

/// Result of a compare-and-swap update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { commit_time: DateTime<Utc> },
    /// The row no longer carries the expected stamp, or was removed.
    Conflict,
}

/// Durable store of per-chunk clustering state keyed by `(project, chunk_id)`.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn read(&self, project: &str, chunk_id: ChunkId) -> Result<Option<ClusteringState>>;

    /// Up to `limit` rows with `start <= chunk_id < end` (no upper bound when
    /// `end` is `None`), in ascending chunk id order.
    async fn read_range(
        &self,
        project: &str,
        start: ChunkId,
        end: Option<ChunkId>,
        limit: usize,
    ) -> Result<Vec<ClusteringState>>;

    /// Create the row unless one exists. The stored `last_updated` is the
    /// returned commit time.
    async fn create(&self, state: ClusteringState) -> Result<CreateOutcome>;

    /// Atomically replace the row if its stamp still equals `expected`. The
    /// stored `last_updated` is the returned commit time.
    async fn update_if_unchanged(&self, expected: &VersionStamp, state: ClusteringState) -> Result<CommitOutcome>;
}

/// Write-once store of chunk content.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store the chunk under a freshly generated object id.
    async fn put(&self, project: &str, chunk: &Chunk) -> Result<ObjectId>;

    async fn get(&self, project: &str, object_id: &ObjectId) -> Result<Chunk>;
}

/// Source of strictly increasing commit timestamps.
#[derive(Debug)]
pub struct CommitClock {
    last: Mutex<DateTime<Utc>>,
}

impl CommitClock {
    pub fn new() -> Self {
        Self::starting_after(DateTime::<Utc>::MIN_UTC)
    }

    /// A clock whose first timestamp is later than `last`, e.g. the latest
    /// commit time recorded before a restart.
    pub fn starting_after(last: DateTime<Utc>) -> Self {
        Self {
            last: Mutex::new(last),
        }
    }

    pub fn next(&self) -> DateTime<Utc> {
        let now = Utc::now();
        let mut last = self.last.lock();
        let commit_time = if now > *last {
            now
        } else {
            *last + chrono::Duration::microseconds(1)
        };
        *last = commit_time;
        commit_time
    }
}

impl Default for CommitClock {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory state store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    rows: Mutex<BTreeMap<(String, ChunkId), ClusteringState>>,
    clock: CommitClock,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every row of a project in chunk id order.
    pub fn snapshot(&self, project: &str) -> Vec<ClusteringState> {
        self.rows
            .lock()
            .iter()
            .filter(|((row_project, _), _)| row_project == project)
            .map(|(_, state)| state.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn read(&self, project: &str, chunk_id: ChunkId) -> Result<Option<ClusteringState>> {
        Ok(self.rows.lock().get(&(project.to_string(), chunk_id)).cloned())
    }

    async fn read_range(
        &self,
        project: &str,
        start: ChunkId,
        end: Option<ChunkId>,
        limit: usize,
    ) -> Result<Vec<ClusteringState>> {
        let lower = Bound::Included((project.to_string(), start));
        let upper = match end {
            Some(end) => Bound::Excluded((project.to_string(), end)),
            None => Bound::Included((project.to_string(), ChunkId::MAX)),
        };
        if let (Bound::Included(low), Bound::Excluded(high)) = (&lower, &upper) {
            if low >= high {
                return Ok(Vec::new());
            }
        }
        Ok(self
            .rows
            .lock()
            .range((lower, upper))
            .take(limit)
            .map(|(_, state)| state.clone())
            .collect())
    }

    async fn create(&self, mut state: ClusteringState) -> Result<CreateOutcome> {
        let mut rows = self.rows.lock();
        let key = (state.project.clone(), state.chunk_id);
        if rows.contains_key(&key) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        let commit_time = self.clock.next();
        state.last_updated = commit_time;
        rows.insert(key, state);
        Ok(CreateOutcome::Created { commit_time })
    }

    async fn update_if_unchanged(&self, expected: &VersionStamp, mut state: ClusteringState) -> Result<CommitOutcome> {
        let mut rows = self.rows.lock();
        let key = (state.project.clone(), state.chunk_id);
        match rows.get(&key) {
            Some(current) if current.stamp() == *expected => {
                let commit_time = self.clock.next();
                state.last_updated = commit_time;
                rows.insert(key, state);
                Ok(CommitOutcome::Committed { commit_time })
            }
            _ => Ok(CommitOutcome::Conflict),
        }
    }
}

/// In-memory blob store. Content is held encoded, as a remote store would.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<(String, ObjectId), Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, project: &str, chunk: &Chunk) -> Result<ObjectId> {
        let bytes = bincode::serialize(chunk)?;
        let object_id = ObjectId::generate();
        self.objects
            .lock()
            .insert((project.to_string(), object_id.clone()), bytes);
        Ok(object_id)
    }

    async fn get(&self, project: &str, object_id: &ObjectId) -> Result<Chunk> {
        let objects = self.objects.lock();
        let bytes = objects
            .get(&(project.to_string(), object_id.clone()))
            .ok_or_else(|| anyhow!("object {object_id} not found in project {project}"))?;
        Ok(bincode::deserialize(bytes)?)
    }
}
