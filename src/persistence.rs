//! RocksDB-backed clustering state and blob stores.
//!
//! State rows live in `chunk_state` keyed by `project \0 chunk_id`, so a
//! project's rows are contiguous and ordered by chunk id. Chunk content lives
//! in `chunk_blobs` keyed by `project \0 object_id`. Both are bincode encoded.
//!
//! RocksDB holds an exclusive lock on the directory, so this process is the
//! only writer; a single in-process write lock makes create-if-absent and
//! compare-and-swap atomic. Every state write also records its commit time in
//! `metadata`, and a reopened store resumes its commit clock after it.

use crate::clustering::ALGORITHMS_VERSION;
use crate::config::StorageConfig;
use crate::model::{Chunk, ChunkId, ClusteringState, ObjectId, VersionStamp, CHUNK_ID_BYTES};
use crate::store::{BlobStore, CommitClock, CommitOutcome, CreateOutcome, StateStore};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use chrono::{DateTime, Utc};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB,
};
use std::num::NonZeroUsize;
use std::path::Path;
use tracing::{debug, info, warn};

const CF_CHUNK_STATE: &str = "chunk_state";
const CF_CHUNK_BLOBS: &str = "chunk_blobs";
const CF_METADATA: &str = "metadata";

const KEY_MANIFEST: &[u8] = b"manifest";
const KEY_LAST_COMMIT: &[u8] = b"last_commit";

const STORAGE_FORMAT_VERSION: u32 = 1;
const BLOB_CACHE_CAPACITY: usize = 1024;

#[derive(Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
struct StorageManifest {
    format_version: u32,
    /// Highest algorithms version of any build that opened the store.
    algorithms_version: i64,
}

/// Durable implementation of [`StateStore`] and [`BlobStore`].
pub struct PersistentStore {
    db: DB,
    write_lock: Mutex<()>,
    clock: CommitClock,
    blob_cache: Mutex<LruCache<(String, ObjectId), Chunk>>,
}

impl PersistentStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let config = StorageConfig {
            data_dir: path.as_ref().to_path_buf(),
            ..StorageConfig::default()
        };
        Self::open_with_config(&config)
    }

    pub fn open_with_config(config: &StorageConfig) -> Result<Self> {
        let db = open_db(config)
            .with_context(|| format!("opening clustering store at {}", config.data_dir.display()))?;
        check_manifest(&db)?;
        let last_commit = read_last_commit(&db)?;
        debug!(path = %config.data_dir.display(), ?last_commit, "opened clustering store");
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
            clock: last_commit.map_or_else(CommitClock::new, CommitClock::starting_after),
            blob_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(BLOB_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| anyhow!("missing {name} column family"))
    }

    fn load_state(&self, key: &[u8]) -> Result<Option<ClusteringState>> {
        let cf = self.cf(CF_CHUNK_STATE)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write a state row stamped with the next commit time, together with
    /// that time as the store's high-water mark. Caller holds the write lock.
    fn commit_state(&self, key: &[u8], mut state: ClusteringState) -> Result<DateTime<Utc>> {
        let commit_time = self.clock.next();
        let commit_nanos = commit_time
            .timestamp_nanos_opt()
            .ok_or_else(|| anyhow!("commit time {commit_time} out of range"))?;
        state.last_updated = commit_time;
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_CHUNK_STATE)?, key, bincode::serialize(&state)?);
        batch.put_cf(
            self.cf(CF_METADATA)?,
            KEY_LAST_COMMIT,
            commit_nanos.to_be_bytes(),
        );
        self.db.write(batch)?;
        Ok(commit_time)
    }
}

impl Drop for PersistentStore {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(error = %err, "failed to flush clustering store on close");
        }
    }
}

#[async_trait]
impl StateStore for PersistentStore {
    async fn read(&self, project: &str, chunk_id: ChunkId) -> Result<Option<ClusteringState>> {
        self.load_state(&encode_state_key(project, chunk_id))
    }

    async fn read_range(
        &self,
        project: &str,
        start: ChunkId,
        end: Option<ChunkId>,
        limit: usize,
    ) -> Result<Vec<ClusteringState>> {
        let cf = self.cf(CF_CHUNK_STATE)?;
        let prefix = encode_project_prefix(project);
        let start_key = encode_state_key(project, start);
        let end_key = end.map(|end| encode_state_key(project, end));

        let mut states = Vec::new();
        for entry in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward))
        {
            if states.len() >= limit {
                break;
            }
            let (key, value) = entry?;
            if !key.starts_with(&prefix) || key.len() != prefix.len() + CHUNK_ID_BYTES {
                break;
            }
            if let Some(end_key) = &end_key {
                if &key[..] >= end_key.as_slice() {
                    break;
                }
            }
            states.push(bincode::deserialize(&value)?);
        }
        Ok(states)
    }

    async fn create(&self, state: ClusteringState) -> Result<CreateOutcome> {
        let key = encode_state_key(&state.project, state.chunk_id);
        let _guard = self.write_lock.lock();
        if self.load_state(&key)?.is_some() {
            return Ok(CreateOutcome::AlreadyExists);
        }
        let commit_time = self.commit_state(&key, state)?;
        Ok(CreateOutcome::Created { commit_time })
    }

    async fn update_if_unchanged(&self, expected: &VersionStamp, state: ClusteringState) -> Result<CommitOutcome> {
        let key = encode_state_key(&state.project, state.chunk_id);
        let _guard = self.write_lock.lock();
        match self.load_state(&key)? {
            Some(current) if current.stamp() == *expected => {
                let commit_time = self.commit_state(&key, state)?;
                Ok(CommitOutcome::Committed { commit_time })
            }
            _ => Ok(CommitOutcome::Conflict),
        }
    }
}

#[async_trait]
impl BlobStore for PersistentStore {
    async fn put(&self, project: &str, chunk: &Chunk) -> Result<ObjectId> {
        let cf = self.cf(CF_CHUNK_BLOBS)?;
        let object_id = ObjectId::generate();
        let bytes = bincode::serialize(chunk)?;
        self.db
            .put_cf(cf, encode_blob_key(project, &object_id), bytes)?;
        Ok(object_id)
    }

    async fn get(&self, project: &str, object_id: &ObjectId) -> Result<Chunk> {
        let cache_key = (project.to_string(), object_id.clone());
        if let Some(chunk) = self.blob_cache.lock().get(&cache_key) {
            return Ok(chunk.clone());
        }
        let cf = self.cf(CF_CHUNK_BLOBS)?;
        let bytes = self
            .db
            .get_cf(cf, encode_blob_key(project, object_id))?
            .ok_or_else(|| anyhow!("object {object_id} not found in project {project}"))?;
        let chunk: Chunk = bincode::deserialize(&bytes)?;
        self.blob_cache.lock().put(cache_key, chunk.clone());
        Ok(chunk)
    }
}

fn open_db(config: &StorageConfig) -> Result<DB> {
    let mut options = Options::default();
    options.create_if_missing(true);
    options.create_missing_column_families(true);
    options.set_paranoid_checks(true);
    options.set_max_background_jobs(config.max_background_jobs);

    let mut cf_options = Options::default();
    cf_options.set_write_buffer_size(config.write_buffer_mb * 1024 * 1024);
    let mut table_options = BlockBasedOptions::default();
    let cache = Cache::new_lru_cache(config.block_cache_mb * 1024 * 1024);
    table_options.set_block_cache(&cache);
    cf_options.set_block_based_table_factory(&table_options);

    let cfs = vec![
        ColumnFamilyDescriptor::new(CF_CHUNK_STATE, cf_options.clone()),
        ColumnFamilyDescriptor::new(CF_CHUNK_BLOBS, cf_options),
        ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
    ];
    Ok(DB::open_cf_descriptors(&options, &config.data_dir, cfs)?)
}

/// Reject stores written in another format, and remember the newest
/// algorithms version that has opened this one. Older builds may still open
/// it: the worker never rewrites chunks clustered by newer algorithms.
fn check_manifest(db: &DB) -> Result<()> {
    let metadata_cf = db
        .cf_handle(CF_METADATA)
        .ok_or_else(|| anyhow!("missing {CF_METADATA} column family"))?;
    let stored: Option<StorageManifest> = db
        .get_cf(metadata_cf, KEY_MANIFEST)?
        .map(|bytes| bincode::deserialize(&bytes))
        .transpose()?;

    let algorithms_version = match stored {
        Some(manifest) if manifest.format_version != STORAGE_FORMAT_VERSION => {
            return Err(anyhow!(
                "clustering store format {} is not supported (expected {})",
                manifest.format_version,
                STORAGE_FORMAT_VERSION
            ));
        }
        Some(manifest) if manifest.algorithms_version >= ALGORITHMS_VERSION => {
            if manifest.algorithms_version > ALGORITHMS_VERSION {
                warn!(
                    stored = manifest.algorithms_version,
                    running = ALGORITHMS_VERSION,
                    "clustering store was last opened by newer algorithms"
                );
            }
            return Ok(());
        }
        Some(manifest) => {
            info!(
                from = manifest.algorithms_version,
                to = ALGORITHMS_VERSION,
                "recording newer algorithms version in clustering store"
            );
            ALGORITHMS_VERSION
        }
        None => ALGORITHMS_VERSION,
    };
    let manifest = StorageManifest {
        format_version: STORAGE_FORMAT_VERSION,
        algorithms_version,
    };
    db.put_cf(metadata_cf, KEY_MANIFEST, bincode::serialize(&manifest)?)?;
    Ok(())
}

fn read_last_commit(db: &DB) -> Result<Option<DateTime<Utc>>> {
    let metadata_cf = db
        .cf_handle(CF_METADATA)
        .ok_or_else(|| anyhow!("missing {CF_METADATA} column family"))?;
    let Some(bytes) = db.get_cf(metadata_cf, KEY_LAST_COMMIT)? else {
        return Ok(None);
    };
    let nanos: [u8; 8] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("corrupt last commit time ({} bytes)", bytes.len()))?;
    Ok(Some(DateTime::from_timestamp_nanos(i64::from_be_bytes(nanos))))
}

fn encode_project_prefix(project: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(project.len() + 1 + CHUNK_ID_BYTES);
    key.extend_from_slice(project.as_bytes());
    key.push(0);
    key
}

fn encode_state_key(project: &str, chunk_id: ChunkId) -> Vec<u8> {
    let mut key = encode_project_prefix(project);
    key.extend_from_slice(&chunk_id.0);
    key
}

fn encode_blob_key(project: &str, object_id: &ObjectId) -> Vec<u8> {
    let mut key = encode_project_prefix(project);
    key.extend_from_slice(object_id.as_str().as_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ClusterResults;
    use crate::test_fixtures::failure;
    use chrono::{DateTime, Utc};
    use tempfile::tempdir;

    fn state(project: &str, chunk: u128) -> ClusteringState {
        ClusteringState {
            project: project.to_string(),
            chunk_id: ChunkId::from_u128(chunk),
            object_id: ObjectId::generate(),
            partition_time: Utc::now(),
            results: ClusterResults::unclustered(1),
            last_updated: DateTime::<Utc>::MIN_UTC,
        }
    }

    #[test]
    fn state_keys_order_by_chunk_id_within_a_project() {
        let low = encode_state_key("p", ChunkId::from_u128(1));
        let high = encode_state_key("p", ChunkId::from_u128(1 << 64));
        assert!(low < high);
        assert!(low.starts_with(&encode_project_prefix("p")));
        assert!(!encode_state_key("pp", ChunkId::MIN).starts_with(&encode_project_prefix("p")));
    }

    #[tokio::test]
    async fn range_reads_stay_inside_the_project() {
        let dir = tempdir().unwrap();
        let store = PersistentStore::open(dir.path()).unwrap();
        for chunk in [3u128, 1, 2] {
            store.create(state("p", chunk)).await.unwrap();
        }
        store.create(state("pa", 0)).await.unwrap();
        store.create(state("o", 5)).await.unwrap();

        let rows = store.read_range("p", ChunkId::MIN, None, 10).await.unwrap();
        let ids: Vec<u128> = rows.iter().map(|s| s.chunk_id.to_u128()).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        let rows = store
            .read_range("p", ChunkId::from_u128(2), Some(ChunkId::from_u128(3)), 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].chunk_id, ChunkId::from_u128(2));
    }

    #[tokio::test]
    async fn blobs_are_cached_after_first_read() {
        let dir = tempdir().unwrap();
        let store = PersistentStore::open(dir.path()).unwrap();
        let chunk = Chunk {
            failures: vec![failure("ninja://a", Some("boom"))],
        };
        let object_id = store.put("p", &chunk).await.unwrap();
        assert_eq!(store.get("p", &object_id).await.unwrap(), chunk);
        assert_eq!(store.blob_cache.lock().len(), 1);
        assert_eq!(store.get("p", &object_id).await.unwrap(), chunk);
        assert!(store.get("p", &ObjectId::generate()).await.is_err());
    }

    fn stored_manifest(store: &PersistentStore) -> StorageManifest {
        let cf = store.cf(CF_METADATA).unwrap();
        bincode::deserialize(&store.db.get_cf(cf, KEY_MANIFEST).unwrap().unwrap()).unwrap()
    }

    fn write_metadata(dir: &Path, key: &[u8], value: Vec<u8>) {
        let store = PersistentStore::open(dir).unwrap();
        let cf = store.cf(CF_METADATA).unwrap();
        store.db.put_cf(cf, key, value).unwrap();
    }

    #[test]
    fn manifest_format_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        let manifest = StorageManifest {
            format_version: STORAGE_FORMAT_VERSION + 1,
            algorithms_version: ALGORITHMS_VERSION,
        };
        write_metadata(dir.path(), KEY_MANIFEST, bincode::serialize(&manifest).unwrap());
        let err = PersistentStore::open(dir.path()).err().unwrap();
        assert!(err.to_string().contains("is not supported"));
    }

    #[test]
    fn manifest_keeps_the_newest_algorithms_version() {
        let dir = tempdir().unwrap();
        let older = StorageManifest {
            format_version: STORAGE_FORMAT_VERSION,
            algorithms_version: ALGORITHMS_VERSION - 2,
        };
        write_metadata(dir.path(), KEY_MANIFEST, bincode::serialize(&older).unwrap());
        let store = PersistentStore::open(dir.path()).unwrap();
        assert_eq!(stored_manifest(&store).algorithms_version, ALGORITHMS_VERSION);
        drop(store);

        let newer = StorageManifest {
            format_version: STORAGE_FORMAT_VERSION,
            algorithms_version: ALGORITHMS_VERSION + 1,
        };
        write_metadata(dir.path(), KEY_MANIFEST, bincode::serialize(&newer).unwrap());
        let store = PersistentStore::open(dir.path()).unwrap();
        assert_eq!(stored_manifest(&store), newer);
    }

    #[tokio::test]
    async fn commit_times_stay_ahead_of_the_last_commit_after_reopen() {
        let dir = tempdir().unwrap();
        let first = {
            let store = PersistentStore::open(dir.path()).unwrap();
            match store.create(state("p", 1)).await.unwrap() {
                CreateOutcome::Created { commit_time } => commit_time,
                CreateOutcome::AlreadyExists => panic!("fresh store"),
            }
        };
        let store = PersistentStore::open(dir.path()).unwrap();
        assert_eq!(read_last_commit(&store.db).unwrap(), Some(first));
        drop(store);

        // A last commit ahead of the wall clock, as after the clock stepped back.
        let ahead = Utc::now() + chrono::Duration::hours(2);
        write_metadata(dir.path(), KEY_LAST_COMMIT, ahead.timestamp_nanos_opt().unwrap().to_be_bytes().to_vec());
        let store = PersistentStore::open(dir.path()).unwrap();
        let CreateOutcome::Created { commit_time } = store.create(state("p", 2)).await.unwrap() else {
            panic!("chunk 2 is new");
        };
        assert!(commit_time > ahead);
    }
}
