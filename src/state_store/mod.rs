use std::{path::Path, sync::Arc};

use anyhow::{anyhow, Result};
use rocksdb::{
    ColumnFamilyDescriptor, Direction, ErrorKind, IteratorMode, Options, ReadOptions,
    TransactionDB, TransactionDBOptions,
};
use serde::{de::DeserializeOwned, Serialize};
use strum::{AsRefStr, IntoEnumIterator};
use tracing::{debug, info};

use crate::data_model::{Artifact, Task};

#[derive(AsRefStr, strum::Display, strum::EnumIter)]
pub enum ArtifactStoreColumns {
    Artifacts, // TaskId|RunId|Name -> Artifact
    Tasks,     // TaskId -> Task (read-only projection)
}

/// Outcome of a conditional insert.
#[derive(Debug)]
pub enum CreateResult {
    Created,
    /// The key is already taken; carries the record observed under the
    /// insert lock.
    Conflict(Artifact),
}

/// Durable keyed table of artifact metadata.
///
/// `create` and `modify` run inside RocksDB transactions with a locked read
/// of the key, so they linearize against each other without any in-process
/// locking.
pub struct ArtifactStore {
    db: Arc<TransactionDB>,
}

const COMMIT_RETRIES: usize = 5;

// Rows are stored as JSON so they stay greppable with the rocksdb tooling.
fn encode_row<T: Serialize>(row: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(row).map_err(|e| anyhow!("artifact store row would not serialize: {e}"))
}

fn decode_row<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| anyhow!("artifact store holds an undecodable row: {e}"))
}

impl ArtifactStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut db_opts = Options::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);
        let column_families = ArtifactStoreColumns::iter()
            .map(|cf| ColumnFamilyDescriptor::new(cf.as_ref(), Options::default()));
        let db = TransactionDB::open_cf_descriptors(
            &db_opts,
            &TransactionDBOptions::default(),
            path.as_ref(),
            column_families,
        )?;
        info!(path = %path.as_ref().display(), "opened artifact store");
        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, column: ArtifactStoreColumns) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(column.as_ref())
            .ok_or_else(|| anyhow!("failed to get column family {}", column))
    }

    /// Conditional insert keyed by `(task_id, run_id, name)`.
    pub fn create(&self, artifact: &Artifact) -> Result<CreateResult> {
        let cf = self.cf(ArtifactStoreColumns::Artifacts)?;
        let key = artifact.key();
        for attempt in 0.. {
            let txn = self.db.transaction();
            if let Some(bytes) = txn.get_for_update_cf(cf, &key, true)? {
                let existing: Artifact = decode_row(&bytes)?;
                return Ok(CreateResult::Conflict(existing));
            }
            txn.put_cf(cf, &key, encode_row(artifact)?)?;
            match txn.commit() {
                Ok(()) => return Ok(CreateResult::Created),
                Err(err) if retryable(&err) && attempt < COMMIT_RETRIES => {
                    debug!(key, "artifact insert raced, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        unreachable!("insert retry loop always returns");
    }

    pub fn load(&self, task_id: &str, run_id: u32, name: &str) -> Result<Option<Artifact>> {
        let cf = self.cf(ArtifactStoreColumns::Artifacts)?;
        let key = Artifact::key_from(task_id, run_id, name);
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(decode_row(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Atomic read-modify-write of an existing artifact.
    ///
    /// The key is read under an exclusive lock before the mutator runs, so
    /// concurrent `create`/`modify` of the same key serialize.
    pub fn modify<F>(&self, task_id: &str, run_id: u32, name: &str, mutate: F) -> Result<Artifact>
    where
        F: Fn(&mut Artifact),
    {
        let cf = self.cf(ArtifactStoreColumns::Artifacts)?;
        let key = Artifact::key_from(task_id, run_id, name);
        for attempt in 0.. {
            let txn = self.db.transaction();
            let bytes = txn
                .get_for_update_cf(cf, &key, true)?
                .ok_or_else(|| anyhow!("artifact {} disappeared during modify", key))?;
            let mut artifact: Artifact = decode_row(&bytes)?;
            mutate(&mut artifact);
            txn.put_cf(cf, &key, encode_row(&artifact)?)?;
            match txn.commit() {
                Ok(()) => return Ok(artifact),
                Err(err) if retryable(&err) && attempt < COMMIT_RETRIES => {
                    debug!(key, "artifact modify raced, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        unreachable!("modify retry loop always returns");
    }

    /// Ordered paged scan over a run's artifacts.
    ///
    /// `restart_key` is the opaque cursor returned by a previous call; the
    /// scan resumes from it. A returned cursor means more rows may exist.
    pub fn list(
        &self,
        task_id: &str,
        run_id: u32,
        restart_key: Option<&[u8]>,
        limit: usize,
    ) -> Result<(Vec<Artifact>, Option<Vec<u8>>)> {
        let cf = self.cf(ArtifactStoreColumns::Artifacts)?;
        let prefix = Artifact::key_prefix_from_run(task_id, run_id);

        let mut read_options = ReadOptions::default();
        read_options.set_readahead_size(4_194_304);
        let iterator_mode = match restart_key {
            Some(restart_key) => IteratorMode::From(restart_key, Direction::Forward),
            None => IteratorMode::From(prefix.as_bytes(), Direction::Forward),
        };
        let iter = self.db.iterator_cf_opt(cf, read_options, iterator_mode);

        let mut items = Vec::new();
        let mut next = None;
        for kv in iter {
            let (key, value) = kv?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            if items.len() < limit {
                items.push(decode_row(&value)?);
            } else {
                next.replace(key.into_vec());
                break;
            }
        }
        Ok((items, next))
    }

    /// Read the task projection. This service never writes it.
    pub fn task(&self, task_id: &str) -> Result<Option<Task>> {
        let cf = self.cf(ArtifactStoreColumns::Tasks)?;
        match self.db.get_cf(cf, task_id)? {
            Some(bytes) => Ok(Some(decode_row(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Upsert a task projection row. Called by the task machinery feeding
    /// this table, and by the test harness.
    pub fn put_task(&self, task: &Task) -> Result<()> {
        let cf = self.cf(ArtifactStoreColumns::Tasks)?;
        self.db.put_cf(cf, task.key(), encode_row(task)?)?;
        Ok(())
    }

    /// Delete artifact rows whose expiration has passed. Returns the number
    /// of rows removed. Bytes in external object stores are not touched.
    pub fn delete_expired(&self, now: u64) -> Result<usize> {
        let cf = self.cf(ArtifactStoreColumns::Artifacts)?;
        let mut expired = Vec::new();
        for kv in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = kv?;
            let artifact: Artifact = decode_row(&value)?;
            if artifact.expires < now {
                expired.push(key);
            }
        }
        let count = expired.len();
        for key in expired {
            self.db.delete_cf(cf, key)?;
        }
        Ok(count)
    }
}

fn retryable(err: &rocksdb::Error) -> bool {
    matches!(err.kind(), ErrorKind::Busy | ErrorKind::TryAgain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::{ArtifactBuilder, ArtifactDetails};

    fn store() -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path().join("state")).unwrap();
        (dir, store)
    }

    fn reference_artifact(name: &str, expires: u64) -> Artifact {
        ArtifactBuilder::default()
            .task_id("t1".to_string())
            .run_id(0)
            .name(name.to_string())
            .expires(expires)
            .details(ArtifactDetails::Reference {
                url: "https://example.com/x".to_string(),
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_create_is_conditional() {
        let (_dir, store) = store();
        let artifact = reference_artifact("public/a", 100);

        assert!(matches!(
            store.create(&artifact).unwrap(),
            CreateResult::Created
        ));
        match store.create(&artifact).unwrap() {
            CreateResult::Conflict(existing) => assert_eq!(existing, artifact),
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(store.load("t1", 0, "public/a").unwrap(), Some(artifact));
    }

    #[test]
    fn test_modify_applies_mutation() {
        let (_dir, store) = store();
        store.create(&reference_artifact("public/a", 100)).unwrap();

        let updated = store
            .modify("t1", 0, "public/a", |a| a.expires = 500)
            .unwrap();
        assert_eq!(updated.expires, 500);
        assert_eq!(store.load("t1", 0, "public/a").unwrap().unwrap().expires, 500);
    }

    #[test]
    fn test_list_pages_through_run() {
        let (_dir, store) = store();
        for i in 0..5 {
            store
                .create(&reference_artifact(&format!("public/{i}"), 100))
                .unwrap();
        }
        // Row under a different run must not leak into the scan.
        let mut other = reference_artifact("public/0", 100);
        other.run_id = 1;
        store.create(&other).unwrap();

        let (page, cursor) = store.list("t1", 0, None, 3).unwrap();
        assert_eq!(page.len(), 3);
        let cursor = cursor.expect("more rows expected");

        let (rest, cursor) = store.list("t1", 0, Some(&cursor), 3).unwrap();
        assert_eq!(rest.len(), 2);
        assert!(cursor.is_none());

        let names: Vec<_> = page.iter().chain(rest.iter()).map(|a| &a.name).collect();
        assert_eq!(names, ["public/0", "public/1", "public/2", "public/3", "public/4"]);
    }

    #[test]
    fn test_delete_expired_leaves_live_rows() {
        let (_dir, store) = store();
        store.create(&reference_artifact("public/old", 10)).unwrap();
        store.create(&reference_artifact("public/new", 1000)).unwrap();

        assert_eq!(store.delete_expired(500).unwrap(), 1);
        assert!(store.load("t1", 0, "public/old").unwrap().is_none());
        assert!(store.load("t1", 0, "public/new").unwrap().is_some());
    }
}
