//! Storage engine adapter.
//!
//! An ordered key-value store with named column families, atomic
//! multi-column write batches, pinned-sequence snapshots, and bounded prefix
//! iteration. Blocking engine calls made from task context are routed
//! through the scheduler's offload boundary by the callers that need it;
//! point reads are served inline on the block-cache path.

use std::{path::Path, sync::Arc};

use rocksdb::{
    BlockBasedOptions, BoundColumnFamily, Cache, ColumnFamilyDescriptor, DBWithThreadMode,
    Direction, IteratorMode, MultiThreaded, Options, ReadOptions, SnapshotWithThreadMode,
    WriteBatch,
};
use tracing::{debug, info};

use crate::error::{Error, Result};

type Db = DBWithThreadMode<MultiThreaded>;

const BLOCK_CACHE_BYTES: usize = 64 * 1024 * 1024;

/// Big-endian fixed-width encoding; lexicographic order equals integer order.
pub fn u64_key(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

pub fn u64_from(bytes: &[u8]) -> Result<u64> {
    let fixed: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Storage(format!("expected 8-byte key, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(fixed))
}

// iterator validity predicates over a returned key
pub fn valid_eq(key: &[u8], expect: &[u8]) -> bool {
    key == expect
}

pub fn valid_lte(key: &[u8], upper: &[u8]) -> bool {
    key <= upper
}

pub fn valid_gt(key: &[u8], lower: &[u8]) -> bool {
    key > lower
}

pub struct Database {
    db: Arc<Db>,
}

impl Database {
    /// Open (creating as needed) a database with the given column families.
    pub fn open(path: &Path, columns: &[&str]) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.enable_statistics();

        let cache = Cache::new_lru_cache(BLOCK_CACHE_BYTES);
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(&cache);

        let descriptors: Vec<ColumnFamilyDescriptor> = columns
            .iter()
            .map(|name| {
                let mut cf_opts = Options::default();
                cf_opts.set_block_based_table_factory(&block_opts);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = Db::open_cf_descriptors(&opts, path, descriptors)?;
        info!(path = %path.display(), columns = columns.len(), "database open");

        Ok(Self { db: Arc::new(db) })
    }

    pub fn column(&self, name: &str) -> Result<Column> {
        if self.db.cf_handle(name).is_none() {
            return Err(Error::Storage(format!("no such column family: {name}")));
        }
        Ok(Column {
            db: self.db.clone(),
            name: Arc::from(name),
        })
    }

    /// Commit a batch atomically across every column it touches.
    pub fn write(&self, batch: WriteBatch) -> Result<()> {
        debug!(size = batch.len(), "committing write batch");
        self.db.write(batch).map_err(Error::from)
    }

    /// Global commit order; snapshots pin a value of this.
    pub fn latest_sequence(&self) -> u64 {
        self.db.latest_sequence_number()
    }

    pub fn snapshot(&self) -> Snapshot<'_> {
        Snapshot {
            snap: self.db.snapshot(),
            db: &self.db,
        }
    }

    /// Engine property for one column, e.g. `rocksdb.estimate-num-keys`.
    pub fn property(&self, column: &str, name: &str) -> Result<Option<u64>> {
        let cf = self
            .db
            .cf_handle(column)
            .ok_or_else(|| Error::Storage(format!("no such column family: {column}")))?;
        self.db
            .property_int_value_cf(&cf, name)
            .map_err(Error::from)
    }

    /// On-disk SST files as (path, size).
    pub fn sst_files(&self) -> Result<Vec<(String, usize)>> {
        let files = self.db.live_files()?;
        Ok(files
            .into_iter()
            .map(|f| (f.name, f.size))
            .collect())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush().map_err(Error::from)
    }
}

/// Handle to one column family. Cheap to clone; operations resolve the
/// engine handle per call so handles stay valid across option reloads.
#[derive(Clone)]
pub struct Column {
    db: Arc<Db>,
    name: Arc<str>,
}

impl Column {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(&self.name)
            .ok_or_else(|| Error::Storage(format!("column family vanished: {}", self.name)))
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.handle()?;
        self.db.get_cf(&cf, key).map_err(Error::from)
    }

    pub fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = self.handle()?;
        self.db.put_cf(&cf, key, value).map_err(Error::from)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let cf = self.handle()?;
        self.db.delete_cf(&cf, key).map_err(Error::from)
    }

    pub fn batch_put(&self, batch: &mut WriteBatch, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = self.handle()?;
        batch.put_cf(&cf, key, value);
        Ok(())
    }

    pub fn batch_delete(&self, batch: &mut WriteBatch, key: &[u8]) -> Result<()> {
        let cf = self.handle()?;
        batch.delete_cf(&cf, key);
        Ok(())
    }

    /// All entries whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scan_from(prefix, prefix, Direction::Forward, None)
    }

    /// Bounded scan from `start` keeping keys under `prefix`; reverse scans
    /// walk down from `start`.
    pub fn scan_from(
        &self,
        start: &[u8],
        prefix: &[u8],
        direction: Direction,
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.handle()?;
        let opts = ReadOptions::default();
        let iter = self
            .db
            .iterator_cf_opt(&cf, opts, IteratorMode::From(start, direction));

        collect_prefixed(iter, prefix, limit)
    }
}

/// Consistent read view pinned at a sequence number.
pub struct Snapshot<'a> {
    snap: SnapshotWithThreadMode<'a, Db>,
    db: &'a Arc<Db>,
}

impl<'a> Snapshot<'a> {
    pub fn get(&self, column: &Column, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self
            .db
            .cf_handle(column.name())
            .ok_or_else(|| Error::Storage(format!("column family vanished: {}", column.name())))?;
        self.snap.get_cf(&cf, key).map_err(Error::from)
    }

    pub fn scan_prefix(&self, column: &Column, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self
            .db
            .cf_handle(column.name())
            .ok_or_else(|| Error::Storage(format!("column family vanished: {}", column.name())))?;
        let iter = self
            .snap
            .iterator_cf_opt(
                &cf,
                ReadOptions::default(),
                IteratorMode::From(prefix, Direction::Forward),
            );

        collect_prefixed(iter, prefix, None)
    }
}

fn collect_prefixed<I>(iter: I, prefix: &[u8], limit: Option<usize>) -> Result<Vec<(Vec<u8>, Vec<u8>)>>
where
    I: Iterator<Item = std::result::Result<(Box<[u8]>, Box<[u8]>), rocksdb::Error>>,
{
    let mut out = Vec::new();
    for item in iter {
        let (key, value) = item?;
        if !key.starts_with(prefix) {
            break;
        }
        out.push((key.into_vec(), value.into_vec()));
        if limit.is_some_and(|l| out.len() >= l) {
            break;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &tempfile::TempDir) -> Database {
        Database::open(&dir.path().join("db"), &["alpha", "beta"]).unwrap()
    }

    #[test]
    fn put_get_round_trip_per_column() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(&dir);
        let alpha = db.column("alpha").unwrap();
        let beta = db.column("beta").unwrap();

        alpha.put(b"k", b"a-value").unwrap();
        beta.put(b"k", b"b-value").unwrap();

        assert_eq!(alpha.get(b"k").unwrap().as_deref(), Some(&b"a-value"[..]));
        assert_eq!(beta.get(b"k").unwrap().as_deref(), Some(&b"b-value"[..]));
        assert!(db.column("gamma").is_err());
    }

    #[test]
    fn batch_commit_is_atomic_across_columns() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(&dir);
        let alpha = db.column("alpha").unwrap();
        let beta = db.column("beta").unwrap();

        let mut batch = WriteBatch::default();
        alpha.batch_put(&mut batch, b"one", b"1").unwrap();
        beta.batch_put(&mut batch, b"two", b"2").unwrap();
        db.write(batch).unwrap();

        assert!(alpha.has(b"one").unwrap());
        assert!(beta.has(b"two").unwrap());
    }

    #[test]
    fn snapshot_is_unaffected_by_later_commits() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(&dir);
        let alpha = db.column("alpha").unwrap();

        alpha.put(b"k", b"before").unwrap();
        let seq = db.latest_sequence();
        let snapshot = db.snapshot();
        alpha.put(b"k", b"after").unwrap();

        assert_eq!(
            snapshot.get(&alpha, b"k").unwrap().as_deref(),
            Some(&b"before"[..])
        );
        assert_eq!(alpha.get(b"k").unwrap().as_deref(), Some(&b"after"[..]));
        assert!(db.latest_sequence() > seq);
    }

    #[test]
    fn u64_keys_order_as_integers() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(&dir);
        let alpha = db.column("alpha").unwrap();

        for v in [3u64, 1, 256, 2, 255] {
            alpha.put(&u64_key(v), &[]).unwrap();
        }

        let keys: Vec<u64> = alpha
            .scan_prefix(&[])
            .unwrap()
            .into_iter()
            .map(|(k, _)| u64_from(&k).unwrap())
            .collect();
        assert_eq!(keys, [1, 2, 3, 255, 256]);
    }

    #[test]
    fn prefix_scan_stops_at_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(&dir);
        let alpha = db.column("alpha").unwrap();

        alpha.put(b"room1\x00a", b"1").unwrap();
        alpha.put(b"room1\x00b", b"2").unwrap();
        alpha.put(b"room2\x00a", b"3").unwrap();

        let entries = alpha.scan_prefix(b"room1\x00").unwrap();
        assert_eq!(entries.len(), 2);

        let limited = alpha
            .scan_from(b"room1\x00", b"room1\x00", Direction::Forward, Some(1))
            .unwrap();
        assert_eq!(limited.len(), 1);
    }
}
