//! Thin database handle wiring the blob-aware table stack together.
//!
//! `Db` is the convenience shape over the storage layer: one keyspace, a
//! concurrent memtable, and explicit flushes that drain it through the
//! blob table factory into numbered table files. Every value is separated
//! into blob files by default (`min_blob_size = 0`); raising the threshold
//! keeps small values inline. Compaction and collection policy stay with
//! the caller — the blob file manager's `release`/`obsolete_files` hooks
//! are reachable through [`Db::blob_file_manager`].

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crossbeam_skiplist::SkipMap;

use crate::blob::format::{BlobIndex, BLOB_INDEX_TAG};
use crate::blob::manager::BlobFileManager;
use crate::config::DbConfig;
use crate::error::Result;
use crate::table::base::BaseTableFactory;
use crate::table::blob::BlobTableFactory;
use crate::table::{TableBuildResult, TableFactory, TableReader};

type Memtable = SkipMap<Vec<u8>, Vec<u8>>;

pub struct Db {
    config: DbConfig,
    manager: Arc<BlobFileManager>,
    base: Arc<dyn TableFactory>,
    factory: BlobTableFactory,

    // Write path: the active memtable takes puts; during a flush the
    // outgoing one stays readable through the frozen slot until its table
    // is installed.
    active: RwLock<Arc<Memtable>>,
    frozen: RwLock<Option<Arc<Memtable>>>,

    // Read path: sealed tables, newest first.
    tables: RwLock<Vec<(u64, Box<dyn TableReader>)>>,

    flush_lock: Mutex<()>,
}

impl Db {
    /// Opens (or reopens) a database in `config.dir`.
    pub fn open(config: DbConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;

        let manager = Arc::new(BlobFileManager::open(&config.dir)?);
        let base: Arc<dyn TableFactory> = Arc::new(BaseTableFactory);
        let factory = BlobTableFactory::new(
            Arc::clone(&base),
            Arc::clone(&manager),
            config.blob.clone(),
        );

        let mut numbers = Vec::new();
        for entry in fs::read_dir(&config.dir)? {
            if let Some(number) = parse_table_number(&entry?.path()) {
                numbers.push(number);
            }
        }
        numbers.sort_unstable();
        if let Some(max) = numbers.last() {
            // Table and blob files share one allocator.
            manager.advance_file_number(max + 1);
        }

        let mut tables = Vec::new();
        for number in numbers.iter().rev() {
            let reader = factory.new_reader(&table_path(&config.dir, *number))?;
            tables.push((*number, reader));
        }

        let db = Self {
            config,
            manager,
            base,
            factory,
            active: RwLock::new(Arc::new(SkipMap::new())),
            frozen: RwLock::new(None),
            tables: RwLock::new(tables),
            flush_lock: Mutex::new(()),
        };
        db.rebuild_blob_references()?;
        tracing::info!(
            dir = %db.config.dir.display(),
            tables = numbers.len(),
            blob_files = db.manager.file_count(),
            "opened database"
        );
        Ok(db)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.active
            .read()
            .unwrap()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        {
            let active = self.active.read().unwrap();
            if let Some(entry) = active.get(key) {
                return Ok(Some(entry.value().clone()));
            };
        }
        {
            let frozen = self.frozen.read().unwrap();
            if let Some(memtable) = frozen.as_ref() {
                if let Some(entry) = memtable.get(key) {
                    return Ok(Some(entry.value().clone()));
                }
            }
        }
        let tables = self.tables.read().unwrap();
        for (_, reader) in tables.iter() {
            if let Some(value) = reader.get(key)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Drains the memtable into a new table file (plus a blob file for the
    /// separated values) and installs it for reads. Returns false when
    /// there was nothing to flush.
    pub fn flush(&self) -> Result<bool> {
        let _guard = self.flush_lock.lock().unwrap();

        let memtable = {
            let mut active = self.active.write().unwrap();
            if active.is_empty() {
                return Ok(false);
            }
            let outgoing = Arc::clone(&active);
            *self.frozen.write().unwrap() = Some(Arc::clone(&outgoing));
            *active = Arc::new(SkipMap::new());
            outgoing
        };

        let file_number = self.manager.next_file_number();
        let path = self.table_path(file_number);
        let mut builder = self.factory.new_builder(&path)?;

        let built: Result<TableBuildResult> = (|| {
            for entry in memtable.iter() {
                builder.add(entry.key(), entry.value())?;
            }
            builder.finish()
        })();
        let result = match built {
            Ok(result) => result,
            Err(err) => {
                let _ = builder.abandon();
                // Hand the entries back to the active memtable so the next
                // flush retries them; writes that arrived since win.
                let active = self.active.read().unwrap();
                for entry in memtable.iter() {
                    active.get_or_insert(entry.key().clone(), entry.value().clone());
                }
                drop(active);
                *self.frozen.write().unwrap() = None;
                return Err(err);
            }
        };

        self.sync_dir()?;
        let reader = self.factory.new_reader(&path)?;
        for blob_file in &result.blob_files {
            self.manager.reference(*blob_file)?;
        }
        self.tables.write().unwrap().insert(0, (file_number, reader));
        *self.frozen.write().unwrap() = None;

        tracing::info!(
            file_number,
            entries = result.num_entries,
            blob_files = result.blob_files.len(),
            "flushed memtable"
        );
        Ok(true)
    }

    /// Point-in-time view of the whole keyspace in key order, newest value
    /// winning.
    pub fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        {
            let active = self.active.read().unwrap();
            for entry in active.iter() {
                merged
                    .entry(entry.key().clone())
                    .or_insert_with(|| entry.value().clone());
            }
        }
        {
            let frozen = self.frozen.read().unwrap();
            if let Some(memtable) = frozen.as_ref() {
                for entry in memtable.iter() {
                    merged
                        .entry(entry.key().clone())
                        .or_insert_with(|| entry.value().clone());
                }
            }
        }
        let tables = self.tables.read().unwrap();
        for (_, reader) in tables.iter() {
            let mut iter = reader.iter()?;
            iter.seek_to_first()?;
            while iter.valid() {
                // Values materialize only for keys that are not shadowed.
                if !merged.contains_key(iter.key()) {
                    merged.insert(iter.key().to_vec(), iter.value()?);
                }
                iter.next()?;
            }
        }
        Ok(merged.into_iter().collect())
    }

    /// The blob file registry, exposing the reference and collection
    /// hooks.
    pub fn blob_file_manager(&self) -> &Arc<BlobFileManager> {
        &self.manager
    }

    fn table_path(&self, file_number: u64) -> PathBuf {
        table_path(&self.config.dir, file_number)
    }

    /// Re-counts which tables reference which blob files. Runs at open so
    /// the reference map survives restarts.
    fn rebuild_blob_references(&self) -> Result<()> {
        let tables = self.tables.read().unwrap();
        for (file_number, _) in tables.iter() {
            let raw = self.base.new_reader(&self.table_path(*file_number))?;
            let mut iter = raw.iter()?;
            iter.seek_to_first()?;
            let mut referenced = BTreeSet::new();
            while iter.valid() {
                let value = iter.value()?;
                if value.first() == Some(&BLOB_INDEX_TAG) {
                    referenced.insert(BlobIndex::decode(&value)?.file_number);
                }
                iter.next()?;
            }
            for blob_file in referenced {
                self.manager.reference(blob_file)?;
            }
        }
        Ok(())
    }

    fn sync_dir(&self) -> Result<()> {
        File::open(&self.config.dir)?.sync_all()?;
        Ok(())
    }
}

fn table_path(dir: &Path, file_number: u64) -> PathBuf {
    dir.join(format!("{file_number:08}.sst"))
}

fn parse_table_number(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.strip_suffix(".sst")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::format::CompressionType;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_put_get_roundtrip_through_flush() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let db = Db::open(DbConfig::new(dir.path())).expect("open failed");

        db.put(b"key1", b"value1").expect("put failed");
        db.put(b"key2", &[b'x'; 2048]).expect("put failed");
        assert_eq!(db.get(b"key1").expect("get failed"), Some(b"value1".to_vec()));

        assert!(db.flush().expect("flush failed"));
        assert!(!db.flush().expect("flush failed"));

        assert_eq!(db.get(b"key1").expect("get failed"), Some(b"value1".to_vec()));
        assert_eq!(db.get(b"key2").expect("get failed"), Some(vec![b'x'; 2048]));
        assert_eq!(db.get(b"missing").expect("get failed"), None);

        // min_blob_size defaults to zero: the flush separated everything.
        assert_eq!(db.blob_file_manager().file_count(), 1);
    }

    #[test]
    fn test_newest_value_wins_across_flushes() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let db = Db::open(DbConfig::new(dir.path())).expect("open failed");

        db.put(b"key", b"old").expect("put failed");
        db.flush().expect("flush failed");
        db.put(b"key", b"new").expect("put failed");
        db.flush().expect("flush failed");
        db.put(b"key", b"newest").expect("put failed");

        assert_eq!(db.get(b"key").expect("get failed"), Some(b"newest".to_vec()));
        assert_eq!(
            db.scan().expect("scan failed"),
            vec![(b"key".to_vec(), b"newest".to_vec())]
        );
    }

    #[test]
    fn test_scan_merges_in_key_order() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let db = Db::open(DbConfig::new(dir.path()).min_blob_size(64)).expect("open failed");

        let mut expected = Vec::new();
        for i in (0..60).rev() {
            let key = format!("key_{i:03}").into_bytes();
            let value = if i % 4 == 0 {
                vec![b'v'; 256]
            } else {
                format!("v{i}").into_bytes()
            };
            db.put(&key, &value).expect("put failed");
            expected.push((key, value));
            if i % 20 == 0 {
                db.flush().expect("flush failed");
            }
        }
        expected.sort();

        assert_eq!(db.scan().expect("scan failed"), expected);
    }

    #[test]
    fn test_reopen_restores_data_and_references() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let blob_file = {
            let db = Db::open(
                DbConfig::new(dir.path())
                    .min_blob_size(16)
                    .blob_file_compression(CompressionType::Snappy),
            )
            .expect("open failed");
            db.put(b"small", b"inline").expect("put failed");
            db.put(b"large", &[b'L'; 4096]).expect("put failed");
            db.flush().expect("flush failed");

            let files = db.blob_file_manager().files();
            assert_eq!(files.len(), 1);
            files[0].file_number
        };

        let db = Db::open(DbConfig::new(dir.path()).min_blob_size(16)).expect("reopen failed");
        assert_eq!(db.get(b"small").expect("get failed"), Some(b"inline".to_vec()));
        assert_eq!(db.get(b"large").expect("get failed"), Some(vec![b'L'; 4096]));

        // The reference map was rebuilt from the tables on disk.
        assert_eq!(
            db.blob_file_manager()
                .references(blob_file)
                .expect("references failed"),
            1
        );

        // New allocations never collide with what is already on disk.
        let next = db.blob_file_manager().next_file_number();
        assert!(next > blob_file);
    }

    #[test]
    fn test_inline_threshold_respected() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let db = Db::open(DbConfig::new(dir.path()).min_blob_size(1024)).expect("open failed");

        for i in 0..100 {
            db.put(format!("key_{i:03}").as_bytes(), b"short value")
                .expect("put failed");
        }
        db.flush().expect("flush failed");

        // Everything stayed inline: no blob file was created.
        assert_eq!(db.blob_file_manager().file_count(), 0);
        assert_eq!(db.scan().expect("scan failed").len(), 100);
    }
}
