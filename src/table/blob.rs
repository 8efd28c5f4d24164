//! Blob-aware table adapter.
//!
//! [`BlobTableFactory`] decorates a base table factory. Builders route
//! values at or above the separation threshold into a blob file and hand
//! the base builder a tagged [`BlobIndex`] in their place; readers inspect
//! the first byte of every value on the way out and substitute the blob
//! record's value when they see the tag. Everything else — key order, seek
//! targets, iterator validity — is the base implementation's, untouched.
//!
//! The factory reports the *base* factory's name, so option files written
//! against the plain format keep parsing after blob separation is switched
//! on. The flip side is that the two formats must stay mutually readable,
//! which holds because separation only changes value bytes.

use std::path::Path;
use std::sync::Arc;

use crate::blob::format::{BlobIndex, BLOB_INDEX_TAG};
use crate::blob::manager::BlobFileManager;
use crate::blob::writer::BlobFileWriter;
use crate::config::BlobConfig;
use crate::error::{Error, Result};

use super::{
    TableBuilder, TableBuildResult, TableFactory, TableIterator, TableProperties, TableReader,
};

pub struct BlobTableFactory {
    base: Arc<dyn TableFactory>,
    manager: Arc<BlobFileManager>,
    config: BlobConfig,
}

impl BlobTableFactory {
    pub fn new(
        base: Arc<dyn TableFactory>,
        manager: Arc<BlobFileManager>,
        config: BlobConfig,
    ) -> Self {
        Self {
            base,
            manager,
            config,
        }
    }
}

impl TableFactory for BlobTableFactory {
    /// Reports the wrapped factory's name for option-file compatibility.
    fn name(&self) -> &'static str {
        self.base.name()
    }

    /// Option introspection delegates to the wrapped factory as well;
    /// blob settings live in the database options, not the table options.
    fn options_string(&self) -> String {
        self.base.options_string()
    }

    fn new_builder(&self, path: &Path) -> Result<Box<dyn TableBuilder>> {
        Ok(Box::new(BlobTableBuilder {
            base: self.base.new_builder(path)?,
            manager: Arc::clone(&self.manager),
            config: self.config.clone(),
            writer: None,
        }))
    }

    fn new_reader(&self, path: &Path) -> Result<Box<dyn TableReader>> {
        Ok(Box::new(BlobTableReader {
            base: self.base.new_reader(path)?,
            manager: Arc::clone(&self.manager),
        }))
    }
}

struct BlobTableBuilder {
    base: Box<dyn TableBuilder>,
    manager: Arc<BlobFileManager>,
    config: BlobConfig,
    writer: Option<BlobFileWriter>,
}

impl BlobTableBuilder {
    fn should_separate(&self, value: &[u8]) -> bool {
        if self.config.min_blob_size == u64::MAX {
            // Separation disabled; the tag reservation is the caller's
            // contract and the output stays byte-identical to the base's.
            return false;
        }
        // A value that would begin with the reserved tag can never be
        // stored inline, whatever the threshold says.
        value.len() as u64 >= self.config.min_blob_size
            || value.first() == Some(&BLOB_INDEX_TAG)
    }
}

impl TableBuilder for BlobTableBuilder {
    fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if !self.should_separate(value) {
            return self.base.add(key, value);
        }

        if self.writer.is_none() {
            self.writer = Some(self.manager.new_file(self.config.blob_file_compression)?);
        }
        let writer = self.writer.as_mut().expect("blob writer just initialized");
        let handle = writer.add(key, value)?;
        let index = BlobIndex {
            file_number: writer.file_number(),
            handle,
        };
        self.base.add(key, &index.encode())
    }

    fn finish(&mut self) -> Result<TableBuildResult> {
        let mut blob_files = Vec::new();
        if let Some(writer) = self.writer.take() {
            // The blob data must be durable before the table that
            // references it.
            let meta = self.manager.finish(writer)?;
            blob_files.push(meta.file_number);
        }
        let mut result = self.base.finish()?;
        result.blob_files = blob_files;
        Ok(result)
    }

    fn abandon(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.abandon()?;
        }
        self.base.abandon()
    }
}

struct BlobTableReader {
    base: Box<dyn TableReader>,
    manager: Arc<BlobFileManager>,
}

/// Replaces a tagged value with the blob record it points at. Failures are
/// reported against the referencing index, annotated with the file number
/// and offset for forensics.
fn resolve(manager: &BlobFileManager, value: Vec<u8>) -> Result<Vec<u8>> {
    if value.first() != Some(&BLOB_INDEX_TAG) {
        return Ok(value);
    }
    let index = BlobIndex::decode(&value)?;
    let annotate = |err: Error| match err {
        Error::FileNotFound(file_number) => Error::Corruption(
            "BlobIndex",
            format!(
                "missing blob file {} (offset {})",
                file_number, index.handle.offset
            ),
        ),
        Error::Corruption(what, reason) => Error::Corruption(
            what,
            format!(
                "{reason} (blob file {} offset {})",
                index.file_number, index.handle.offset
            ),
        ),
        other => other,
    };
    let reader = manager.open_reader(index.file_number).map_err(annotate)?;
    let record = reader.get(&index.handle).map_err(annotate)?;
    Ok(record.value)
}

impl TableReader for BlobTableReader {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.base.get(key)? {
            Some(value) => Ok(Some(resolve(&self.manager, value)?)),
            None => Ok(None),
        }
    }

    fn iter(&self) -> Result<Box<dyn TableIterator>> {
        Ok(Box::new(BlobTableIterator {
            base: self.base.iter()?,
            manager: Arc::clone(&self.manager),
        }))
    }

    fn properties(&self) -> TableProperties {
        self.base.properties()
    }

    fn verify_checksum(&self) -> Result<()> {
        self.base.verify_checksum()
    }
}

/// Positions with the base iterator; dereferences lazily in `value`.
struct BlobTableIterator {
    base: Box<dyn TableIterator>,
    manager: Arc<BlobFileManager>,
}

impl TableIterator for BlobTableIterator {
    fn seek_to_first(&mut self) -> Result<()> {
        self.base.seek_to_first()
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        self.base.seek(target)
    }

    fn valid(&self) -> bool {
        self.base.valid()
    }

    fn next(&mut self) -> Result<()> {
        self.base.next()
    }

    fn key(&self) -> &[u8] {
        self.base.key()
    }

    fn value(&self) -> Result<Vec<u8>> {
        resolve(&self.manager, self.base.value()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::format::CompressionType;
    use crate::table::base::BaseTableFactory;
    use crate::tmpfs::TempDir;

    fn factory_pair(
        dir: &TempDir,
        config: BlobConfig,
    ) -> (BlobTableFactory, Arc<BlobFileManager>) {
        let manager = Arc::new(BlobFileManager::open(dir.path()).expect("manager open failed"));
        let factory =
            BlobTableFactory::new(Arc::new(BaseTableFactory), Arc::clone(&manager), config);
        (factory, manager)
    }

    fn build(
        factory: &BlobTableFactory,
        path: &std::path::Path,
        entries: &[(Vec<u8>, Vec<u8>)],
    ) -> TableBuildResult {
        let mut builder = factory.new_builder(path).expect("new_builder failed");
        for (key, value) in entries {
            builder.add(key, value).expect("add failed");
        }
        builder.finish().expect("finish failed")
    }

    fn collect(reader: &dyn TableReader) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut iter = reader.iter().expect("iter failed");
        iter.seek_to_first().expect("seek_to_first failed");
        let mut out = Vec::new();
        while iter.valid() {
            out.push((iter.key().to_vec(), iter.value().expect("value failed")));
            iter.next().expect("next failed");
        }
        out
    }

    #[test]
    fn test_small_values_pass_through() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let (factory, manager) =
            factory_pair(&dir, BlobConfig::new().min_blob_size(1024));
        let path = dir.path().join("1.sst");

        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..1000)
            .map(|i| {
                (
                    format!("key_{i:06}").into_bytes(),
                    format!("value_{i:06}xx").into_bytes(),
                )
            })
            .collect();
        let result = build(&factory, &path, &entries);

        assert!(result.blob_files.is_empty());
        assert_eq!(manager.file_count(), 0);

        // The table holds the raw values; no byte of any value carries the
        // pointer tag.
        let raw = BaseTableFactory.new_reader(&path).expect("open failed");
        let mut iter = raw.iter().expect("iter failed");
        iter.seek_to_first().expect("seek failed");
        while iter.valid() {
            assert_ne!(iter.value().expect("value failed")[0], BLOB_INDEX_TAG);
            iter.next().expect("next failed");
        }

        let reader = factory.new_reader(&path).expect("open failed");
        assert_eq!(collect(reader.as_ref()), entries);
    }

    #[test]
    fn test_large_values_are_separated() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let (factory, manager) = factory_pair(&dir, BlobConfig::new().min_blob_size(16));
        let path = dir.path().join("1.sst");

        let entries: Vec<(Vec<u8>, Vec<u8>)> = vec![
            (b"k1".to_vec(), vec![b'a'; 1024]),
            (b"k2".to_vec(), vec![b'b'; 1024]),
        ];
        let result = build(&factory, &path, &entries);

        // One blob file for the whole build, both records inside it in
        // insertion order.
        assert_eq!(result.blob_files.len(), 1);
        assert_eq!(manager.file_count(), 1);

        let raw = BaseTableFactory.new_reader(&path).expect("open failed");
        let first = BlobIndex::decode(
            &raw.get(b"k1").expect("get failed").expect("k1 missing"),
        )
        .expect("decode failed");
        let second = BlobIndex::decode(
            &raw.get(b"k2").expect("get failed").expect("k2 missing"),
        )
        .expect("decode failed");
        assert_eq!(first.file_number, result.blob_files[0]);
        assert_eq!(second.file_number, result.blob_files[0]);
        assert!(second.handle.offset > first.handle.offset);

        let reader = factory.new_reader(&path).expect("open failed");
        assert_eq!(
            reader.get(b"k1").expect("get failed"),
            Some(entries[0].1.clone())
        );
        assert_eq!(
            reader.get(b"k2").expect("get failed"),
            Some(entries[1].1.clone())
        );

        // A fresh manager over the same directory still resolves both.
        drop(reader);
        let manager = Arc::new(BlobFileManager::open(dir.path()).expect("reopen failed"));
        let factory = BlobTableFactory::new(
            Arc::new(BaseTableFactory),
            manager,
            BlobConfig::new().min_blob_size(16),
        );
        let reader = factory.new_reader(&path).expect("open failed");
        assert_eq!(collect(reader.as_ref()), entries);
    }

    #[test]
    fn test_order_preserved_at_any_threshold() {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..200)
            .map(|i| {
                let value = if i % 3 == 0 {
                    vec![b'v'; 512]
                } else {
                    format!("small_{i}").into_bytes()
                };
                (format!("key_{i:05}").into_bytes(), value)
            })
            .collect();

        for min_blob_size in [0, 64, u64::MAX] {
            let dir = TempDir::new().expect("failed to create temp dir");
            let (factory, _manager) =
                factory_pair(&dir, BlobConfig::new().min_blob_size(min_blob_size));
            let path = dir.path().join("1.sst");
            build(&factory, &path, &entries);

            let reader = factory.new_reader(&path).expect("open failed");
            assert_eq!(
                collect(reader.as_ref()),
                entries,
                "threshold {min_blob_size} changed the observed sequence"
            );
        }
    }

    #[test]
    fn test_disabled_separation_matches_base_output() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let (factory, manager) =
            factory_pair(&dir, BlobConfig::new().min_blob_size(u64::MAX));

        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..100)
            .map(|i| (format!("key_{i:04}").into_bytes(), vec![b'v'; 256]))
            .collect();

        let adapted = dir.path().join("adapted.sst");
        build(&factory, &adapted, &entries);

        let plain = dir.path().join("plain.sst");
        let mut builder = BaseTableFactory.new_builder(&plain).expect("builder failed");
        for (key, value) in &entries {
            builder.add(key, value).expect("add failed");
        }
        builder.finish().expect("finish failed");

        assert_eq!(
            std::fs::read(&adapted).expect("read failed"),
            std::fs::read(&plain).expect("read failed")
        );
        assert_eq!(manager.file_count(), 0);
    }

    #[test]
    fn test_reserved_first_byte_is_always_separated() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let (factory, manager) =
            factory_pair(&dir, BlobConfig::new().min_blob_size(1024));
        let path = dir.path().join("1.sst");

        // Short value, but its first byte collides with the pointer tag.
        let colliding = vec![BLOB_INDEX_TAG, 0xde, 0xad];
        build(
            &factory,
            &path,
            &[(b"k".to_vec(), colliding.clone())],
        );
        assert_eq!(manager.file_count(), 1);

        let reader = factory.new_reader(&path).expect("open failed");
        assert_eq!(reader.get(b"k").expect("get failed"), Some(colliding));
    }

    #[test]
    fn test_factory_impersonates_base() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let (factory, _manager) = factory_pair(&dir, BlobConfig::new());
        assert_eq!(factory.name(), BaseTableFactory.name());
        assert_eq!(factory.options_string(), BaseTableFactory.options_string());
    }

    #[test]
    fn test_missing_blob_file_reads_as_corruption() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let (factory, manager) = factory_pair(&dir, BlobConfig::new().min_blob_size(8));
        let path = dir.path().join("1.sst");
        let result = build(
            &factory,
            &path,
            &[(b"k".to_vec(), vec![b'v'; 64])],
        );

        // Simulate a reference-map violation: drop the file behind the
        // table's back.
        let number = result.blob_files[0];
        manager.reference(number).expect("reference failed");
        manager.release(number).expect("release failed");

        let reader = factory.new_reader(&path).expect("open failed");
        match reader.get(b"k") {
            Err(Error::Corruption("BlobIndex", reason)) => {
                assert!(reason.contains(&number.to_string()))
            }
            other => panic!("expected corruption, got {:?}", other),
        }
    }

    #[test]
    fn test_abandon_discards_table_and_blob_file() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let (factory, manager) = factory_pair(&dir, BlobConfig::new().min_blob_size(8));
        let path = dir.path().join("1.sst");

        let mut builder = factory.new_builder(&path).expect("new_builder failed");
        builder
            .add(b"k", vec![b'v'; 64].as_slice())
            .expect("add failed");
        builder.abandon().expect("abandon failed");

        assert!(!path.exists());
        assert_eq!(manager.file_count(), 0);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read_dir failed")
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry.path().extension().map(|ext| ext == "blob").unwrap_or(false)
            })
            .collect();
        assert!(leftovers.is_empty());
    }
}
