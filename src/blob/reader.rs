use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::error::{Error, Result};

use super::format::{BlobDecoder, BlobFileFooter, BlobHandle, BlobRecord, BLOB_HEADER_SIZE};
use super::iterator::BlobFileIterator;

/// Read-only view of a sealed blob file.
///
/// The footer is decoded and verified once at open; a file that fails the
/// footer check is unusable. Lookups are a single positional read each, so
/// one reader can be shared across threads without synchronization.
pub struct BlobFileReader {
    file: File,
    file_size: u64,
    footer: BlobFileFooter,
}

impl BlobFileReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < BlobFileFooter::ENCODED_LENGTH as u64 {
            return Err(Error::corruption(
                "BlobFileFooter",
                "file too small to hold a footer",
            ));
        }
        let mut buf = [0u8; BlobFileFooter::ENCODED_LENGTH];
        file.read_exact_at(&mut buf, file_size - BlobFileFooter::ENCODED_LENGTH as u64)?;
        let footer = BlobFileFooter::decode(&buf)?;
        Ok(Self {
            file,
            file_size,
            footer,
        })
    }

    pub fn footer(&self) -> &BlobFileFooter {
        &self.footer
    }

    /// First byte past the record region.
    pub(super) fn data_end(&self) -> u64 {
        self.file_size - BlobFileFooter::ENCODED_LENGTH as u64
    }

    pub(super) fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Reads, checks and decodes the record a handle points at.
    pub fn get(&self, handle: &BlobHandle) -> Result<BlobRecord> {
        if handle.offset < BLOB_HEADER_SIZE as u64
            || handle.offset.checked_add(handle.size).is_none()
            || handle.offset + handle.size > self.data_end()
        {
            return Err(Error::Corruption(
                "BlobHandle",
                format!(
                    "out of bounds: offset {} size {} in a file of {} data bytes",
                    handle.offset,
                    handle.size,
                    self.data_end()
                ),
            ));
        }

        // Header and payload in one read.
        let mut buf = vec![0u8; BLOB_HEADER_SIZE + handle.size as usize];
        self.read_at(&mut buf, handle.offset - BLOB_HEADER_SIZE as u64)?;

        let mut src = buf.as_slice();
        let mut decoder = BlobDecoder::default();
        decoder.decode_header(&mut src)?;
        if decoder.record_size() as u64 != handle.size {
            return Err(Error::Corruption(
                "BlobRecord",
                format!(
                    "header size {} disagrees with handle size {}",
                    decoder.record_size(),
                    handle.size
                ),
            ));
        }
        let mut record = BlobRecord::default();
        let mut scratch = Vec::new();
        decoder.decode_record(&mut src, &mut record, &mut scratch)?;
        Ok(record)
    }

    /// Sequential cursor over every record in the file, in append order.
    pub fn iter(&self) -> BlobFileIterator<'_> {
        BlobFileIterator::new(self)
    }

    /// Re-reads and checksum-verifies every record in the file.
    pub fn verify_checksums(&self) -> Result<()> {
        for entry in self.iter() {
            entry?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::format::CompressionType;
    use crate::blob::writer::BlobFileWriter;
    use crate::tmpfs::TempDir;
    use std::sync::Arc;

    fn write_blob_file(
        dir: &TempDir,
        name: &str,
        compression: CompressionType,
        entries: &[(&[u8], Vec<u8>)],
    ) -> (std::path::PathBuf, Vec<BlobHandle>) {
        let path = dir.path().join(name);
        let mut writer = BlobFileWriter::create(&path, 1, compression).expect("create failed");
        let handles = entries
            .iter()
            .map(|(key, value)| writer.add(key, value).expect("add failed"))
            .collect();
        writer.finish().expect("finish failed");
        (path, handles)
    }

    #[test]
    fn test_get_returns_written_records() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let entries: Vec<(&[u8], Vec<u8>)> = vec![
            (b"k1", b"v1".to_vec()),
            (b"k2", vec![b'x'; 4096]),
            (b"k3", Vec::new()),
        ];
        let (path, handles) =
            write_blob_file(&dir, "00000001.blob", CompressionType::None, &entries);

        let reader = BlobFileReader::open(&path).expect("open failed");
        for ((key, value), handle) in entries.iter().zip(&handles) {
            let record = reader.get(handle).expect("get failed");
            assert_eq!(record.key, *key);
            assert_eq!(record.value, *value);
        }
    }

    #[test]
    fn test_get_roundtrips_compressed_records() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let entries: Vec<(&[u8], Vec<u8>)> = vec![(b"big", vec![b'a'; 8192])];
        let (path, handles) =
            write_blob_file(&dir, "00000001.blob", CompressionType::Snappy, &entries);

        // The handle carries the on-disk size, which must be the
        // compressed one.
        assert!(handles[0].size < 8192);

        let reader = BlobFileReader::open(&path).expect("open failed");
        let record = reader.get(&handles[0]).expect("get failed");
        assert_eq!(record.value, entries[0].1);
    }

    #[test]
    fn test_open_rejects_unsealed_file() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("truncated.blob");
        std::fs::write(&path, vec![0u8; 5]).expect("write failed");
        assert!(matches!(
            BlobFileReader::open(&path),
            Err(Error::Corruption("BlobFileFooter", _))
        ));

        // A record region without a footer is not a blob file either.
        let garbage = dir.path().join("headless.blob");
        std::fs::write(&garbage, vec![0u8; 128]).expect("write failed");
        assert!(matches!(
            BlobFileReader::open(&garbage),
            Err(Error::Corruption("BlobFileFooter", _))
        ));
    }

    #[test]
    fn test_get_rejects_out_of_bounds_handle() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let (path, _) = write_blob_file(
            &dir,
            "00000001.blob",
            CompressionType::None,
            &[(b"k", b"v".to_vec())],
        );
        let reader = BlobFileReader::open(&path).expect("open failed");

        for handle in [
            BlobHandle { offset: 0, size: 4 },
            BlobHandle {
                offset: 12,
                size: 1 << 30,
            },
            BlobHandle {
                offset: u64::MAX,
                size: 1,
            },
        ] {
            assert!(matches!(
                reader.get(&handle),
                Err(Error::Corruption(_, _))
            ));
        }
    }

    #[test]
    fn test_torn_record_detected() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let (path, handles) = write_blob_file(
            &dir,
            "00000001.blob",
            CompressionType::None,
            &[(b"key", b"a value long enough to damage".to_vec())],
        );

        let mut bytes = std::fs::read(&path).expect("read failed");
        bytes[handles[0].offset as usize + 3] ^= 0x01;
        std::fs::write(&path, &bytes).expect("write failed");

        let reader = BlobFileReader::open(&path).expect("open failed");
        match reader.get(&handles[0]) {
            Err(Error::Corruption("BlobRecord", reason)) => {
                assert_eq!(reason, "checksum mismatch")
            }
            other => panic!("expected checksum corruption, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_shared_gets() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..256)
            .map(|i| {
                (
                    format!("key_{i:04}").into_bytes(),
                    format!("value_{i:04}_{}", "p".repeat(64)).into_bytes(),
                )
            })
            .collect();

        let path = dir.path().join("00000001.blob");
        let mut writer =
            BlobFileWriter::create(&path, 1, CompressionType::None).expect("create failed");
        let handles: Vec<BlobHandle> = entries
            .iter()
            .map(|(key, value)| writer.add(key, value).expect("add failed"))
            .collect();
        writer.finish().expect("finish failed");

        let reader = Arc::new(BlobFileReader::open(&path).expect("open failed"));
        let entries = Arc::new(entries);
        let handles = Arc::new(handles);

        let mut tasks = Vec::new();
        for task_id in 0..8 {
            let reader = Arc::clone(&reader);
            let entries = Arc::clone(&entries);
            let handles = Arc::clone(&handles);
            tasks.push(tokio::spawn(async move {
                for round in 0..4 {
                    for i in 0..entries.len() {
                        let at = (i + task_id * 31 + round * 7) % entries.len();
                        let record = reader.get(&handles[at]).expect("get failed");
                        assert_eq!(record.key, entries[at].0);
                        assert_eq!(record.value, entries[at].1);
                    }
                }
            }));
        }
        for task in tasks {
            task.await.expect("reader task panicked");
        }
    }
}
