use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;

use super::format::{
    BlobEncoder, BlobFileFooter, BlobFileMeta, BlobHandle, BlobRecord, CompressionType,
    BLOB_HEADER_SIZE,
};

/// Appends records to a new blob file and seals it with a footer.
///
/// A writer has a single producer; each flush or compaction output stream
/// owns its own. The file stays invisible to readers until the manager
/// publishes it after `finish`.
pub struct BlobFileWriter {
    file: BufWriter<File>,
    path: PathBuf,
    file_number: u64,
    encoder: BlobEncoder,
    offset: u64,
    closed: bool,
}

impl BlobFileWriter {
    pub fn create(
        path: impl AsRef<Path>,
        file_number: u64,
        compression: CompressionType,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create_new(true).write(true).open(&path)?;
        Ok(Self {
            file: BufWriter::new(file),
            path,
            file_number,
            encoder: BlobEncoder::new(compression),
            offset: 0,
            closed: false,
        })
    }

    pub fn file_number(&self) -> u64 {
        self.file_number
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes appended so far.
    pub fn size(&self) -> u64 {
        self.offset
    }

    /// Appends one record and returns the handle locating its payload.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<BlobHandle> {
        let record = BlobRecord {
            key: key.to_vec(),
            value: value.to_vec(),
        };
        self.encoder.encode_record(&record)?;

        let handle = BlobHandle {
            offset: self.offset + BLOB_HEADER_SIZE as u64,
            size: self.encoder.payload().len() as u64,
        };
        self.file.write_all(self.encoder.header())?;
        self.file.write_all(self.encoder.payload())?;
        self.offset += self.encoder.encoded_size() as u64;
        Ok(handle)
    }

    /// Seals the file: appends the footer, flushes and fsyncs. The
    /// directory fence is the manager's responsibility.
    pub fn finish(mut self) -> Result<BlobFileMeta> {
        let encoded = BlobFileFooter::default().encode();
        self.file.write_all(&encoded)?;
        self.offset += encoded.len() as u64;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        self.closed = true;
        Ok(BlobFileMeta {
            file_number: self.file_number,
            file_size: self.offset,
        })
    }

    /// Discards the partial file. Used when the surrounding table build
    /// fails or is cancelled.
    pub fn abandon(mut self) -> Result<()> {
        self.closed = true;
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

impl Drop for BlobFileWriter {
    fn drop(&mut self) {
        // A writer dropped mid-build leaves no partial file behind.
        if !self.closed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
