use std::path::PathBuf;

use crate::blob::format::CompressionType;

/// Options governing blob separation for one keyspace.
#[derive(Debug, Clone)]
pub struct BlobConfig {
    /// Values of at least this many bytes are written to a blob file;
    /// smaller values stay inline in the table. `u64::MAX` disables
    /// separation entirely. (default: 4096)
    pub min_blob_size: u64,

    /// Compression applied to each blob record. (default: None)
    pub blob_file_compression: CompressionType,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            min_blob_size: 4096,
            blob_file_compression: CompressionType::None,
        }
    }
}

impl BlobConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the separation threshold.
    pub fn min_blob_size(mut self, size: u64) -> Self {
        self.min_blob_size = size;
        self
    }

    /// Set the per-record compression algorithm.
    pub fn blob_file_compression(mut self, compression: CompressionType) -> Self {
        self.blob_file_compression = compression;
        self
    }
}

/// Configuration for a database handle.
///
/// The open wrapper separates every value by default (`min_blob_size = 0`);
/// raise the threshold to keep small values inline.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Directory holding tables and blob files alike.
    pub dir: PathBuf,

    /// Blob separation options.
    pub blob: BlobConfig,
}

impl DbConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            blob: BlobConfig::default().min_blob_size(0),
        }
    }

    /// Set the separation threshold.
    pub fn min_blob_size(mut self, size: u64) -> Self {
        self.blob.min_blob_size = size;
        self
    }

    /// Set the per-record compression algorithm.
    pub fn blob_file_compression(mut self, compression: CompressionType) -> Self {
        self.blob.blob_file_compression = compression;
        self
    }
}
