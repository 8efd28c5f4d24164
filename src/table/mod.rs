//! Sorted-table layer.
//!
//! Tables are produced and consumed through a small family of capability
//! traits so that the blob adapter can wrap any base implementation by
//! composition: [`BlobTableFactory`] decorates a [`TableFactory`] and routes
//! large values into blob files on the way in and back out of them on the
//! way out, while everything else passes straight through.
//!
//! Builders receive keys in strictly ascending bytewise order and readers
//! serve point lookups and one-shot cursors over the sealed file.

use std::path::Path;

use crate::error::Result;

pub mod base;
pub mod blob;
pub mod sst_reader;

pub use base::BaseTableFactory;
pub use blob::BlobTableFactory;
pub use sst_reader::SstFileReader;

/// Summary of one sealed table file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableProperties {
    pub num_entries: u64,
    pub data_size: u64,
    pub index_size: u64,
}

/// Outcome of a finished table build.
#[derive(Debug, Clone, Default)]
pub struct TableBuildResult {
    pub num_entries: u64,
    /// Blob files this table now references. The caller installs these
    /// references with the blob file manager when it installs the table.
    pub blob_files: Vec<u64>,
}

/// Produces builders and readers for one table format.
pub trait TableFactory: Send + Sync {
    /// The format name persisted in option files.
    fn name(&self) -> &'static str;

    /// Human-readable rendering of the factory's options, persisted
    /// alongside the name.
    fn options_string(&self) -> String {
        String::new()
    }

    fn new_builder(&self, path: &Path) -> Result<Box<dyn TableBuilder>>;

    fn new_reader(&self, path: &Path) -> Result<Box<dyn TableReader>>;
}

/// Accumulates one table file. Keys must arrive in strictly ascending
/// bytewise order; values are opaque bytes.
pub trait TableBuilder {
    fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Seals the table file durably.
    fn finish(&mut self) -> Result<TableBuildResult>;

    /// Discards the partial table and any side files it produced.
    fn abandon(&mut self) -> Result<()>;
}

/// Read-only access to one sealed table. Implementations are safe to share
/// across threads.
pub trait TableReader: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// A fresh cursor over the table. Cursors are independent of each
    /// other and of the reader's lifetime.
    fn iter(&self) -> Result<Box<dyn TableIterator>>;

    fn properties(&self) -> TableProperties;

    /// Re-reads the table and verifies its checksums.
    fn verify_checksum(&self) -> Result<()>;
}

/// One-shot cursor over a table.
///
/// A freshly created iterator is invalid until positioned with one of the
/// seek methods. Values materialize on [`TableIterator::value`], not on
/// positioning, so walking keys never touches out-of-band storage.
pub trait TableIterator {
    fn seek_to_first(&mut self) -> Result<()>;

    /// Positions at the first entry with key >= `target`.
    fn seek(&mut self, target: &[u8]) -> Result<()>;

    fn valid(&self) -> bool;

    /// Advances past the current entry. A no-op on an invalid iterator.
    fn next(&mut self) -> Result<()>;

    /// Key at the current position. Empty unless `valid` holds.
    fn key(&self) -> &[u8];

    /// Value at the current position, materialized on demand.
    fn value(&self) -> Result<Vec<u8>>;
}
