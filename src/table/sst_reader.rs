//! Read-only access to a single table file outside any database instance.

use std::path::Path;

use crate::error::Result;

use super::{TableFactory, TableIterator, TableProperties, TableReader};

/// Cursor over one sealed table file.
///
/// Open the file through a blob-aware factory to have tagged values
/// dereferenced transparently, or through the base factory to see the raw
/// pointer bytes. Iterators are one-shot and invalid until seeked. A
/// reader may be shared across threads without external synchronization.
pub struct SstFileReader {
    reader: Box<dyn TableReader>,
}

impl SstFileReader {
    pub fn open(path: impl AsRef<Path>, factory: &dyn TableFactory) -> Result<Self> {
        Ok(Self {
            reader: factory.new_reader(path.as_ref())?,
        })
    }

    /// A fresh iterator over the file. Invalid until positioned with a
    /// seek.
    pub fn new_iterator(&self) -> Result<Box<dyn TableIterator>> {
        self.reader.iter()
    }

    pub fn read_table_properties(&self) -> TableProperties {
        self.reader.properties()
    }

    /// Checks the whole file for corruption.
    pub fn verify_checksum(&self) -> Result<()> {
        self.reader.verify_checksum()
    }
}
