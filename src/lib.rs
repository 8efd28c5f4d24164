//! shaledb: blob-separated key-value storage.
//!
//! Large values are stored out-of-band in append-only blob files while the
//! sorted tables keep only small tagged pointers, so rewriting a table
//! moves a few bytes per entry instead of the values themselves. See the
//! [`blob`] module for the on-disk format and the [`table`] module for the
//! factory adapter that splices blob separation under an existing table
//! format.

pub mod blob;
pub mod config;
pub mod db;
pub mod error;
pub mod table;
pub mod tmpfs;

pub use blob::{BlobFileManager, BlobHandle, BlobIndex, BlobRecord, CompressionType};
pub use config::{BlobConfig, DbConfig};
pub use db::Db;
pub use error::{Error, Result};
pub use table::{BaseTableFactory, BlobTableFactory, SstFileReader};
