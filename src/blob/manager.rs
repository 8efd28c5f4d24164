use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{Error, Result};

use super::format::{BlobFileMeta, CompressionType};
use super::reader::BlobFileReader;
use super::writer::BlobFileWriter;

/// A live blob file tracked by the manager.
///
/// `refs` counts the tables whose indices point into this file; it moves
/// with table installs and drops, not with readers. The reader slot is a
/// per-file double-checked latch so opening the file for reads never holds
/// the manager lock during IO.
pub struct BlobFile {
    meta: BlobFileMeta,
    refs: AtomicU64,
    reader: RwLock<Option<Arc<BlobFileReader>>>,
}

impl BlobFile {
    fn new(meta: BlobFileMeta) -> Self {
        Self {
            meta,
            refs: AtomicU64::new(0),
            reader: RwLock::new(None),
        }
    }

    pub fn meta(&self) -> BlobFileMeta {
        self.meta
    }

    pub fn refs(&self) -> u64 {
        self.refs.load(Ordering::SeqCst)
    }
}

/// Tracks the set of live blob files for one database directory.
///
/// All map mutations and lookups serialize through a single lock; nothing
/// IO-bound runs under it. File numbers come from a monotonic counter
/// shared with the enclosing engine so table and blob numbers never
/// collide.
pub struct BlobFileManager {
    dir: PathBuf,
    next_file_number: AtomicU64,
    files: RwLock<HashMap<u64, Arc<BlobFile>>>,
    obsolete: Mutex<Vec<u64>>,
}

impl BlobFileManager {
    /// Opens the manager for a directory, re-registering any blob files
    /// already present and seeding the number allocator past them.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut files = HashMap::new();
        let mut max_number = 0;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(file_number) = parse_blob_file_number(&path) else {
                continue;
            };
            let meta = BlobFileMeta {
                file_number,
                file_size: entry.metadata()?.len(),
            };
            files.insert(file_number, Arc::new(BlobFile::new(meta)));
            max_number = max_number.max(file_number);
        }

        Ok(Self {
            dir,
            next_file_number: AtomicU64::new(max_number + 1),
            files: RwLock::new(files),
            obsolete: Mutex::new(Vec::new()),
        })
    }

    /// Allocates a fresh file number.
    pub fn next_file_number(&self) -> u64 {
        self.next_file_number.fetch_add(1, Ordering::SeqCst)
    }

    /// Ensures future allocations start at or after `number`. Called by the
    /// enclosing engine when it has handed out numbers of its own.
    pub fn advance_file_number(&self, number: u64) {
        self.next_file_number.fetch_max(number, Ordering::SeqCst);
    }

    pub fn blob_file_path(&self, file_number: u64) -> PathBuf {
        self.dir.join(format!("{file_number:08}.blob"))
    }

    /// Creates a writer for a new blob file. The file stays unpublished
    /// until `finish` seals and registers it.
    pub fn new_file(&self, compression: CompressionType) -> Result<BlobFileWriter> {
        let file_number = self.next_file_number();
        BlobFileWriter::create(self.blob_file_path(file_number), file_number, compression)
    }

    /// Seals a writer, fences it behind a directory sync and publishes the
    /// file. Handles into the file are readable from here on.
    pub fn finish(&self, writer: BlobFileWriter) -> Result<BlobFileMeta> {
        let meta = writer.finish()?;
        self.sync_dir()?;

        let mut files = self.files.write().unwrap();
        files.insert(meta.file_number, Arc::new(BlobFile::new(meta)));
        tracing::info!(
            file_number = meta.file_number,
            file_size = meta.file_size,
            "sealed blob file"
        );
        Ok(meta)
    }

    fn find(&self, file_number: u64) -> Result<Arc<BlobFile>> {
        self.files
            .read()
            .unwrap()
            .get(&file_number)
            .cloned()
            .ok_or(Error::FileNotFound(file_number))
    }

    /// Returns a shared reader for a published file, opening it on first
    /// use. The open happens outside the manager lock; the per-file latch
    /// keeps concurrent first opens from racing.
    pub fn open_reader(&self, file_number: u64) -> Result<Arc<BlobFileReader>> {
        let file = self.find(file_number)?;
        if let Some(reader) = file.reader.read().unwrap().as_ref() {
            return Ok(Arc::clone(reader));
        }
        let mut slot = file.reader.write().unwrap();
        if let Some(reader) = slot.as_ref() {
            // Lost the race to another opener; reuse its handle.
            return Ok(Arc::clone(reader));
        }
        let reader = Arc::new(BlobFileReader::open(self.blob_file_path(file_number))?);
        *slot = Some(Arc::clone(&reader));
        Ok(reader)
    }

    /// Records one more table referencing this file.
    pub fn reference(&self, file_number: u64) -> Result<()> {
        let file = self.find(file_number)?;
        file.refs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Drops one table reference. A file whose count reaches zero leaves
    /// the live set and joins the obsolete list; when to actually collect
    /// it is the caller's policy.
    pub fn release(&self, file_number: u64) -> Result<()> {
        let file = self.find(file_number)?;
        let previous = file
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |refs| {
                refs.checked_sub(1)
            })
            .map_err(|_| {
                Error::InvalidArgument(format!(
                    "release of unreferenced blob file {file_number}"
                ))
            })?;
        if previous == 1 {
            self.files.write().unwrap().remove(&file_number);
            self.obsolete.lock().unwrap().push(file_number);
            tracing::info!(file_number, "blob file obsolete");
        }
        Ok(())
    }

    /// Current reference count of a tracked file.
    pub fn references(&self, file_number: u64) -> Result<u64> {
        Ok(self.find(file_number)?.refs())
    }

    /// File numbers whose reference count has dropped to zero.
    pub fn obsolete_files(&self) -> Vec<u64> {
        self.obsolete.lock().unwrap().clone()
    }

    /// Unlinks every obsolete file. This is the collection hook; callers
    /// decide when to invoke it.
    pub fn remove_obsolete_files(&self) -> Result<()> {
        let numbers = std::mem::take(&mut *self.obsolete.lock().unwrap());
        for (at, &file_number) in numbers.iter().enumerate() {
            if let Err(err) = fs::remove_file(self.blob_file_path(file_number)) {
                // Keep whatever we could not unlink for the next attempt.
                self.obsolete.lock().unwrap().extend(&numbers[at..]);
                return Err(err.into());
            }
            tracing::info!(file_number, "removed obsolete blob file");
        }
        self.sync_dir()
    }

    /// Metadata for every live (published) file.
    pub fn files(&self) -> Vec<BlobFileMeta> {
        self.files
            .read()
            .unwrap()
            .values()
            .map(|file| file.meta())
            .collect()
    }

    pub fn file_count(&self) -> usize {
        self.files.read().unwrap().len()
    }

    fn sync_dir(&self) -> Result<()> {
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

fn parse_blob_file_number(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.strip_suffix(".blob")?.parse().ok()
}
