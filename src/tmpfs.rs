//! Scratch directories for tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_DIR_ID: AtomicU64 = AtomicU64::new(0);

/// A self-cleaning scratch directory.
///
/// Every instance owns a fresh subdirectory of the system temp dir, named
/// by process id plus a process-wide counter so concurrently running tests
/// never collide. The directory and everything in it is removed on drop.
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn new() -> std::io::Result<Self> {
        let base = std::env::temp_dir();
        loop {
            let id = NEXT_DIR_ID.fetch_add(1, Ordering::Relaxed);
            let path = base.join(format!("shaledb-{}-{id}", std::process::id()));
            // Creating the directory claims the name; a leftover from an
            // earlier run just advances the counter.
            match fs::create_dir(&path) {
                Ok(()) => return Ok(Self { path }),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}
