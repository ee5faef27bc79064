// Directory Lock
//
// Exclusive ownership of a store directory for as long as the guard
// lives. The lock is an OS file lock on `store.lock`, so it goes away
// with the process that held it; the file itself stays behind and
// carries no meaning on its own.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use super::StoreError;

pub const LOCK_FILE: &str = "store.lock";

#[derive(Debug)]
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl DirLock {
    pub fn acquire(dir: &Path) -> Result<Self, StoreError> {
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { file, path }),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Err(StoreError::Locked {
                dir: dir.to_path_buf(),
            }),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// Unlock now instead of waiting for the guard to drop.
    pub fn release(self) -> Result<(), StoreError> {
        FileExt::unlock(&self.file).map_err(|e| StoreError::io(&self.path, e))
    }
}
