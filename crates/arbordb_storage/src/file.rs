//! File-based segment backend for persistent storage.

use crate::backend::SegmentBackend;
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// File name extension of segment files.
const SEGMENT_EXT: &str = "seg";

/// Name of the directory lock file.
const LOCK_FILE: &str = ".lock";

/// A file-based segment backend.
///
/// Each segment is stored as one file named after its identity in
/// canonical UUID form, e.g. `a72a1838-9c5e-4a3b-b612-7c91e2f40d55.seg`.
/// The backend takes an advisory lock on the directory so only one process
/// writes it at a time.
///
/// # Durability
///
/// `store` writes the bytes to a temporary file, syncs it and renames it
/// into place, so a segment file is either absent or complete.
#[derive(Debug)]
pub struct FileBackend {
    dir: PathBuf,
    // Held for the lifetime of the backend; releasing the handle drops the
    // advisory lock.
    _lock: File,
}

impl FileBackend {
    /// Opens or creates a file backend in the given directory.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another process holds the
    /// directory, or an I/O error if the directory cannot be created.
    pub fn open(dir: &Path) -> StorageResult<Self> {
        fs::create_dir_all(dir)?;

        let lock_path = dir.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        lock.try_lock_exclusive()
            .map_err(|_| StorageError::Locked { path: lock_path })?;

        Ok(Self {
            dir: dir.to_path_buf(),
            _lock: lock,
        })
    }

    /// Returns the backend directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn segment_path(&self, msb: u64, lsb: u64) -> PathBuf {
        let name = format!("{}.{SEGMENT_EXT}", Uuid::from_u64_pair(msb, lsb));
        self.dir.join(name)
    }
}

impl SegmentBackend for FileBackend {
    fn contains(&self, msb: u64, lsb: u64) -> StorageResult<bool> {
        Ok(self.segment_path(msb, lsb).exists())
    }

    fn load(&self, msb: u64, lsb: u64) -> StorageResult<Option<Vec<u8>>> {
        match fs::read(self.segment_path(msb, lsb)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, msb: u64, lsb: u64, data: &[u8]) -> StorageResult<()> {
        let path = self.segment_path(msb, lsb);
        let tmp = path.with_extension("tmp");

        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn ids(&self) -> StorageResult<Vec<(u64, u64)>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(stem) = name.strip_suffix(&format!(".{SEGMENT_EXT}")) else {
                continue;
            };
            let uuid = Uuid::parse_str(stem).map_err(|_| StorageError::InvalidSegmentFile {
                name: name.into_owned(),
            })?;
            ids.push(uuid.as_u64_pair());
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_store_and_load() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();

        backend.store(3, 9, b"persistent").unwrap();
        assert!(backend.contains(3, 9).unwrap());
        assert_eq!(backend.load(3, 9).unwrap(), Some(b"persistent".to_vec()));
    }

    #[test]
    fn file_load_missing_is_none() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        assert_eq!(backend.load(1, 2).unwrap(), None);
    }

    #[test]
    fn file_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let backend = FileBackend::open(dir.path()).unwrap();
            backend.store(5, 6, b"kept").unwrap();
        }
        let backend = FileBackend::open(dir.path()).unwrap();
        assert_eq!(backend.load(5, 6).unwrap(), Some(b"kept".to_vec()));
    }

    #[test]
    fn file_ids_lists_segments_only() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        backend.store(1, 2, b"a").unwrap();
        backend.store(3, 4, b"b").unwrap();

        let mut ids = backend.ids().unwrap();
        ids.sort_unstable();
        assert_eq!(ids, vec![(1, 2), (3, 4)]);
    }

    #[test]
    fn file_lock_excludes_second_backend() {
        let dir = tempdir().unwrap();
        let _first = FileBackend::open(dir.path()).unwrap();
        let second = FileBackend::open(dir.path());
        assert!(matches!(second, Err(StorageError::Locked { .. })));
    }
}
