use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use super::{validate_key, BoxedReader, ByteStreamStore, StreamWriter};
use crate::error::StorageError;

/// One file per key under a root directory.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
    quota: Option<u64>,
}

impl DirStore {
    /// Use `root`, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, quota: None })
    }

    /// Like [`DirStore::new`], but refuse writes that would grow the directory past `bytes`.
    pub fn with_quota(root: impl Into<PathBuf>, bytes: u64) -> Result<Self, StorageError> {
        let mut store = Self::new(root)?;
        store.quota = Some(bytes);
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

fn used_bytes(root: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(root)? {
        let meta = entry?.metadata()?;
        if meta.is_file() {
            total += meta.len();
        }
    }
    Ok(total)
}

impl ByteStreamStore for DirStore {
    fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path(key)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn open_read(&self, key: &str) -> Result<BoxedReader, StorageError> {
        let file = File::open(self.path(key)?)?;
        Ok(Box::new(io::BufReader::new(file)))
    }

    fn open_write(&self, key: &str) -> Result<Box<dyn StreamWriter>, StorageError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.path(key)?)?;
        Ok(Box::new(DirWriter {
            file,
            written: 0,
            root: self.root.clone(),
            quota: self.quota,
        }))
    }

    fn remove(&self, key: &str) -> Result<bool, StorageError> {
        match fs::remove_file(self.path(key)?) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

struct DirWriter {
    file: File,
    written: u64,
    root: PathBuf,
    quota: Option<u64>,
}

impl StreamWriter for DirWriter {
    fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        if let Some(quota) = self.quota {
            if used_bytes(&self.root)? + data.len() as u64 > quota {
                return Err(StorageError::QuotaExceeded);
            }
        }
        if let Err(err) = self.file.write_all(data) {
            // Drop whatever part of `data` made it to disk.
            self.file.set_len(self.written)?;
            return Err(err.into());
        }
        self.written += data.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<(), StorageError> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn round_trips_through_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path().join("nested")).unwrap();

        assert!(!store.exists("a").unwrap());
        let mut w = store.open_write("a").unwrap();
        w.write(b"hello ").unwrap();
        w.write(b"world").unwrap();
        w.close().unwrap();

        assert!(store.exists("a").unwrap());
        assert_eq!(fs::read(store.root().join("a")).unwrap(), b"hello world");

        let mut out = Vec::new();
        store.open_read("a").unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello world");

        store.open_write("a").unwrap().close().unwrap();
        assert_eq!(fs::read(store.root().join("a")).unwrap(), b"");

        assert!(store.remove("a").unwrap());
        assert!(!store.remove("a").unwrap());
        assert!(matches!(store.open_read("a"), Err(StorageError::NotFound)));
    }

    #[test]
    fn rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.open_write("../escape"),
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(store.exists(".."), Err(StorageError::InvalidKey(_))));
    }

    #[test]
    fn quota_counts_every_file_in_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::with_quota(dir.path(), 10).unwrap();
        fs::write(dir.path().join("existing"), [0u8; 4]).unwrap();

        let mut w = store.open_write("k").unwrap();
        w.write(&[1; 5]).unwrap();
        assert_eq!(w.write(&[2; 2]), Err(StorageError::QuotaExceeded));
        w.close().unwrap();
        assert_eq!(fs::read(dir.path().join("k")).unwrap(), vec![1; 5]);
    }
}
