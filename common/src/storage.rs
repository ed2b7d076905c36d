use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use crate::error::PersistenceError;

/// Byte-level access to the durable state document.
pub trait StateStorage {
    fn read(&self) -> Result<Vec<u8>, PersistenceError>;
    fn write(&self, document: &[u8]) -> Result<(), PersistenceError>;
}

/// Document on the local filesystem, replaced atomically on every write.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StateStorage for FileStorage {
    fn read(&self) -> Result<Vec<u8>, PersistenceError> {
        match fs::read(&self.path) {
            Ok(raw) => Ok(raw),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(PersistenceError::Open(err)),
            Err(err) => Err(PersistenceError::Read(err)),
        }
    }

    fn write(&self, document: &[u8]) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(PersistenceError::Open)?;
            }
        }

        // A crash mid-write leaves only the staging file damaged.
        let staging = self.staging_path();
        fs::write(&staging, document).map_err(PersistenceError::Write)?;
        fs::rename(&staging, &self.path).map_err(PersistenceError::Write)
    }
}

/// Shared in-memory document. Clones see the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryDocument>>,
}

#[derive(Debug, Default)]
struct MemoryDocument {
    contents: Option<Vec<u8>>,
    fail_writes: bool,
    writes: usize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(contents: impl Into<Vec<u8>>) -> Self {
        let storage = Self::default();
        storage.lock().contents = Some(contents.into());
        storage
    }

    pub fn contents(&self) -> Option<Vec<u8>> {
        self.lock().contents.clone()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Number of successful writes so far.
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryDocument> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StateStorage for MemoryStorage {
    fn read(&self) -> Result<Vec<u8>, PersistenceError> {
        self.lock().contents.clone().ok_or_else(|| {
            PersistenceError::Open(std::io::Error::new(
                ErrorKind::NotFound,
                "no state document stored",
            ))
        })
    }

    fn write(&self, document: &[u8]) -> Result<(), PersistenceError> {
        let mut doc = self.lock();
        if doc.fail_writes {
            return Err(PersistenceError::Write(std::io::Error::new(
                ErrorKind::Other,
                "simulated write failure",
            )));
        }
        doc.contents = Some(document.to_vec());
        doc.writes += 1;
        Ok(())
    }
}
