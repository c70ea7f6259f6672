//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: written by raft-server before any reply leaves a node, read once on startup
//! what: Storage trait, StorageError, FileStorage implementation, InMemoryStorage for testing

use raft_core::PersistentState;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// errors raised while reading or writing durable state
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] io::Error),

    #[error("storage codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// trait for durable storage of raft state
///
/// term, vote and log are saved together as one blob, so a reader never
/// sees a vote from one write paired with a log from another.
/// this abstraction allows the same server code to work with:
/// - real filesystem (native)
/// - in-memory (testing, simulated crashes)
pub trait Storage: Send {
    /// replace the stored state; must be durable once this returns Ok
    fn save(&mut self, state: &PersistentState) -> Result<(), StorageError>;

    /// load the stored state, or the initial state if nothing was ever saved
    fn load(&self) -> Result<PersistentState, StorageError>;

    /// clear all persisted state (for testing)
    fn clear(&mut self) -> Result<(), StorageError>;
}

impl<S: Storage + ?Sized> Storage for Box<S> {
    fn save(&mut self, state: &PersistentState) -> Result<(), StorageError> {
        (**self).save(state)
    }

    fn load(&self) -> Result<PersistentState, StorageError> {
        (**self).load()
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        (**self).clear()
    }
}

// -- file storage implementation --

const STATE_FILE: &str = "raft_state.json";
const TEMP_FILE: &str = "raft_state.tmp";

/// file-based storage implementation using std::fs
///
/// stores raft state in a directory as a single raft_state.json,
/// replaced atomically on every save
#[derive(Debug)]
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
}

impl FileStorage {
    /// create a new filestorage at the given directory
    /// creates the directory if it doesn't exist
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// get the path to the state file
    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    fn temp_path(&self) -> PathBuf {
        self.dir.join(TEMP_FILE)
    }
}

/// make a rename inside `dir` durable
#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

impl Storage for FileStorage {
    fn save(&mut self, state: &PersistentState) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(state)?;

        // atomic write: write to temp file, flush to disk, then rename over the old state
        let temp_path = self.temp_path();
        let mut file = File::create(&temp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.state_path())?;
        sync_dir(&self.dir)?;

        Ok(())
    }

    fn load(&self) -> Result<PersistentState, StorageError> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(PersistentState::default()); // default for new nodes
        }

        let mut file = File::open(&path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        Ok(serde_json::from_str(&contents)?)
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        for path in [self.state_path(), self.temp_path()] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

// -- in-memory storage implementation --

#[derive(Debug, Default)]
struct Shared {
    state: Option<PersistentState>,
    saves: usize,
}

/// in-memory storage for testing
///
/// clones share the same backing state, so a test can keep a handle while a
/// server owns another. `duplicate` takes an independent copy, which is how a
/// crashed server is handed exactly what it had persisted.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    shared: Arc<Mutex<Shared>>,
}

impl InMemoryStorage {
    /// create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }

    /// storage pre-filled with `state`, as if it had been saved once
    pub fn with_state(state: PersistentState) -> Self {
        let storage = Self::new();
        storage.shared.lock().state = Some(state);
        storage
    }

    /// independent copy of the current contents
    pub fn duplicate(&self) -> Self {
        let state = self.shared.lock().state.clone();
        Self {
            shared: Arc::new(Mutex::new(Shared { state, saves: 0 })),
        }
    }

    /// last saved state, if any
    pub fn snapshot(&self) -> Option<PersistentState> {
        self.shared.lock().state.clone()
    }

    /// number of successful saves through any clone
    pub fn save_count(&self) -> usize {
        self.shared.lock().saves
    }
}

impl Storage for InMemoryStorage {
    fn save(&mut self, state: &PersistentState) -> Result<(), StorageError> {
        let mut shared = self.shared.lock();
        shared.state = Some(state.clone());
        shared.saves += 1;
        Ok(())
    }

    fn load(&self) -> Result<PersistentState, StorageError> {
        Ok(self.shared.lock().state.clone().unwrap_or_default())
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        self.shared.lock().state = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft_core::LogEntry;
    use tempfile::tempdir;

    fn sample_state() -> PersistentState {
        PersistentState::new(
            5,
            Some(2),
            vec![LogEntry::new(1, 1, vec![1, 2, 3]), LogEntry::new(5, 2, vec![4, 5, 6])],
        )
    }

    #[test]
    fn directory_sync_follows_every_save() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path().join("node")).unwrap();

        sync_dir(storage.dir()).unwrap();
        for term in 1..=3 {
            storage.save(&PersistentState::new(term, None, vec![])).unwrap();
        }

        let reopened = FileStorage::new(dir.path().join("node")).unwrap();
        assert_eq!(reopened.load().unwrap().current_term, 3);
        assert!(!dir.path().join("node").join(TEMP_FILE).exists());
    }

    #[test]
    fn in_memory_storage_starts_empty() {
        let storage = InMemoryStorage::new();
        assert!(storage.load().unwrap().is_initial());
        assert!(storage.snapshot().is_none());
    }

    #[test]
    fn in_memory_storage_saves_and_loads() {
        let mut storage = InMemoryStorage::new();

        storage.save(&sample_state()).unwrap();

        assert_eq!(storage.load().unwrap(), sample_state());
        assert_eq!(storage.save_count(), 1);
    }

    #[test]
    fn in_memory_clones_share_state() {
        let mut storage = InMemoryStorage::new();
        let observer = storage.clone();

        storage.save(&sample_state()).unwrap();

        assert_eq!(observer.snapshot(), Some(sample_state()));
    }

    #[test]
    fn in_memory_duplicate_is_independent() {
        let mut storage = InMemoryStorage::new();
        storage.save(&sample_state()).unwrap();

        let copy = storage.duplicate();
        storage.save(&PersistentState::new(9, None, vec![])).unwrap();

        assert_eq!(copy.load().unwrap(), sample_state());
        assert_eq!(copy.save_count(), 0);
    }

    #[test]
    fn file_storage_saves_and_loads() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save(&sample_state()).unwrap();

        assert_eq!(storage.load().unwrap(), sample_state());
    }

    #[test]
    fn file_storage_survives_restart() {
        let dir = tempdir().unwrap();

        // first "session"
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.save(&sample_state()).unwrap();
        }

        // "restart" - new storage instance
        {
            let storage = FileStorage::new(dir.path()).unwrap();
            assert_eq!(storage.load().unwrap(), sample_state());
        }
    }

    #[test]
    fn file_storage_rejects_garbage() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        fs::write(storage.state_path(), b"{ not json").unwrap();

        assert!(matches!(storage.load(), Err(StorageError::Codec(_))));
    }

    #[test]
    fn boxed_storage_delegates() {
        let observer = InMemoryStorage::new();
        let mut boxed: Box<dyn Storage> = Box::new(observer.clone());

        boxed.save(&sample_state()).unwrap();

        assert_eq!(observer.snapshot(), Some(sample_state()));
    }
}
