//! Shared library directory guard
//!
//! Installing a library mutates the toolchain's library folder, which every
//! session on the machine shares. [`LibraryLocks`] hands out one async mutex
//! per directory path; callers create a registry once and pass it to every
//! session that should coordinate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

/// Registry of per-directory install locks
#[derive(Debug, Clone, Default)]
pub struct LibraryLocks {
    inner: Arc<Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>>,
}

impl LibraryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for a library directory; handles for the same path share a lock
    pub fn directory(&self, path: impl AsRef<Path>) -> LibraryDirectory {
        let path = path.as_ref().to_path_buf();
        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let lock = map
            .entry(path.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        LibraryDirectory { path, lock }
    }

    /// Number of distinct directories handed out so far
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A toolchain library directory plus its install lock.
#[derive(Debug, Clone)]
pub struct LibraryDirectory {
    path: PathBuf,
    lock: Arc<AsyncMutex<()>>,
}

impl LibraryDirectory {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for exclusive install access
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    /// Whether two handles guard the same directory
    pub fn shares_lock_with(&self, other: &LibraryDirectory) -> bool {
        Arc::ptr_eq(&self.lock, &other.lock)
    }
}
