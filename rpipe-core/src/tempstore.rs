use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tempfile::TempDir;

use crate::chunk::chunk_key;
use crate::error::Result;

/// Temp-area state for one pipeline run: a private scratch directory plus
/// the slot pool bounding how many chunks may occupy it. Owned by the run
/// and injected where needed, never ambient; the directory and anything
/// left in it are removed on drop.
pub struct TempStore {
    dir: TempDir,
    slots: Arc<Slots>,
}

impl TempStore {
    pub fn new(parent: &Path, capacity: usize) -> Result<Self> {
        std::fs::create_dir_all(parent)?;
        let dir = tempfile::Builder::new().prefix("rpipe-").tempdir_in(parent)?;
        Ok(Self { dir, slots: Arc::new(Slots::new(capacity)) })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Temp file path for a chunk, named like its remote key.
    pub fn chunk_path(&self, index: u64) -> PathBuf {
        self.dir.path().join(chunk_key(index))
    }

    /// Scratch path for non-chunk artifacts (manifest, fetched parity).
    pub fn scratch_path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn slots(&self) -> Arc<Slots> {
        Arc::clone(&self.slots)
    }
}

/// Counting slot pool. One slot stands for one chunk of local temp space
/// plus (while transferring) one in-flight transport operation. Capacity
/// is `jobs + 1`: one chunk being built while `jobs` transfer.
pub struct Slots {
    capacity: usize,
    in_use: Mutex<usize>,
    freed: Condvar,
    high_water: AtomicUsize,
}

impl Slots {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            in_use: Mutex::new(0),
            freed: Condvar::new(),
            high_water: AtomicUsize::new(0),
        }
    }

    /// Blocks until a slot is free. This is the backpressure point that
    /// suspends the chunk producer when the temp budget is exhausted.
    pub fn acquire(&self) {
        let mut used = self.in_use.lock().unwrap();
        while *used == self.capacity {
            used = self.freed.wait(used).unwrap();
        }
        *used += 1;
        self.high_water.fetch_max(*used, Ordering::Relaxed);
    }

    pub fn try_acquire(&self) -> bool {
        let mut used = self.in_use.lock().unwrap();
        if *used == self.capacity {
            return false;
        }
        *used += 1;
        self.high_water.fetch_max(*used, Ordering::Relaxed);
        true
    }

    pub fn release(&self) {
        let mut used = self.in_use.lock().unwrap();
        debug_assert!(*used > 0, "slot released twice");
        *used = used.saturating_sub(1);
        self.freed.notify_one();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        *self.in_use.lock().unwrap()
    }

    /// Highest simultaneous slot usage observed.
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }
}
