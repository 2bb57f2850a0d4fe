use std::path::PathBuf;

use crate::error::{PipeError, Result};

/// Chunk size for splitting the transfer (8 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 8 << 20;
/// Block size for reads and writes (64 KiB).
pub const DEFAULT_BLOCK_SIZE: usize = 64 << 10;
/// Simultaneous transfer jobs. Two lets an upload overlap chunk building.
pub const DEFAULT_JOBS: usize = 2;
/// Bounded retry count for transient transport failures.
pub const DEFAULT_RETRIES: u32 = 10;

/// Settings for one pipeline run.
#[derive(Clone, Debug)]
pub struct PipeConfig {
    pub chunk_size: usize,
    pub block_size: usize,
    pub tempdir: PathBuf,
    pub jobs: usize,
    pub retries: u32,
    /// Skip checksum comparison (e.g. crypto remotes).
    pub skip_check: bool,
    /// Upload a parity object alongside each chunk.
    pub parity: bool,
    /// Attempt repair on checksum mismatch during replay.
    pub repair: bool,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            tempdir: std::env::temp_dir(),
            jobs: DEFAULT_JOBS,
            retries: DEFAULT_RETRIES,
            skip_check: false,
            parity: false,
            repair: false,
        }
    }
}

impl PipeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.jobs < 1 {
            return Err(PipeError::IncompatibleOptions("jobs must be at least 1".into()));
        }
        if self.block_size == 0 || self.chunk_size == 0 {
            return Err(PipeError::IncompatibleOptions(
                "chunk and block sizes must be non-zero".into(),
            ));
        }
        if self.block_size > self.chunk_size {
            return Err(PipeError::IncompatibleOptions(
                "block size must not exceed chunk size".into(),
            ));
        }
        if self.skip_check && self.repair {
            return Err(PipeError::IncompatibleOptions(
                "repair needs checksum verification; drop --nocheck".into(),
            ));
        }
        Ok(())
    }

    /// Temp-slot budget: `jobs` chunks in flight plus one being built.
    pub fn slot_capacity(&self) -> usize {
        self.jobs + 1
    }
}
