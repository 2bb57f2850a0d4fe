use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chunk::MANIFEST_KEY;
use crate::error::{PipeError, Result};
use crate::tempstore::TempStore;
use crate::transport::Transport;

/// Metadata for one chunk, immutable once recorded.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChunkRecord {
    pub index: u64,
    pub size: u64,
    pub checksum_hex: String,
    pub has_parity: bool,
}

/// The finalized, ordered record of every chunk plus the whole-stream
/// digest. Authoritative for replay ordering and verify/repair targeting.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Manifest {
    pub created_utc: String,
    pub chunk_size: usize,
    pub block_size: usize,
    pub total_chunks: u64,
    pub total_bytes: u64,
    pub stream_checksum_hex: String,
    pub chunks: Vec<ChunkRecord>,
}

impl Manifest {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let m: Manifest = serde_json::from_slice(bytes)?;
        m.check_dense()?;
        Ok(m)
    }

    /// Downloads and parses the remote manifest. Replay reads it once, in
    /// full, before any chunk transfer begins.
    pub fn fetch(transport: &dyn Transport, store: &TempStore) -> Result<Self> {
        let path = store.scratch_path(MANIFEST_KEY);
        transport.download(MANIFEST_KEY, &path)?;
        let bytes = std::fs::read(&path)?;
        std::fs::remove_file(&path)?;
        Self::from_json(&bytes)
    }

    pub fn record(&self, index: u64) -> Option<&ChunkRecord> {
        self.chunks.get(index as usize).filter(|r| r.index == index)
    }

    // Indices must be exactly 0..total_chunks with no gaps or duplicates.
    fn check_dense(&self) -> Result<()> {
        if self.chunks.len() as u64 != self.total_chunks {
            return Err(PipeError::IncompleteManifest {
                expected: self.total_chunks,
                recorded: self.chunks.len() as u64,
            });
        }
        for (pos, rec) in self.chunks.iter().enumerate() {
            if rec.index != pos as u64 {
                return Err(PipeError::IncompleteManifest {
                    expected: self.total_chunks,
                    recorded: pos as u64,
                });
            }
        }
        Ok(())
    }
}

/// Append-only manifest under construction. Shared by the scheduler
/// workers: whichever chunk completes first registers first, keyed by
/// index, so completion order never leaks into the manifest.
pub struct ManifestBuilder {
    chunk_size: usize,
    block_size: usize,
    records: Mutex<BTreeMap<u64, ChunkRecord>>,
}

impl ManifestBuilder {
    pub fn new(chunk_size: usize, block_size: usize) -> Self {
        Self { chunk_size, block_size, records: Mutex::new(BTreeMap::new()) }
    }

    /// Registers a chunk. Idempotent per index: a duplicate with the same
    /// checksum is a no-op; a duplicate with a different checksum means
    /// the write path is corrupted and is fatal.
    pub fn record(&self, index: u64, size: u64, checksum_hex: &str, has_parity: bool) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        if let Some(existing) = records.get(&index) {
            if existing.checksum_hex == checksum_hex {
                return Ok(());
            }
            return Err(PipeError::ManifestConflict {
                index,
                recorded: existing.checksum_hex.clone(),
                offered: checksum_hex.to_string(),
            });
        }
        debug!(index, size, "manifest record");
        records.insert(
            index,
            ChunkRecord { index, size, checksum_hex: checksum_hex.to_string(), has_parity },
        );
        Ok(())
    }

    pub fn recorded(&self) -> u64 {
        self.records.lock().unwrap().len() as u64
    }

    /// Seals the manifest. Every index in `0..total_chunks` must have been
    /// recorded; gaps or a short count are fatal.
    pub fn finalize(
        &self,
        total_chunks: u64,
        total_bytes: u64,
        stream_checksum_hex: &str,
    ) -> Result<Manifest> {
        let records = self.records.lock().unwrap();
        if records.len() as u64 != total_chunks {
            return Err(PipeError::IncompleteManifest {
                expected: total_chunks,
                recorded: records.len() as u64,
            });
        }
        for (pos, index) in records.keys().enumerate() {
            if *index != pos as u64 {
                return Err(PipeError::IncompleteManifest {
                    expected: total_chunks,
                    recorded: pos as u64,
                });
            }
        }
        Ok(Manifest {
            created_utc: chrono::Utc::now().to_rfc3339(),
            chunk_size: self.chunk_size,
            block_size: self.block_size,
            total_chunks,
            total_bytes,
            stream_checksum_hex: stream_checksum_hex.to_string(),
            chunks: records.values().cloned().collect(),
        })
    }
}
