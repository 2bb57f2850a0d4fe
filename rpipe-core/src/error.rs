use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the streaming pipelines.
///
/// Chunk-local failures carry the chunk index so the caller can name the
/// offending object; transport failures carry a transient flag consulted
/// by the scheduler's retry loop.
#[derive(Debug, Error)]
pub enum PipeError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("temp directory {dir:?} cannot hold another chunk")]
    TempSpace { dir: PathBuf },

    #[error("transport {op} failed for {key}: {msg}")]
    Transport { op: &'static str, key: String, msg: String, transient: bool },

    #[error("manifest conflict at chunk {index}: recorded {recorded}, offered {offered}")]
    ManifestConflict { index: u64, recorded: String, offered: String },

    #[error("manifest incomplete: {recorded} of {expected} chunks recorded")]
    IncompleteManifest { expected: u64, recorded: u64 },

    #[error("checksum mismatch for chunk {index}: expected {expected}, got {actual}")]
    ChecksumMismatch { index: u64, expected: String, actual: String },

    #[error("stream checksum mismatch: expected {expected}, got {actual}")]
    StreamChecksumMismatch { expected: String, actual: String },

    #[error("chunk {index} is beyond repair")]
    UnrepairableChunk { index: u64 },

    #[error("no parity object for chunk {index}")]
    NoParity { index: u64 },

    #[error("verification failed: {} mismatched, {} missing", mismatched.len(), missing.len())]
    VerifyFailed { mismatched: Vec<u64>, missing: Vec<u64> },

    #[error("incompatible options: {0}")]
    IncompatibleOptions(String),

    #[error("manifest encoding: {0}")]
    ManifestCodec(#[from] serde_json::Error),

    #[error("parity encoding: {0}")]
    ParityCodec(#[from] bincode::Error),

    #[error("pipeline aborted")]
    Aborted,
}

impl PipeError {
    /// Whether the scheduler may retry the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipeError::Transport { transient: true, .. })
    }
}

pub type Result<T> = std::result::Result<T, PipeError>;
