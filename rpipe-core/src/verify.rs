use tracing::warn;

use crate::chunk::chunk_key;
use crate::error::Result;
use crate::manifest::Manifest;
use crate::progress::Progress;
use crate::transport::Transport;

#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub chunks_ok: u64,
    pub mismatched: Vec<u64>,
    pub missing: Vec<u64>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.mismatched.is_empty() && self.missing.is_empty()
    }
}

/// Compare every remote chunk's checksum against the manifest without
/// moving any payload to the output stream or mutating the destination.
/// Mismatches are findings, reported per index, not errors.
pub fn verify(
    manifest: &Manifest,
    transport: &dyn Transport,
    progress: &Progress,
) -> Result<VerifyReport> {
    progress.set_stage("verifying");
    progress.set_chunks_total(manifest.total_chunks);

    let mut report = VerifyReport::default();
    for record in &manifest.chunks {
        let key = chunk_key(record.index);
        match transport.head_checksum(&key)? {
            None => {
                warn!(index = record.index, key, "chunk missing at destination");
                report.missing.push(record.index);
            }
            Some(actual) if actual == record.checksum_hex => report.chunks_ok += 1,
            Some(actual) => {
                warn!(index = record.index, key, expected = %record.checksum_hex, %actual, "checksum mismatch");
                report.mismatched.push(record.index);
            }
        }
        progress.inc_chunk();
        progress.add_bytes(record.size);
    }
    Ok(report)
}
