use std::path::Path;

use tracing::{info, warn};

use crate::chunk::{chunk_key, parity_key};
use crate::error::{PipeError, Result};
use crate::manifest::{ChunkRecord, Manifest};
use crate::progress::Progress;
use crate::redundancy::Redundancy;
use crate::tempstore::TempStore;
use crate::transport::Transport;
use crate::verify;

#[derive(Debug, Clone, Default)]
pub struct RepairReport {
    pub repaired: u64,
    pub unrepairable: Vec<u64>,
    pub no_parity: Vec<u64>,
}

/// Reconstruct one chunk from its corrupted local copy plus the remote
/// parity object. On success the corrected chunk is re-uploaded (an
/// idempotent re-registration: the checksum is unchanged) and its bytes
/// returned to the caller.
pub fn repair_chunk(
    record: &ChunkRecord,
    corrupted: &Path,
    store: &TempStore,
    transport: &dyn Transport,
    redundancy: &dyn Redundancy,
) -> Result<Vec<u8>> {
    let index = record.index;
    if !record.has_parity {
        return Err(PipeError::NoParity { index });
    }
    let pkey = parity_key(index);
    if !transport.list(&pkey)?.iter().any(|k| k == &pkey) {
        return Err(PipeError::NoParity { index });
    }

    let ppath = store.scratch_path(&format!("{pkey}.fetch"));
    transport.download(&pkey, &ppath)?;
    let parity = std::fs::read(&ppath)?;
    std::fs::remove_file(&ppath)?;

    let bad = std::fs::read(corrupted)?;
    let fixed = match redundancy.decode(&bad, &parity) {
        Ok(Some(fixed)) => fixed,
        Ok(None) => return Err(PipeError::UnrepairableChunk { index }),
        // A parity object that no longer deserializes is as good as gone.
        Err(PipeError::ParityCodec(_)) => return Err(PipeError::UnrepairableChunk { index }),
        Err(e) => return Err(e),
    };
    let digest = blake3::hash(&fixed).to_hex().to_string();
    if digest != record.checksum_hex {
        return Err(PipeError::UnrepairableChunk { index });
    }

    // Push the corrected bytes back so the destination heals too.
    let key = chunk_key(index);
    let fixed_path = store.scratch_path(&format!("{key}.fixed"));
    std::fs::write(&fixed_path, &fixed)?;
    let uploaded = transport.upload(&fixed_path, &key);
    std::fs::remove_file(&fixed_path)?;
    uploaded?;

    info!(index, "chunk repaired");
    Ok(fixed)
}

/// Best-effort pass over the whole destination: find every chunk whose
/// remote checksum disagrees with the manifest (or which is missing) and
/// try to rebuild it from parity. One chunk failing never aborts the
/// sweep; the report says what happened per index.
pub fn repair_sweep(
    manifest: &Manifest,
    store: &TempStore,
    transport: &dyn Transport,
    redundancy: &dyn Redundancy,
    progress: &Progress,
) -> Result<RepairReport> {
    let findings = verify::verify(manifest, transport, progress)?;
    progress.set_stage("repairing");

    let mut report = RepairReport::default();
    let damaged = findings.mismatched.iter().chain(findings.missing.iter());
    for &index in damaged {
        let Some(record) = manifest.record(index) else {
            report.unrepairable.push(index);
            continue;
        };
        let key = chunk_key(index);
        let scratch = store.scratch_path(&format!("{key}.sweep"));
        // A missing object is treated as a fully-erased copy; the decode
        // step decides whether the parity can carry that much loss.
        if transport.download(&key, &scratch).is_err() {
            std::fs::write(&scratch, [])?;
        }
        match repair_chunk(record, &scratch, store, transport, redundancy) {
            Ok(_) => report.repaired += 1,
            Err(PipeError::NoParity { .. }) => {
                warn!(index, "no parity object, cannot repair");
                report.no_parity.push(index);
            }
            Err(PipeError::UnrepairableChunk { .. }) => {
                warn!(index, "corruption exceeds parity repair bound");
                report.unrepairable.push(index);
            }
            Err(e) => {
                std::fs::remove_file(&scratch).ok();
                return Err(e);
            }
        }
        std::fs::remove_file(&scratch).ok();
    }
    Ok(report)
}
