use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::chunk::chunk_key;
use crate::config::PipeConfig;
use crate::error::{PipeError, Result};
use crate::manifest::{ChunkRecord, Manifest};
use crate::progress::Progress;
use crate::redundancy::Redundancy;
use crate::repair::repair_chunk;
use crate::scheduler::{TransferJob, TransferScheduler};
use crate::tempstore::TempStore;
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub struct ReplayReport {
    pub total_bytes: u64,
    pub total_chunks: u64,
    pub repaired_chunks: u64,
}

/// Read path: download chunks with `jobs`-way concurrency and emit bytes
/// to `output` strictly in index order. Out-of-order completions wait in
/// a reorder buffer keyed by index; each chunk is re-hashed against its
/// manifest record before its bytes are released.
pub fn replay(
    output: &mut dyn Write,
    transport: Arc<dyn Transport>,
    redundancy: Option<Arc<dyn Redundancy>>,
    cfg: &PipeConfig,
    progress: &Progress,
) -> Result<ReplayReport> {
    cfg.validate()?;
    let store = TempStore::new(&cfg.tempdir, cfg.slot_capacity())?;
    let manifest = Manifest::fetch(transport.as_ref(), &store)?;
    let total = manifest.total_chunks;

    progress.set_stage("retrieving");
    progress.set_chunks_total(total);

    let scheduler =
        TransferScheduler::for_download(Arc::clone(&transport), store.slots(), cfg.jobs, cfg.retries);
    let slots = store.slots();

    let mut ready: BTreeMap<u64, std::path::PathBuf> = BTreeMap::new();
    let mut next_submit = 0u64;
    let mut next_emit = 0u64;
    let mut stream_hasher = blake3::Hasher::new();
    let mut total_bytes = 0u64;
    let mut repaired_chunks = 0u64;

    // Driver loop invariant: if nothing is emittable and no slot is free,
    // the next-in-order chunk is in flight (downloads are submitted in
    // index order), so blocking on an outcome always terminates.
    while next_emit < total {
        if let Some(path) = ready.remove(&next_emit) {
            let record = manifest
                .record(next_emit)
                .ok_or(PipeError::IncompleteManifest { expected: total, recorded: next_emit })?;
            let emitted = emit_chunk(
                output,
                record,
                &path,
                &store,
                transport.as_ref(),
                redundancy.as_deref(),
                cfg,
                &mut stream_hasher,
                &mut repaired_chunks,
            )?;
            total_bytes += emitted;
            std::fs::remove_file(&path)?;
            slots.release();
            progress.inc_chunk();
            progress.add_bytes(emitted);
            next_emit += 1;
            continue;
        }
        if next_submit < total && slots.try_acquire() {
            scheduler.submit(TransferJob::Download {
                index: next_submit,
                key: chunk_key(next_submit),
                dest: store.chunk_path(next_submit),
            })?;
            next_submit += 1;
            continue;
        }
        match scheduler.recv_outcome() {
            Some(outcome) => {
                outcome.result?;
                ready.insert(outcome.index, store.chunk_path(outcome.index));
            }
            None => return Err(PipeError::Aborted),
        }
    }

    output.flush()?;

    if !cfg.skip_check {
        let actual = stream_hasher.finalize().to_hex().to_string();
        if actual != manifest.stream_checksum_hex {
            return Err(PipeError::StreamChecksumMismatch {
                expected: manifest.stream_checksum_hex.clone(),
                actual,
            });
        }
    }

    info!(total_bytes, total_chunks = total, repaired_chunks, "replay complete");
    Ok(ReplayReport { total_bytes, total_chunks: total, repaired_chunks })
}

// Verify-then-emit for one downloaded chunk. Bytes only reach the output
// after the checksum matches (or the chunk was repaired to match).
#[allow(clippy::too_many_arguments)]
fn emit_chunk(
    output: &mut dyn Write,
    record: &ChunkRecord,
    path: &Path,
    store: &TempStore,
    transport: &dyn Transport,
    redundancy: Option<&dyn Redundancy>,
    cfg: &PipeConfig,
    stream_hasher: &mut blake3::Hasher,
    repaired_chunks: &mut u64,
) -> Result<u64> {
    if !cfg.skip_check {
        let actual = hash_file(path, cfg.block_size)?;
        if actual != record.checksum_hex {
            warn!(index = record.index, "checksum mismatch on retrieved chunk");
            let Some(redundancy) = redundancy.filter(|_| cfg.repair) else {
                return Err(PipeError::ChecksumMismatch {
                    index: record.index,
                    expected: record.checksum_hex.clone(),
                    actual,
                });
            };
            let fixed = match repair_chunk(record, path, store, transport, redundancy) {
                Ok(bytes) => bytes,
                // Absent parity downgrades the repair attempt to the
                // mismatch it started as.
                Err(PipeError::NoParity { .. }) => {
                    return Err(PipeError::ChecksumMismatch {
                        index: record.index,
                        expected: record.checksum_hex.clone(),
                        actual,
                    })
                }
                Err(e) => return Err(e),
            };
            *repaired_chunks += 1;
            stream_hasher.update(&fixed);
            output.write_all(&fixed)?;
            return Ok(fixed.len() as u64);
        }
    }

    let mut f = File::open(path)?;
    let mut block = vec![0u8; cfg.block_size];
    let mut emitted = 0u64;
    loop {
        let n = f.read(&mut block)?;
        if n == 0 {
            break;
        }
        stream_hasher.update(&block[..n]);
        output.write_all(&block[..n])?;
        emitted += n as u64;
    }
    Ok(emitted)
}

pub(crate) fn hash_file(path: &Path, block_size: usize) -> Result<String> {
    let mut f = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut block = vec![0u8; block_size.max(1)];
    loop {
        let n = f.read(&mut block)?;
        if n == 0 {
            break;
        }
        hasher.update(&block[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}
