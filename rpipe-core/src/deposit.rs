use std::fs::File;
use std::io::{Read, Write};
use std::sync::Arc;

use tracing::info;

use crate::chunk::{ChunkWriter, NextChunk, MANIFEST_KEY};
use crate::config::PipeConfig;
use crate::error::{PipeError, Result};
use crate::manifest::ManifestBuilder;
use crate::progress::Progress;
use crate::redundancy::Redundancy;
use crate::scheduler::{with_retries, TransferJob, TransferScheduler};
use crate::tempstore::TempStore;
use crate::transport::Transport;
use crate::verify;

#[derive(Debug, Clone)]
pub struct DepositReport {
    pub total_bytes: u64,
    pub total_chunks: u64,
    pub stream_checksum_hex: String,
}

/// Write path: split the input stream into chunks, upload them with
/// `jobs`-way concurrency under the `jobs + 1` temp budget, then finalize
/// and upload the manifest. Unless checking is disabled, ends with a
/// verify pass against the destination.
pub fn deposit(
    input: &mut dyn Read,
    transport: Arc<dyn Transport>,
    redundancy: Option<Arc<dyn Redundancy>>,
    cfg: &PipeConfig,
    progress: &Progress,
) -> Result<DepositReport> {
    cfg.validate()?;
    transport.prepare()?;

    let store = TempStore::new(&cfg.tempdir, cfg.slot_capacity())?;
    let slots = store.slots();
    let manifest = Arc::new(ManifestBuilder::new(cfg.chunk_size, cfg.block_size));
    let scheduler = TransferScheduler::for_upload(
        Arc::clone(&transport),
        Arc::clone(&manifest),
        redundancy,
        store.slots(),
        cfg.jobs,
        cfg.retries,
    );

    progress.set_stage("sending");
    let mut writer = ChunkWriter::new(input, cfg.chunk_size, cfg.block_size);
    loop {
        // Backpressure: park here until a chunk's worth of temp space frees.
        slots.acquire();
        if let Err(e) = drain_failures(&scheduler) {
            slots.release();
            return Err(e);
        }
        match writer.next_chunk(&store) {
            Ok(NextChunk::Built(chunk)) => {
                progress.add_bytes(chunk.size);
                progress.inc_chunk();
                scheduler.submit(TransferJob::Upload(chunk))?;
            }
            Ok(NextChunk::EndOfStream) => {
                slots.release();
                break;
            }
            Err(e) => {
                scheduler.cancel();
                slots.release();
                return Err(e);
            }
        }
    }

    for outcome in scheduler.finish() {
        outcome.result?;
    }

    let total_chunks = writer.chunks_built();
    let (total_bytes, stream_checksum_hex) = writer.finish();
    let manifest = manifest.finalize(total_chunks, total_bytes, &stream_checksum_hex)?;

    progress.set_stage("depositing metadata");
    let mpath = store.scratch_path(MANIFEST_KEY);
    let mut mfile = File::create(&mpath)?;
    mfile.write_all(manifest.to_json()?.as_bytes())?;
    mfile.sync_all()?;
    drop(mfile);
    with_retries(cfg.retries, "upload", MANIFEST_KEY, || {
        transport.upload(&mpath, MANIFEST_KEY)
    })?;
    std::fs::remove_file(&mpath)?;

    if !cfg.skip_check {
        progress.set_stage("checking");
        let report = verify::verify(&manifest, transport.as_ref(), progress)?;
        if !report.is_ok() {
            return Err(PipeError::VerifyFailed {
                mismatched: report.mismatched,
                missing: report.missing,
            });
        }
    }

    info!(total_bytes, total_chunks, "deposit complete");
    Ok(DepositReport { total_bytes, total_chunks, stream_checksum_hex })
}

// Fail fast on the first errored transfer so the producer stops building
// chunks for a doomed pipeline.
fn drain_failures(scheduler: &TransferScheduler) -> Result<()> {
    while let Some(outcome) = scheduler.try_outcome() {
        if let Err(e) = outcome.result {
            scheduler.cancel();
            return Err(e);
        }
    }
    Ok(())
}
