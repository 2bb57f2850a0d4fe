use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::chunk::{parity_key, BuiltChunk};
use crate::error::{PipeError, Result};
use crate::manifest::ManifestBuilder;
use crate::redundancy::Redundancy;
use crate::tempstore::Slots;
use crate::transport::Transport;

pub enum TransferJob {
    /// Upload a built chunk (and its parity, when enabled), register it in
    /// the manifest, delete the temp file, release the slot.
    Upload(BuiltChunk),
    /// Download the object at `key` into `dest`. The slot stays held; the
    /// replay emitter releases it after the bytes leave the temp area.
    Download { index: u64, key: String, dest: PathBuf },
}

pub struct TransferOutcome {
    pub index: u64,
    pub result: Result<()>,
}

/// Bounded pool of `jobs` worker threads pulling transfer jobs off a
/// shared queue. Production and transfer are pipelined: while chunk i+1
/// is being built, chunk i is on the wire. Any worker failure flips the
/// cancelled flag, so remaining queued jobs are drained without running
/// and blocked producers come unstuck.
pub struct TransferScheduler {
    jobs_tx: Option<Sender<TransferJob>>,
    outcome_rx: Receiver<TransferOutcome>,
    workers: Vec<JoinHandle<()>>,
    cancelled: Arc<AtomicBool>,
}

struct Worker {
    transport: Arc<dyn Transport>,
    manifest: Option<Arc<ManifestBuilder>>,
    redundancy: Option<Arc<dyn Redundancy>>,
    slots: Arc<Slots>,
    retries: u32,
    cancelled: Arc<AtomicBool>,
}

impl TransferScheduler {
    /// Pool for the write path: uploads register into `manifest` and
    /// optionally ship parity objects.
    pub fn for_upload(
        transport: Arc<dyn Transport>,
        manifest: Arc<ManifestBuilder>,
        redundancy: Option<Arc<dyn Redundancy>>,
        slots: Arc<Slots>,
        jobs: usize,
        retries: u32,
    ) -> Self {
        Self::spawn(transport, Some(manifest), redundancy, slots, jobs, retries)
    }

    /// Pool for the read path: plain downloads into the temp area.
    pub fn for_download(
        transport: Arc<dyn Transport>,
        slots: Arc<Slots>,
        jobs: usize,
        retries: u32,
    ) -> Self {
        Self::spawn(transport, None, None, slots, jobs, retries)
    }

    fn spawn(
        transport: Arc<dyn Transport>,
        manifest: Option<Arc<ManifestBuilder>>,
        redundancy: Option<Arc<dyn Redundancy>>,
        slots: Arc<Slots>,
        jobs: usize,
        retries: u32,
    ) -> Self {
        let (jobs_tx, jobs_rx) = channel::<TransferJob>();
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));
        let (outcome_tx, outcome_rx) = channel::<TransferOutcome>();
        let cancelled = Arc::new(AtomicBool::new(false));

        let workers = (0..jobs.max(1))
            .map(|_| {
                let worker = Worker {
                    transport: Arc::clone(&transport),
                    manifest: manifest.clone(),
                    redundancy: redundancy.clone(),
                    slots: Arc::clone(&slots),
                    retries,
                    cancelled: Arc::clone(&cancelled),
                };
                let rx = Arc::clone(&jobs_rx);
                let tx = outcome_tx.clone();
                thread::spawn(move || worker_loop(worker, rx, tx))
            })
            .collect();

        Self { jobs_tx: Some(jobs_tx), outcome_rx, workers, cancelled }
    }

    pub fn submit(&self, job: TransferJob) -> Result<()> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(PipeError::Aborted);
        }
        match &self.jobs_tx {
            Some(tx) => tx.send(job).map_err(|_| PipeError::Aborted),
            None => Err(PipeError::Aborted),
        }
    }

    /// Non-blocking: next completed transfer, if any.
    pub fn try_outcome(&self) -> Option<TransferOutcome> {
        self.outcome_rx.try_recv().ok()
    }

    /// Blocking: next completed transfer; `None` once all workers exited.
    pub fn recv_outcome(&self) -> Option<TransferOutcome> {
        self.outcome_rx.recv().ok()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Closes the queue, joins every worker, and drains the remaining
    /// outcomes so the caller can inspect each one.
    pub fn finish(mut self) -> Vec<TransferOutcome> {
        self.jobs_tx.take();
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
        let mut out = Vec::new();
        while let Ok(o) = self.outcome_rx.try_recv() {
            out.push(o);
        }
        out
    }
}

impl Drop for TransferScheduler {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.jobs_tx.take();
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}

fn worker_loop(
    worker: Worker,
    jobs: Arc<Mutex<Receiver<TransferJob>>>,
    outcomes: Sender<TransferOutcome>,
) {
    loop {
        let job = {
            let rx = jobs.lock().unwrap();
            rx.recv()
        };
        let Ok(job) = job else { break };

        if worker.cancelled.load(Ordering::Relaxed) {
            // Drain without executing; free the slot so nothing wedges.
            if let TransferJob::Upload(chunk) = &job {
                let _ = std::fs::remove_file(&chunk.path);
            }
            worker.slots.release();
            continue;
        }

        let (index, result) = match job {
            TransferJob::Upload(chunk) => (chunk.index, worker.run_upload(&chunk)),
            TransferJob::Download { index, key, dest } => {
                (index, worker.run_download(&key, &dest))
            }
        };
        if result.is_err() {
            worker.cancelled.store(true, Ordering::Relaxed);
        }
        let _ = outcomes.send(TransferOutcome { index, result });
    }
}

impl Worker {
    fn run_upload(&self, chunk: &BuiltChunk) -> Result<()> {
        let result = (|| {
            with_retries(self.retries, "upload", &chunk.key, || {
                self.transport.upload(&chunk.path, &chunk.key)
            })?;
            let has_parity = match &self.redundancy {
                Some(redundancy) => {
                    self.upload_parity(chunk, redundancy.as_ref())?;
                    true
                }
                None => false,
            };
            if let Some(manifest) = &self.manifest {
                manifest.record(chunk.index, chunk.size, &chunk.checksum_hex, has_parity)?;
            }
            std::fs::remove_file(&chunk.path)?;
            debug!(index = chunk.index, size = chunk.size, "chunk uploaded");
            Ok(())
        })();
        // Success or failure, the temp slot must come back: the producer
        // may be parked on it and still has outcomes to inspect.
        self.slots.release();
        result
    }

    fn upload_parity(&self, chunk: &BuiltChunk, redundancy: &dyn Redundancy) -> Result<()> {
        let bytes = std::fs::read(&chunk.path)?;
        let parity = redundancy.encode(&bytes)?;
        let key = parity_key(chunk.index);
        let path = chunk.path.with_extension("par");
        std::fs::write(&path, &parity)?;
        let uploaded =
            with_retries(self.retries, "upload", &key, || self.transport.upload(&path, &key));
        let _ = std::fs::remove_file(&path);
        uploaded
    }

    fn run_download(&self, key: &str, dest: &std::path::Path) -> Result<()> {
        let result =
            with_retries(self.retries, "download", key, || self.transport.download(key, dest));
        if result.is_err() {
            // The emitter will never see this chunk; give its slot back.
            self.slots.release();
        }
        result
    }
}

/// Retry `f` on transient transport errors with doubling backoff, up to
/// `attempts` retries. Permanent errors pass straight through.
pub fn with_retries<T>(
    attempts: u32,
    op: &'static str,
    key: &str,
    mut f: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut delay = Duration::from_millis(200);
    let mut tried = 0u32;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && tried < attempts => {
                tried += 1;
                warn!(op, key, attempt = tried, error = %e, "transient failure, backing off");
                thread::sleep(delay);
                delay = (delay * 2).min(Duration::from_secs(5));
            }
            Err(e) => return Err(e),
        }
    }
}
