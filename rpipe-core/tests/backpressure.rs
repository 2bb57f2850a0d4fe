use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rpipe_core::config::PipeConfig;
use rpipe_core::deposit::deposit;
use rpipe_core::error::Result;
use rpipe_core::progress::Progress;
use rpipe_core::transport::{LocalDirTransport, Transport};

/// Holds every upload at the gate until the test opens it, so the
/// producer runs far ahead of the transfers and the temp budget is the
/// only thing limiting chunk files on disk.
struct GatedTransport {
    inner: LocalDirTransport,
    open: Mutex<bool>,
    opened: Condvar,
}

impl GatedTransport {
    fn new(dest: &Path) -> Self {
        Self {
            inner: LocalDirTransport::new(dest),
            open: Mutex::new(false),
            opened: Condvar::new(),
        }
    }

    fn open_gate(&self) {
        let mut open = self.open.lock().unwrap();
        *open = true;
        self.opened.notify_all();
    }
}

impl Transport for GatedTransport {
    fn prepare(&self) -> Result<()> {
        self.inner.prepare()
    }

    fn upload(&self, local: &Path, key: &str) -> Result<()> {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.opened.wait(open).unwrap();
        }
        drop(open);
        self.inner.upload(local, key)
    }

    fn download(&self, key: &str, local: &Path) -> Result<()> {
        self.inner.download(key, local)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key)
    }

    fn head_checksum(&self, key: &str) -> Result<Option<String>> {
        self.inner.head_checksum(key)
    }
}

// Chunk temp files are named exactly like their keys: "rp-" + 6 letters.
fn count_chunk_files(tmp_parent: &Path) -> usize {
    let mut count = 0;
    let Ok(entries) = std::fs::read_dir(tmp_parent) else { return 0 };
    for ent in entries.flatten() {
        if !ent.path().is_dir() {
            continue;
        }
        let Ok(inner) = std::fs::read_dir(ent.path()) else { continue };
        for f in inner.flatten() {
            let name = f.file_name().to_string_lossy().to_string();
            if name.starts_with("rp-") && name.len() == 9 {
                count += 1;
            }
        }
    }
    count
}

#[test]
fn temp_files_never_exceed_jobs_plus_one() {
    let td = tempfile::tempdir().unwrap();
    let dest = td.path().join("dest");
    let tmp_parent = td.path().join("tmp");
    let jobs = 2usize;
    let cfg = PipeConfig {
        chunk_size: 1024,
        block_size: 256,
        tempdir: tmp_parent.clone(),
        jobs,
        retries: 0,
        skip_check: false,
        parity: false,
        repair: false,
    };

    let transport = Arc::new(GatedTransport::new(&dest));
    let data: Vec<u8> = (0..16 * 1024).map(|i| (i % 251) as u8).collect();

    // Sample the temp area the whole run, recording the peak.
    let done = Arc::new(AtomicBool::new(false));
    let peak = Arc::new(AtomicUsize::new(0));
    let sampler = {
        let done = Arc::clone(&done);
        let peak = Arc::clone(&peak);
        let parent = tmp_parent.clone();
        thread::spawn(move || {
            while !done.load(Ordering::Relaxed) {
                peak.fetch_max(count_chunk_files(&parent), Ordering::Relaxed);
                thread::sleep(Duration::from_millis(2));
            }
        })
    };

    let pipeline = {
        let transport: Arc<dyn Transport> = transport.clone();
        let cfg = cfg.clone();
        thread::spawn(move || {
            let mut input = Cursor::new(data);
            deposit(&mut input, transport, None, &cfg, &Progress::new(false))
        })
    };

    // With the gate shut the producer must stall at exactly jobs + 1
    // chunk files: jobs parked in upload plus one freshly built.
    let deadline = Instant::now() + Duration::from_secs(10);
    while count_chunk_files(&tmp_parent) < jobs + 1 {
        assert!(Instant::now() < deadline, "producer never filled the temp budget");
        thread::sleep(Duration::from_millis(5));
    }
    thread::sleep(Duration::from_millis(200));
    assert_eq!(count_chunk_files(&tmp_parent), jobs + 1);

    transport.open_gate();
    let report = pipeline.join().unwrap().unwrap();
    done.store(true, Ordering::Relaxed);
    sampler.join().unwrap();

    assert_eq!(report.total_chunks, 16);
    assert!(
        peak.load(Ordering::Relaxed) <= jobs + 1,
        "temp budget exceeded: saw {} chunk files",
        peak.load(Ordering::Relaxed)
    );
}
