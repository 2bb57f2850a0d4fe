use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::thread;
use std::time::{Duration, Instant};

/// Periodic stderr status line for long transfers. Counters are plain
/// atomics so pipeline threads can bump them without coordination; the
/// ticker thread prints every five seconds until stopped.
#[derive(Clone)]
pub struct Progress {
    enabled: bool,
    stage: Arc<Mutex<String>>,
    chunks_done: Arc<AtomicU64>,
    chunks_total: Arc<AtomicU64>,
    bytes_done: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
}

impl Progress {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            stage: Arc::new(Mutex::new(String::new())),
            chunks_done: Arc::new(AtomicU64::new(0)),
            chunks_total: Arc::new(AtomicU64::new(0)),
            bytes_done: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_stage(&self, s: &str) {
        if self.enabled {
            *self.stage.lock().unwrap() = s.to_string();
        }
    }

    /// Zero when the stream is unbounded (write path).
    pub fn set_chunks_total(&self, n: u64) {
        self.chunks_total.store(n, Ordering::Relaxed);
    }

    pub fn inc_chunk(&self) {
        self.chunks_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_done.fetch_add(n, Ordering::Relaxed);
    }

    pub fn start(&self) {
        if !self.enabled {
            return;
        }
        self.running.store(true, Ordering::Relaxed);
        let stage = self.stage.clone();
        let chunks_done = self.chunks_done.clone();
        let chunks_total = self.chunks_total.clone();
        let bytes_done = self.bytes_done.clone();
        let running = self.running.clone();
        thread::spawn(move || {
            let t0 = Instant::now();
            while running.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_secs(5));
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                let s = stage.lock().unwrap().clone();
                let cd = chunks_done.load(Ordering::Relaxed);
                let ct = chunks_total.load(Ordering::Relaxed);
                let bd = bytes_done.load(Ordering::Relaxed);
                if ct > 0 {
                    eprintln!(
                        "[{:>4}s] {} | chunk {}/{} | {} bytes so far",
                        t0.elapsed().as_secs(),
                        s,
                        cd,
                        ct,
                        bd
                    );
                } else {
                    eprintln!(
                        "[{:>4}s] {} | chunk {} | {} bytes so far",
                        t0.elapsed().as_secs(),
                        s,
                        cd,
                        bd
                    );
                }
            }
        });
    }

    pub fn stop(&self) {
        if self.enabled {
            self.running.store(false, Ordering::Relaxed);
        }
    }
}
