use std::fs::File;
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::PathBuf;

use tracing::debug;

use crate::error::{PipeError, Result};
use crate::tempstore::TempStore;

/// Remote key of the finalized manifest object.
pub const MANIFEST_KEY: &str = "rpipe.json";

/// Remote key prefix shared by all chunk objects.
pub const CHUNK_PREFIX: &str = "rp-";

const KEY_WIDTH: usize = 6;

/// Deterministic chunk object key: `rp-` plus the index in base-26 `[a-z]`,
/// zero-padded to six letters so lexicographic order matches index order.
/// Widens past six letters rather than failing on enormous streams.
pub fn chunk_key(index: u64) -> String {
    let mut digits = Vec::with_capacity(KEY_WIDTH);
    let mut n = index;
    loop {
        digits.push(b'a' + (n % 26) as u8);
        n /= 26;
        if n == 0 {
            break;
        }
    }
    while digits.len() < KEY_WIDTH {
        digits.push(b'a');
    }
    let name: String = digits.iter().rev().map(|d| *d as char).collect();
    format!("{CHUNK_PREFIX}{name}")
}

/// Key of the parity object paired with a chunk.
pub fn parity_key(index: u64) -> String {
    format!("{}.par", chunk_key(index))
}

/// A chunk that has been fully written to the temp area and hashed.
/// The temp file is exclusively owned by the pipeline until its upload
/// completes, at which point the scheduler deletes it.
#[derive(Debug)]
pub struct BuiltChunk {
    pub index: u64,
    pub size: u64,
    pub checksum_hex: String,
    pub key: String,
    pub path: PathBuf,
}

pub enum NextChunk {
    Built(BuiltChunk),
    EndOfStream,
}

/// Consumes the input stream in block-sized reads and materializes
/// bounded-size chunk files, keeping a running per-chunk digest and the
/// whole-stream digest as it goes.
pub struct ChunkWriter<R: Read> {
    input: R,
    chunk_size: usize,
    block_size: usize,
    next_index: u64,
    produced_any: bool,
    stream_hasher: blake3::Hasher,
    total_bytes: u64,
}

impl<R: Read> ChunkWriter<R> {
    pub fn new(input: R, chunk_size: usize, block_size: usize) -> Self {
        Self {
            input,
            chunk_size,
            block_size,
            next_index: 0,
            produced_any: false,
            stream_hasher: blake3::Hasher::new(),
            total_bytes: 0,
        }
    }

    /// Builds the next chunk, or signals exhaustion. An empty input stream
    /// yields exactly one zero-length chunk before `EndOfStream`.
    pub fn next_chunk(&mut self, store: &TempStore) -> Result<NextChunk> {
        let index = self.next_index;
        let path = store.chunk_path(index);
        let file = File::create(&path).map_err(|e| map_temp_err(e, store))?;
        let mut out = BufWriter::with_capacity(self.block_size, file);
        let mut hasher = blake3::Hasher::new();
        let mut block = vec![0u8; self.block_size];
        let mut written = 0usize;

        while written < self.chunk_size {
            let want = self.block_size.min(self.chunk_size - written);
            let got = read_full(&mut self.input, &mut block[..want])?;
            if got == 0 {
                break;
            }
            hasher.update(&block[..got]);
            self.stream_hasher.update(&block[..got]);
            out.write_all(&block[..got]).map_err(|e| map_temp_err(e, store))?;
            written += got;
        }

        out.flush().map_err(|e| map_temp_err(e, store))?;
        let file = out.into_inner().map_err(|e| map_temp_err(e.into_error(), store))?;
        file.sync_all()?;

        if written == 0 && self.produced_any {
            std::fs::remove_file(&path)?;
            return Ok(NextChunk::EndOfStream);
        }

        self.produced_any = true;
        self.next_index += 1;
        self.total_bytes += written as u64;
        let checksum_hex = hasher.finalize().to_hex().to_string();
        debug!(index, size = written, "chunk built");
        Ok(NextChunk::Built(BuiltChunk {
            index,
            size: written as u64,
            checksum_hex,
            key: chunk_key(index),
            path,
        }))
    }

    /// Chunks built so far.
    pub fn chunks_built(&self) -> u64 {
        self.next_index
    }

    /// Consumes the writer, returning total bytes read and the
    /// whole-stream digest.
    pub fn finish(self) -> (u64, String) {
        (self.total_bytes, self.stream_hasher.finalize().to_hex().to_string())
    }
}

/// Read until `buf` is full or the stream ends; tolerates short reads.
fn read_full(r: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ENOSPC in the temp area gets its own error so the caller can suggest
// reducing concurrency; everything else stays an i/o failure.
fn map_temp_err(e: std::io::Error, store: &TempStore) -> PipeError {
    if e.raw_os_error() == Some(28) {
        PipeError::TempSpace { dir: store.path().to_path_buf() }
    } else {
        PipeError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_sort_with_index() {
        assert_eq!(chunk_key(0), "rp-aaaaaa");
        assert_eq!(chunk_key(1), "rp-aaaaab");
        assert_eq!(chunk_key(25), "rp-aaaaaz");
        assert_eq!(chunk_key(26), "rp-aaaaba");
        let mut keys: Vec<String> = (0..1000).map(chunk_key).collect();
        let sorted = {
            let mut s = keys.clone();
            s.sort();
            s
        };
        assert_eq!(keys, sorted);
        keys.dedup();
        assert_eq!(keys.len(), 1000);
    }

    #[test]
    fn parity_key_pairs_with_chunk_key() {
        assert_eq!(parity_key(0), "rp-aaaaaa.par");
    }
}
