use reed_solomon_erasure::galois_8::ReedSolomon;
use serde::{Deserialize, Serialize};

use crate::error::{PipeError, Result};

/// Produces parity data for a chunk and reconstructs chunk bytes from a
/// corrupted copy plus that parity. `decode` returning `Ok(None)` means
/// the corruption exceeds the scheme's repair bound.
pub trait Redundancy: Send + Sync {
    fn encode(&self, chunk: &[u8]) -> Result<Vec<u8>>;
    fn decode(&self, corrupted: &[u8], parity: &[u8]) -> Result<Option<Vec<u8>>>;
}

/// Serialized parity sidecar for one chunk. Shard CRCs exist to turn
/// corruption into erasures: Reed-Solomon can only rebuild shards it
/// knows are bad.
#[derive(Serialize, Deserialize)]
struct ParityObject {
    chunk_len: u64,
    data_shards: u32,
    parity_shards: u32,
    shard_len: u32,
    data_crcs: Vec<u32>,
    parity_crcs: Vec<u32>,
    parity: Vec<Vec<u8>>,
}

/// Reed-Solomon parity over k equal data shards per chunk. With the
/// defaults (k=8, m=2) any 2 of the 10 shards may be rebuilt, so a chunk
/// survives corruption confined to two shard-sized regions.
pub struct RsRedundancy {
    data_shards: usize,
    parity_shards: usize,
}

impl Default for RsRedundancy {
    fn default() -> Self {
        Self { data_shards: 8, parity_shards: 2 }
    }
}

impl RsRedundancy {
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        if data_shards == 0 || parity_shards == 0 || data_shards + parity_shards > 256 {
            return Err(PipeError::IncompatibleOptions(format!(
                "invalid shard geometry {data_shards}+{parity_shards}"
            )));
        }
        Ok(Self { data_shards, parity_shards })
    }

    fn codec(&self) -> Result<ReedSolomon> {
        ReedSolomon::new(self.data_shards, self.parity_shards)
            .map_err(|e| PipeError::IncompatibleOptions(format!("reed-solomon init: {e}")))
    }
}

fn crc(buf: &[u8]) -> u32 {
    let mut h = crc32fast::Hasher::new();
    h.update(buf);
    h.finalize()
}

/// Zero-padded shards of width `shard_len` cut from `bytes`.
fn shard(bytes: &[u8], count: usize, shard_len: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| {
            let mut s = vec![0u8; shard_len];
            let start = (i * shard_len).min(bytes.len());
            let end = ((i + 1) * shard_len).min(bytes.len());
            s[..end - start].copy_from_slice(&bytes[start..end]);
            s
        })
        .collect()
}

impl Redundancy for RsRedundancy {
    fn encode(&self, chunk: &[u8]) -> Result<Vec<u8>> {
        let k = self.data_shards;
        let m = self.parity_shards;
        let shard_len = chunk.len().max(1).div_ceil(k);
        let mut data = shard(chunk, k, shard_len);
        let data_crcs: Vec<u32> = data.iter().map(|s| crc(s)).collect();
        let mut parity: Vec<Vec<u8>> = (0..m).map(|_| vec![0u8; shard_len]).collect();

        let mut refs: Vec<&mut [u8]> = Vec::with_capacity(k + m);
        for s in &mut data {
            refs.push(s.as_mut_slice());
        }
        for p in &mut parity {
            refs.push(p.as_mut_slice());
        }
        self.codec()?
            .encode(&mut refs[..])
            .map_err(|e| PipeError::IncompatibleOptions(format!("reed-solomon encode: {e}")))?;

        let parity_crcs: Vec<u32> = parity.iter().map(|p| crc(p)).collect();
        let obj = ParityObject {
            chunk_len: chunk.len() as u64,
            data_shards: k as u32,
            parity_shards: m as u32,
            shard_len: shard_len as u32,
            data_crcs,
            parity_crcs,
            parity,
        };
        Ok(bincode::serialize(&obj)?)
    }

    fn decode(&self, corrupted: &[u8], parity: &[u8]) -> Result<Option<Vec<u8>>> {
        let obj: ParityObject = bincode::deserialize(parity)?;
        let k = obj.data_shards as usize;
        let m = obj.parity_shards as usize;
        let shard_len = obj.shard_len as usize;
        if k == 0 || m == 0 || shard_len == 0 || obj.data_crcs.len() != k {
            return Ok(None);
        }
        let rs = match ReedSolomon::new(k, m) {
            Ok(rs) => rs,
            Err(_) => return Ok(None),
        };

        // CRC each shard of the corrupted copy; mismatches become erasures.
        let data = shard(corrupted, k, shard_len);
        let mut shards: Vec<Option<Vec<u8>>> = Vec::with_capacity(k + m);
        let mut bad = 0usize;
        for (i, s) in data.into_iter().enumerate() {
            if crc(&s) == obj.data_crcs[i] {
                shards.push(Some(s));
            } else {
                shards.push(None);
                bad += 1;
            }
        }
        for (j, p) in obj.parity.into_iter().enumerate() {
            let ok = p.len() == shard_len
                && obj.parity_crcs.get(j).is_some_and(|&c| crc(&p) == c);
            if ok {
                shards.push(Some(p));
            } else {
                shards.push(None);
                bad += 1;
            }
        }
        if bad > m {
            return Ok(None);
        }
        if rs.reconstruct(&mut shards).is_err() {
            return Ok(None);
        }

        let mut out = Vec::with_capacity(k * shard_len);
        for s in shards.into_iter().take(k) {
            match s {
                Some(s) => out.extend_from_slice(&s),
                None => return Ok(None),
            }
        }
        out.truncate(obj.chunk_len as usize);
        Ok(Some(out))
    }
}
