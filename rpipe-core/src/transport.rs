use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::{PipeError, Result};

/// Single-object operations against a named remote destination. The
/// scheduler provides all concurrency; implementations are synchronous.
/// Failures should be flagged transient when a retry could plausibly
/// succeed (network blips), permanent otherwise.
pub trait Transport: Send + Sync {
    /// Ensure the destination exists. Called once before a write pass.
    fn prepare(&self) -> Result<()> {
        Ok(())
    }
    fn upload(&self, local: &Path, key: &str) -> Result<()>;
    fn download(&self, key: &str, local: &Path) -> Result<()>;
    /// Keys under the destination starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
    fn delete(&self, key: &str) -> Result<()>;
    /// BLAKE3 hex of the remote object, or `None` if it does not exist.
    /// Never writes payload anywhere local.
    fn head_checksum(&self, key: &str) -> Result<Option<String>>;
}

fn transport_err(op: &'static str, key: &str, msg: impl ToString, transient: bool) -> PipeError {
    PipeError::Transport { op, key: key.to_string(), msg: msg.to_string(), transient }
}

/// Destination is a plain directory. Used for local destinations and
/// throughout the test suite.
pub struct LocalDirTransport {
    root: PathBuf,
}

impl LocalDirTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl Transport for LocalDirTransport {
    fn prepare(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    fn upload(&self, local: &Path, key: &str) -> Result<()> {
        std::fs::copy(local, self.object(key))
            .map_err(|e| transport_err("upload", key, e, false))?;
        Ok(())
    }

    fn download(&self, key: &str, local: &Path) -> Result<()> {
        std::fs::copy(self.object(key), local)
            .map_err(|e| transport_err("download", key, e, false))?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for ent in std::fs::read_dir(&self.root)? {
            let name = ent?.file_name().to_string_lossy().to_string();
            if name.starts_with(prefix) {
                keys.push(name);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn delete(&self, key: &str) -> Result<()> {
        std::fs::remove_file(self.object(key))
            .map_err(|e| transport_err("delete", key, e, false))?;
        Ok(())
    }

    fn head_checksum(&self, key: &str) -> Result<Option<String>> {
        let mut f = match File::open(self.object(key)) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(transport_err("head", key, e, false)),
        };
        let mut hasher = blake3::Hasher::new();
        std::io::copy(&mut f, &mut hasher)?;
        Ok(Some(hasher.finalize().to_hex().to_string()))
    }
}

/// Shells out to the `rclone` binary, one process per operation, the way
/// the tool has always worked. rclone does its own per-operation retrying
/// (`--retries`); failures are reported transient so the scheduler's
/// bounded backoff gets one more say.
pub struct RcloneTransport {
    remote: String,
    retries: u32,
}

impl RcloneTransport {
    pub fn new(remote: impl Into<String>, retries: u32) -> Self {
        let remote = remote.into();
        Self { remote: remote.trim_end_matches('/').to_string(), retries }
    }

    fn object(&self, key: &str) -> String {
        format!("{}/{}", self.remote, key)
    }

    fn retries_flag(&self) -> String {
        format!("--retries={}", self.retries.max(1))
    }

    fn run(&self, op: &'static str, key: &str, args: &[&str]) -> Result<Vec<u8>> {
        debug!(op, key, "rclone {}", args.join(" "));
        let out = Command::new("rclone")
            .args(args)
            .output()
            .map_err(|e| transport_err(op, key, format!("spawn rclone: {e}"), false))?;
        if !out.status.success() {
            let msg = String::from_utf8_lossy(&out.stderr).trim().to_string();
            return Err(transport_err(op, key, msg, true));
        }
        Ok(out.stdout)
    }
}

impl Transport for RcloneTransport {
    fn prepare(&self) -> Result<()> {
        self.run("prepare", "", &["mkdir", &self.remote])?;
        Ok(())
    }

    fn upload(&self, local: &Path, key: &str) -> Result<()> {
        let local = local.to_string_lossy();
        self.run("upload", key, &["copyto", &self.retries_flag(), &local, &self.object(key)])?;
        Ok(())
    }

    fn download(&self, key: &str, local: &Path) -> Result<()> {
        let local = local.to_string_lossy();
        self.run("download", key, &["copyto", &self.retries_flag(), &self.object(key), &local])?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let out = self.run("list", prefix, &["lsf", &self.retries_flag(), &self.remote])?;
        let mut keys: Vec<String> = String::from_utf8_lossy(&out)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty() && l.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.run("delete", key, &["deletefile", &self.retries_flag(), &self.object(key)])?;
        Ok(())
    }

    // Server-side hashes are useless here (the digest is BLAKE3 and the
    // remote may be an encrypted store), so stream the object through a
    // local hasher instead. `rclone cat` never touches the disk.
    fn head_checksum(&self, key: &str) -> Result<Option<String>> {
        let listed = self.list(key)?;
        if !listed.iter().any(|k| k == key) {
            return Ok(None);
        }
        let mut child = Command::new("rclone")
            .args(["cat", &self.retries_flag(), &self.object(key)])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| transport_err("head", key, format!("spawn rclone: {e}"), false))?;
        let mut hasher = blake3::Hasher::new();
        if let Some(mut stdout) = child.stdout.take() {
            let mut block = vec![0u8; 64 << 10];
            loop {
                let n = stdout.read(&mut block)?;
                if n == 0 {
                    break;
                }
                hasher.update(&block[..n]);
            }
        }
        let status = child.wait()?;
        if !status.success() {
            return Err(transport_err("head", key, format!("rclone cat exited {status}"), true));
        }
        Ok(Some(hasher.finalize().to_hex().to_string()))
    }
}
