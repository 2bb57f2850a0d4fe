use anyhow::Result;
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use rpipe_core::config::{PipeConfig, DEFAULT_BLOCK_SIZE, DEFAULT_CHUNK_SIZE};
use rpipe_core::deposit::deposit;
use rpipe_core::error::PipeError;
use rpipe_core::manifest::Manifest;
use rpipe_core::progress::Progress;
use rpipe_core::redundancy::{Redundancy, RsRedundancy};
use rpipe_core::repair::repair_sweep;
use rpipe_core::replay::replay;
use rpipe_core::tempstore::TempStore;
use rpipe_core::transport::{LocalDirTransport, RcloneTransport, Transport};
use rpipe_core::verify::verify;

const AFTER_HELP: &str = "\
Works by creating temporary files of size --chunk-size in --tempdir and
uploading those. By default two jobs run, so an upload can be occurring
while the next chunk is being built; the tempdir therefore needs to hold
jobs + 1 chunks. Chunks are checksummed and deleted along the way, and
verified during retrieval.

Examples:
    <some source> | rpipe remote:some/empty/loc
    <some source> | rpipe --nocheck crypt:an/encrypted/loc
    rpipe --replay remote:some/empty/loc | <some sink>
    rpipe --verify remote:some/empty/loc
";

#[derive(Parser)]
#[command(name = "rpipe", version, about = "Provides pipe in to / out of an rclone destination", after_help = AFTER_HELP)]
struct Cli {
    /// Remote destination (rclone remote:path) or a local directory
    destination: String,

    /// Chunk size for splitting the transfer
    #[arg(short = 'c', long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Block size for read/write
    #[arg(short = 'b', long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: usize,

    /// Directory for storing temporary chunk files
    #[arg(short = 't', long)]
    tempdir: Option<PathBuf>,

    /// Number of simultaneous transfer jobs
    #[arg(short = 'j', long, default_value_t = 2)]
    jobs: usize,

    /// Bounded retry count for transient transport failures
    #[arg(long, default_value_t = 10)]
    retries: u32,

    /// Write a previously saved stream to stdout
    #[arg(short = 'r', long)]
    replay: bool,

    /// Don't check checksums (e.g. crypto store)
    #[arg(short = 'n', long)]
    nocheck: bool,

    /// Only check the integrity of the saved stream
    #[arg(long)]
    verify: bool,

    /// Create and upload parity objects alongside the chunks
    #[arg(long)]
    parity: bool,

    /// Attempt repair from parity on checksum mismatch
    #[arg(long)]
    repair: bool,

    /// Print a status line every few seconds
    #[arg(long)]
    progress: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if cli.verify && cli.nocheck {
        return Err(PipeError::IncompatibleOptions(
            "--verify without checksums is meaningless; drop --nocheck".into(),
        )
        .into());
    }

    let cfg = PipeConfig {
        chunk_size: cli.chunk_size,
        block_size: cli.block_size,
        tempdir: cli.tempdir.clone().unwrap_or_else(std::env::temp_dir),
        jobs: cli.jobs,
        retries: cli.retries,
        skip_check: cli.nocheck,
        parity: cli.parity,
        repair: cli.repair,
    };
    cfg.validate()?;

    // rclone remotes are "remote:path"; anything without a colon is a
    // plain directory on this machine.
    let transport: Arc<dyn Transport> = if cli.destination.contains(':') {
        Arc::new(RcloneTransport::new(&cli.destination, cli.retries))
    } else {
        Arc::new(LocalDirTransport::new(&cli.destination))
    };
    let redundancy: Option<Arc<dyn Redundancy>> = if cli.parity || cli.repair {
        Some(Arc::new(RsRedundancy::default()))
    } else {
        None
    };

    let progress = Progress::new(cli.progress);
    progress.start();
    let status = run(&cli, cfg, transport, redundancy, &progress);
    progress.stop();
    let code = status?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn run(
    cli: &Cli,
    cfg: PipeConfig,
    transport: Arc<dyn Transport>,
    redundancy: Option<Arc<dyn Redundancy>>,
    progress: &Progress,
) -> Result<i32> {
    if cli.verify {
        return run_verify(&cfg, transport, redundancy, progress);
    }
    if cli.replay {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let report = replay(&mut out, transport, redundancy, &cfg, progress)?;
        out.flush()?;
        eprintln!(
            "Retrieved {} bytes in {} chunks ({} repaired)",
            report.total_bytes, report.total_chunks, report.repaired_chunks
        );
        return Ok(0);
    }

    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    let report = deposit(&mut input, transport, redundancy, &cfg, progress)?;
    eprintln!("Wrote {} bytes into {}", report.total_bytes, cli.destination);
    eprintln!("Full stream checksum: {}", report.stream_checksum_hex);
    Ok(0)
}

fn run_verify(
    cfg: &PipeConfig,
    transport: Arc<dyn Transport>,
    redundancy: Option<Arc<dyn Redundancy>>,
    progress: &Progress,
) -> Result<i32> {
    let store = TempStore::new(&cfg.tempdir, cfg.slot_capacity())?;
    let manifest = Manifest::fetch(transport.as_ref(), &store)?;
    let mut report = verify(&manifest, transport.as_ref(), progress)?;

    if !report.is_ok() {
        if let Some(redundancy) = redundancy.filter(|_| cfg.repair) {
            let sweep =
                repair_sweep(&manifest, &store, transport.as_ref(), redundancy.as_ref(), progress)?;
            eprintln!(
                "Repair sweep: {} repaired, {} unrepairable, {} without parity",
                sweep.repaired,
                sweep.unrepairable.len(),
                sweep.no_parity.len()
            );
            report = verify(&manifest, transport.as_ref(), progress)?;
        }
    }

    for index in &report.mismatched {
        eprintln!("Checksum mismatch: chunk {index}");
    }
    for index in &report.missing {
        eprintln!("Chunk missing: chunk {index}");
    }
    if report.is_ok() {
        eprintln!("Success. Checksums match.");
        Ok(0)
    } else {
        Ok(1)
    }
}
