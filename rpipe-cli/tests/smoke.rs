use assert_cmd::Command;
use assert_fs::prelude::*;
use assert_fs::TempDir;
use predicates::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};

fn rpipe() -> Command {
    Command::cargo_bin("rpipe").unwrap()
}

fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

fn flip_byte(path: &std::path::Path, offset: u64) {
    use std::io::{Read, Seek, SeekFrom, Write};
    let mut f = std::fs::OpenOptions::new().read(true).write(true).open(path).unwrap();
    let mut b = [0u8; 1];
    f.seek(SeekFrom::Start(offset)).unwrap();
    f.read_exact(&mut b).unwrap();
    f.seek(SeekFrom::Start(offset)).unwrap();
    f.write_all(&[b[0] ^ 0xFF]).unwrap();
}

fn small_args(dest: &std::path::Path, tmp: &std::path::Path) -> Vec<String> {
    vec![
        "--chunk-size".into(),
        "4096".into(),
        "--block-size".into(),
        "512".into(),
        "--tempdir".into(),
        tmp.to_string_lossy().into_owned(),
        dest.to_string_lossy().into_owned(),
    ]
}

#[test]
fn deposit_then_replay_is_byte_exact() {
    let td = TempDir::new().unwrap();
    let dest = td.child("dest");
    let tmp = td.child("tmp");
    tmp.create_dir_all().unwrap();
    let data = random_bytes(20 * 1024, 1);

    rpipe()
        .args(small_args(dest.path(), tmp.path()))
        .write_stdin(data.clone())
        .assert()
        .success()
        .stderr(predicate::str::contains("Wrote 20480 bytes"))
        .stderr(predicate::str::contains("Full stream checksum:"));

    dest.child("rpipe.json").assert(predicate::path::exists());
    dest.child("rp-aaaaaa").assert(predicate::path::exists());

    let out = rpipe()
        .arg("--replay")
        .args(small_args(dest.path(), tmp.path()))
        .assert()
        .success()
        .stderr(predicate::str::contains("Retrieved 20480 bytes in 5 chunks"))
        .get_output()
        .stdout
        .clone();
    assert_eq!(out, data);
}

#[test]
fn empty_stdin_replays_as_empty() {
    let td = TempDir::new().unwrap();
    let dest = td.child("dest");
    let tmp = td.child("tmp");
    tmp.create_dir_all().unwrap();

    rpipe()
        .args(small_args(dest.path(), tmp.path()))
        .write_stdin(Vec::<u8>::new())
        .assert()
        .success()
        .stderr(predicate::str::contains("Wrote 0 bytes"));

    // Even an empty stream leaves a chunk object behind.
    dest.child("rp-aaaaaa").assert(predicate::path::exists());

    let out = rpipe()
        .arg("--replay")
        .args(small_args(dest.path(), tmp.path()))
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert!(out.is_empty());
}

#[test]
fn verify_passes_on_clean_destination_and_flags_corruption() {
    let td = TempDir::new().unwrap();
    let dest = td.child("dest");
    let tmp = td.child("tmp");
    tmp.create_dir_all().unwrap();
    let data = random_bytes(12 * 1024, 2);

    rpipe()
        .args(small_args(dest.path(), tmp.path()))
        .write_stdin(data)
        .assert()
        .success();

    rpipe()
        .arg("--verify")
        .args(small_args(dest.path(), tmp.path()))
        .assert()
        .success()
        .stderr(predicate::str::contains("Success. Checksums match."));

    flip_byte(dest.child("rp-aaaaab").path(), 17);

    rpipe()
        .arg("--verify")
        .args(small_args(dest.path(), tmp.path()))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Checksum mismatch: chunk 1"));
}

#[test]
fn verify_with_nocheck_is_rejected() {
    let td = TempDir::new().unwrap();
    rpipe()
        .arg("--verify")
        .arg("--nocheck")
        .arg(td.path().to_string_lossy().into_owned())
        .assert()
        .failure()
        .stderr(predicate::str::contains("drop --nocheck"));
}

#[test]
fn replay_fails_on_corruption_without_repair() {
    let td = TempDir::new().unwrap();
    let dest = td.child("dest");
    let tmp = td.child("tmp");
    tmp.create_dir_all().unwrap();
    let data = random_bytes(12 * 1024, 3);

    rpipe()
        .args(small_args(dest.path(), tmp.path()))
        .write_stdin(data)
        .assert()
        .success();

    flip_byte(dest.child("rp-aaaaaa").path(), 5);

    rpipe()
        .arg("--replay")
        .args(small_args(dest.path(), tmp.path()))
        .assert()
        .failure()
        .stderr(predicate::str::contains("checksum mismatch"));
}

#[test]
fn parity_deposit_survives_corruption_via_repair_sweep() {
    let td = TempDir::new().unwrap();
    let dest = td.child("dest");
    let tmp = td.child("tmp");
    tmp.create_dir_all().unwrap();
    let data = random_bytes(12 * 1024, 4);

    rpipe()
        .arg("--parity")
        .args(small_args(dest.path(), tmp.path()))
        .write_stdin(data.clone())
        .assert()
        .success();

    dest.child("rp-aaaaaa.par").assert(predicate::path::exists());

    flip_byte(dest.child("rp-aaaaaa").path(), 123);

    // A repairing verify heals the destination in place.
    rpipe()
        .arg("--verify")
        .arg("--repair")
        .args(small_args(dest.path(), tmp.path()))
        .assert()
        .success()
        .stderr(predicate::str::contains("Repair sweep: 1 repaired"))
        .stderr(predicate::str::contains("Success. Checksums match."));

    // And a plain replay now streams the original bytes.
    let out = rpipe()
        .arg("--replay")
        .args(small_args(dest.path(), tmp.path()))
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(out, data);
}

#[test]
fn nocheck_replay_streams_corrupted_bytes() {
    let td = TempDir::new().unwrap();
    let dest = td.child("dest");
    let tmp = td.child("tmp");
    tmp.create_dir_all().unwrap();
    let data = random_bytes(8 * 1024, 5);

    rpipe()
        .args(small_args(dest.path(), tmp.path()))
        .write_stdin(data.clone())
        .assert()
        .success();

    flip_byte(dest.child("rp-aaaaaa").path(), 9);

    let out = rpipe()
        .arg("--replay")
        .arg("--nocheck")
        .args(small_args(dest.path(), tmp.path()))
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(out.len(), data.len());
    assert_ne!(out, data);
}
