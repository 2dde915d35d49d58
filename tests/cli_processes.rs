//! `kvlock` binary runs racing on one `SQLite` file.
//!
//! Each `incr` is a separate process, so only locks that reach across
//! processes keep the counter exact.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::process::{Command, Output};
use std::thread;
use tempfile::TempDir;

const WORKERS: usize = 8;
const INCREMENTS: usize = 10;

fn kvlock(url: &str, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_kvlock"))
        .arg("--url")
        .arg(url)
        .args(args)
        .env_remove("KVLOCK_URL")
        .output()
        .expect("binary runs")
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "kvlock failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn test_incr_from_many_processes() {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite:///{}", dir.path().join("kv.db").display());

    assert_success(&kvlock(&url, &["put", "n", "0"]));

    let workers: Vec<_> = (0..WORKERS)
        .map(|_| {
            let url = url.clone();
            thread::spawn(move || {
                for _ in 0..INCREMENTS {
                    assert_success(&kvlock(&url, &["incr", "n"]));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let output = kvlock(&url, &["get", "n"]);
    assert_success(&output);
    let total: usize = String::from_utf8(output.stdout).unwrap().trim().parse().unwrap();
    assert_eq!(total, WORKERS * INCREMENTS);
}

#[test]
fn test_get_missing_prints_null() {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite:///{}", dir.path().join("kv.db").display());

    let output = kvlock(&url, &["get", "absent"]);
    assert_success(&output);
    assert_eq!(String::from_utf8(output.stdout).unwrap().trim(), "null");
}
