use std::{
    path::Path,
    process::{Command, Output},
};

use balanced_split::cluster::{local::LocalCluster, ClusterControl};

#[path = "common/mod.rs"]
mod common;
use common::key;

fn balanced_split(data_dir: &Path, extra: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_balanced-split"))
        .arg("t")
        .arg("--data-dir")
        .arg(data_dir)
        .args(["--key-width", "2", "--key-max", "c8", "--poll-interval-secs", "0"])
        .args(extra)
        .env("RUST_LOG", "balanced_split=debug")
        .output()
        .expect("run balanced-split")
}

#[tokio::test]
async fn creates_and_splits_a_table() {
    let dir = tempfile::tempdir().unwrap();
    let output = balanced_split(dir.path(), &["--create", "4"]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let cluster = LocalCluster::new(dir.path());
    let starts: Vec<Vec<u8>> = cluster
        .shard_boundaries("t")
        .await
        .unwrap()
        .into_iter()
        .map(|bounds| bounds.start)
        .collect();
    let mut expected = vec![Vec::new()];
    expected.extend([0x19, 0x32, 0x4b, 0x64, 0x7d, 0x96, 0xaf].map(key));
    assert_eq!(starts, expected);
    assert!(!dir.path().join("t").join("_balancedSplit").exists());
    assert!(!dir.path().join("t").join("_balancedSplit.lease").exists());
}

#[tokio::test]
async fn data_files_follow_the_daughters() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = LocalCluster::new(dir.path());
    cluster
        .create_table("t", &["a", "b"], &[key(0x64)])
        .await
        .unwrap();
    let upper = cluster.locate_shard("t", &key(0x80)).await.unwrap().shard;
    for family in cluster.column_family_dirs("t", &upper).await.unwrap() {
        std::fs::write(family.join("0badcafe"), b"rows").unwrap();
    }

    let output = balanced_split(dir.path(), &[]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    // 0x64..0xc8 was split at 0x96
    for probe in [0x70, 0xa0] {
        let shard = cluster.locate_shard("t", &key(probe)).await.unwrap().shard;
        for family in cluster.column_family_dirs("t", &shard).await.unwrap() {
            assert!(family.join("0badcafe").exists());
        }
    }
    assert!(!dir.path().join("t").join(&upper.name).exists());
    let starts: Vec<Vec<u8>> = cluster
        .shard_boundaries("t")
        .await
        .unwrap()
        .into_iter()
        .map(|bounds| bounds.start)
        .collect();
    assert_eq!(starts, vec![Vec::new(), key(0x32), key(0x64), key(0x96)]);
    assert!(!dir.path().join("t").join("_balancedSplit").exists());
}

#[test]
fn corrupt_log_exits_non_zero_and_is_kept() {
    let dir = tempfile::tempdir().unwrap();
    let created = balanced_split(dir.path(), &["--create", "2", "--create-only"]);
    assert!(created.status.success());

    let log = dir.path().join("t").join("_balancedSplit");
    std::fs::write(&log, "+ 00 32\nnot a log line\n").unwrap();

    let output = balanced_split(dir.path(), &[]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("corrupt"), "stderr: {stderr}");
    assert_eq!(
        std::fs::read_to_string(&log).unwrap(),
        "+ 00 32\nnot a log line\n"
    );
}

#[test]
fn missing_table_exits_non_zero() {
    let dir = tempfile::tempdir().unwrap();
    let output = balanced_split(dir.path(), &[]);
    assert!(!output.status.success());
    assert!(!dir.path().join("t").join("_balancedSplit").exists());
}

#[test]
fn rejects_bad_key_space() {
    let dir = tempfile::tempdir().unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_balanced-split"))
        .arg("t")
        .arg("--data-dir")
        .arg(dir.path())
        .args(["--key-width", "2", "--key-max", "fff"])
        .output()
        .expect("run balanced-split");
    assert!(!output.status.success());
}
