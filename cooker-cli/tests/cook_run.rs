use std::{fs, path::Path};

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

fn write(root: &Path, relative: &str, text: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, text).unwrap();
}

fn seed(root: &Path) {
    write(root, "maps/a.txt", "#import props/b.txt\n#import props/c.txt\nmap a\n");
    write(root, "maps/d.txt", "#import props/c.txt\nmap d\n");
    write(root, "props/b.txt", "mesh b\n");
    write(root, "props/c.txt", "#build shaders/s.txt\nmesh c\n");
    write(root, "shaders/s.txt", "shader s\n");
}

fn cook(dir: &Path, workers: u32) -> assert_cmd::assert::Assert {
    let mut cmd = cargo_bin_cmd!("cooker");
    cmd.env("RUST_LOG", "warn")
        .arg("cook")
        .arg("--workers")
        .arg(workers.to_string())
        .arg("--platform")
        .arg("linux")
        .arg("--content-root")
        .arg(dir.join("content"))
        .arg("--output")
        .arg(dir.join("out"))
        .arg("maps/a.txt")
        .arg("maps/d.txt")
        .assert()
}

#[test]
fn single_process_cook_writes_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    seed(&dir.path().join("content"));

    cook(dir.path(), 0)
        .success()
        .stdout(predicate::str::contains("5 succeeded, 0 failed"));
    for relative in ["maps/a.txt", "maps/d.txt", "props/b.txt", "props/c.txt", "shaders/s.txt"] {
        assert!(dir.path().join("out/linux").join(relative).exists(), "{relative}");
    }

    // nothing changed: everything comes from the cache
    cook(dir.path(), 0)
        .success()
        .stdout(predicate::str::contains("5 from cache"));
}

#[test]
fn worker_processes_cook_the_same_tree() {
    let dir = tempfile::tempdir().unwrap();
    seed(&dir.path().join("content"));

    cook(dir.path(), 2)
        .success()
        .stdout(predicate::str::contains("5 succeeded, 0 failed"));
    assert!(dir.path().join("out/linux/shaders/s.txt").exists());
}

#[test]
fn failed_items_give_a_nonzero_exit() {
    let dir = tempfile::tempdir().unwrap();
    let content = dir.path().join("content");
    seed(&content);
    write(&content, "props/b.txt", "#invalid degenerate mesh\n");

    cook(dir.path(), 0)
        .failure()
        .code(1)
        .stderr(predicate::str::contains("1 item(s) failed"));
}
