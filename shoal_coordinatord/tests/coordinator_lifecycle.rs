//! Integration tests for the coordinator daemon's segment lifecycle:
//! creation, root publication, and status reporting. Since a `[[bin]]`
//! crate's own functions aren't importable from its integration tests,
//! the first two tests drive the same `shoal_shm`/`shoal_objects`/
//! `shoal_txn` calls `main.rs` does; the third spawns the real compiled
//! binary, matching §8's "arbitrary process crashes" scenarios being
//! tested across real process boundaries rather than simulated in one
//! process.

use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use shoal_objects::Map;
use shoal_shm::Segment;
use shoal_txn::Engine;

fn unique_name(tag: &str) -> String {
    format!("coordd_test_{tag}_{}", std::process::id())
}

#[test]
fn creating_a_segment_and_publishing_root_matches_daemon_behavior() {
    let name = unique_name("create_root");
    let segment = Segment::create(&name, 4096 * 256).unwrap();
    assert_eq!(segment.participant_count(), 1);
    assert!(segment.root_handle().is_null());

    let engine = Engine::new(Arc::new(segment));
    let root = engine
        .transaction(|ctx| Map::new(ctx).map(|m| m.handle()).map_err(Into::into))
        .unwrap();
    engine.segment().set_root_handle(root);

    let joiner = Segment::attach(&name).unwrap();
    assert_eq!(joiner.root_handle(), root);
    assert_eq!(joiner.participant_count(), 2);
}

#[test]
fn attach_to_missing_segment_fails_not_found() {
    let result = Segment::attach("coordd_test_definitely_absent_segment");
    assert!(matches!(result, Err(shoal_shm::ShmError::NotFound { .. })));
}

#[test]
fn daemon_binary_prints_segment_name_and_status_reports_it() {
    let exe = env!("CARGO_BIN_EXE_shoal-coordinatord");
    let name = unique_name("binary");

    // A short reaper grace period so the shutdown signal below doesn't
    // have to wait out the production default (5s) before the blocking
    // maintenance loop next checks the shutdown flag.
    let mut config_file = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut config_file, b"reaper_grace_s = 1\n").unwrap();

    let mut child = Command::new(exe)
        .args([
            "--config",
            config_file.path().to_str().unwrap(),
            "run",
            "--name",
            &name,
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn coordinator daemon");

    // Give the daemon a moment to create the segment and print its name.
    std::thread::sleep(Duration::from_millis(300));

    let status = Command::new(exe)
        .args(["status", "--name", &name])
        .output()
        .expect("run status subcommand");
    assert!(status.status.success(), "status failed: {status:?}");
    let stdout = String::from_utf8_lossy(&status.stdout);
    assert!(stdout.contains("participants: "));

    // SIGINT the child so it unregisters and removes the segment's
    // backing file cleanly, the way a supervised deployment would.
    signal::kill(Pid::from_raw(child.id() as i32), Signal::SIGINT).expect("send SIGINT");
    let _ = child.wait();

    // Backing file should be gone once the creator has torn down; allow
    // up to one reaper grace period for the blocking maintenance loop to
    // notice the shutdown flag.
    std::thread::sleep(Duration::from_millis(1500));
    let path = format!("/dev/shm/shoal_{name}");
    assert!(
        !std::path::Path::new(&path).exists(),
        "segment file should be cleaned up after shutdown"
    );
}
