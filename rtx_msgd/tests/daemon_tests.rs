//! Message daemon behaviour against a real session in a temporary directory.

use rtx_common::config::{LogLevel, MsgdConfig, RtxConfig, SessionConfig};
use rtx_common::flavor::Flavor;
use rtx_msgd::{DaemonError, MsgDaemon, StopReason};
use rtx_shared_memory::ring_log::write_record;
use rtx_shared_memory::{
    LogRecord, MsgOrigin, SegmentDiscovery, SegmentManager, Session, SessionState,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

fn config(dir: &TempDir) -> RtxConfig {
    RtxConfig {
        session: SessionConfig {
            instance: 3,
            shm_dir: dir.path().to_path_buf(),
            global_size: 256 * 1024,
            message_ring_size: 32 * 1024,
            ..Default::default()
        },
        msgd: MsgdConfig {
            supervise_interval_ms: 10,
            poll_min_ms: 5,
            poll_max_ms: 20,
            poll_step_ms: 5,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn record(tag: &str, text: &str) -> LogRecord {
    LogRecord::new(MsgOrigin::Rt, LogLevel::Info, tag, text)
}

fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

#[tokio::test]
async fn drained_records_reach_the_log_file() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("msgd.log");
    let mut cfg = config(&dir);
    cfg.msgd.log_file = Some(log.clone());
    let mut daemon = MsgDaemon::start(cfg.clone(), Flavor::Posix).unwrap();

    let mgr = SegmentManager::from_config(&cfg.session);
    let host = Session::attach_configured(&mgr, &cfg.session).unwrap();
    write_record(host.message_ring(), record("scale", "gain set")).unwrap();
    write_record(host.message_ring(), record("logic", "ready")).unwrap();

    assert_eq!(daemon.drain_once().unwrap(), 2);
    assert_eq!(daemon.drain_once().unwrap(), 0);
    assert_eq!(daemon.records_written(), 2);

    let text = std::fs::read_to_string(&log).unwrap();
    let lines: Vec<_> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("rt.scale"));
    assert!(lines[1].ends_with(": ready"));
}

#[tokio::test]
async fn garbage_in_the_ring_is_skipped() {
    let dir = TempDir::new().unwrap();
    let mut daemon = MsgDaemon::start(config(&dir), Flavor::Posix).unwrap();
    let ring = daemon.session().message_ring();
    ring.record_writer().unwrap().write(b"garbage").unwrap();
    write_record(ring, record("logic", "after")).unwrap();

    assert_eq!(daemon.drain_once().unwrap(), 2);
    assert_eq!(daemon.undecodable(), 1);
    assert_eq!(daemon.records_written(), 1);
}

#[tokio::test]
async fn overflow_is_reported_as_a_delta() {
    let dir = TempDir::new().unwrap();
    let mut daemon = MsgDaemon::start(config(&dir), Flavor::Posix).unwrap();
    assert!(daemon.check_overflow().is_zero());

    let session = Arc::clone(daemon.session());
    let text = "x".repeat(200);
    let mut rejected = 0;
    for _ in 0..1000 {
        if write_record(session.message_ring(), record("flood", &text)).is_err() {
            rejected += 1;
        }
    }
    assert!(rejected > 0);

    let first = daemon.check_overflow();
    assert_eq!(first.full, rejected);
    assert!(daemon.check_overflow().is_zero());

    daemon.drain_once().unwrap();
    write_record(session.message_ring(), record("flood", "fits again")).unwrap();
    assert!(daemon.check_overflow().is_zero());
}

#[tokio::test]
async fn host_leaving_stops_the_loop() {
    let dir = TempDir::new().unwrap();
    let mut daemon = MsgDaemon::start(config(&dir), Flavor::Posix).unwrap();
    let session = Arc::clone(daemon.session());
    let pid = std::process::id();
    session.set_host_pid(pid);

    let leaver = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.set_host_pid(0);
    });
    let stop = tokio::time::timeout(
        Duration::from_secs(5),
        daemon.run(std::future::pending::<()>()),
    )
    .await
    .unwrap()
    .unwrap();
    leaver.await.unwrap();
    assert_eq!(stop, StopReason::HostExited(pid));
}

#[tokio::test]
async fn dead_host_is_an_error() {
    let dir = TempDir::new().unwrap();
    let mut daemon = MsgDaemon::start(config(&dir), Flavor::Posix).unwrap();
    let pid = dead_pid();
    daemon.session().set_host_pid(pid);

    let res = tokio::time::timeout(
        Duration::from_secs(5),
        daemon.run(std::future::pending::<()>()),
    )
    .await
    .unwrap();
    assert!(matches!(res, Err(DaemonError::HostDied { pid: p }) if p == pid));
}

#[tokio::test]
async fn loop_drains_while_running() {
    let dir = TempDir::new().unwrap();
    let mut daemon = MsgDaemon::start(config(&dir), Flavor::Posix).unwrap();
    let session = Arc::clone(daemon.session());

    let writer = tokio::spawn(async move {
        for i in 0..5 {
            write_record(session.message_ring(), record("logic", &format!("tick {}", i))).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });
    let stop = daemon
        .run(tokio::time::sleep(Duration::from_millis(300)))
        .await
        .unwrap();
    writer.await.unwrap();
    assert_eq!(stop, StopReason::Requested);
    assert_eq!(daemon.records_written(), 5);
}

#[tokio::test]
async fn fast_supervision_does_not_starve_draining() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(&dir);
    cfg.msgd.supervise_interval_ms = 5;
    cfg.msgd.poll_min_ms = 20;
    cfg.msgd.poll_max_ms = 40;
    let mut daemon = MsgDaemon::start(cfg, Flavor::Posix).unwrap();
    write_record(daemon.session().message_ring(), record("logic", "queued")).unwrap();

    let stop = daemon
        .run(tokio::time::sleep(Duration::from_millis(300)))
        .await
        .unwrap();
    assert_eq!(stop, StopReason::Requested);
    assert_eq!(daemon.records_written(), 1);
}

#[tokio::test]
async fn shutdown_exits_the_session_and_unlinks_it() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    let daemon = MsgDaemon::start(cfg.clone(), Flavor::Posix).unwrap();
    let session = Arc::clone(daemon.session());
    write_record(session.message_ring(), record("logic", "last words")).unwrap();

    let mgr = SegmentManager::from_config(&cfg.session);
    assert!(!SegmentDiscovery::new(&mgr).list_instance(3).unwrap().is_empty());

    let removed = daemon.shutdown().unwrap();
    assert!(removed >= 1);
    assert_eq!(session.state(), SessionState::Exited);
    assert!(session.message_ring().stats().used == 0);
    assert!(SegmentDiscovery::new(&mgr).list_instance(3).unwrap().is_empty());
}

#[tokio::test]
async fn subscribers_receive_drained_records() {
    let dir = TempDir::new().unwrap();
    let sock = dir.path().join("msgd.sock");
    let mut cfg = config(&dir);
    cfg.msgd.publish_socket = Some(sock.clone());
    let mut daemon = MsgDaemon::start(cfg, Flavor::Posix).unwrap();

    let mut sub = UnixStream::connect(&sock).await.unwrap();
    sub.write_all(b"rt.logic\n").await.unwrap();
    for _ in 0..200 {
        if daemon.publisher().map(|p| p.subscriber_count()) == Some(1) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let ring = daemon.session().message_ring();
    write_record(ring, record("scale", "not for us")).unwrap();
    write_record(ring, record("logic", "for us")).unwrap();
    assert_eq!(daemon.drain_once().unwrap(), 2);

    let mut lines = BufReader::new(sub).lines();
    let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let value: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(value["topic"], "rt.logic");
    assert_eq!(value["text"], "for us");
}
