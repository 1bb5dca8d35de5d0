//! Session startup ordering across threads standing in for processes

use rtx_common::config::SessionConfig;
use rtx_common::flavor::Flavor;
use rtx_shared_memory::{
    LogRecord, MsgOrigin, Session, SessionState, SegmentManager, ShmError, ShmResult,
};
use std::time::Duration;
use tempfile::TempDir;

fn config(dir: &TempDir) -> SessionConfig {
    SessionConfig {
        instance: 1,
        shm_dir: dir.path().to_path_buf(),
        global_size: 256 * 1024,
        message_ring_size: 32 * 1024,
        ..Default::default()
    }
}

#[test]
fn test_attacher_waits_for_daemon() -> ShmResult<()> {
    let dir = TempDir::new()?;
    let cfg = config(&dir);
    let mgr = SegmentManager::from_config(&cfg);

    let daemon = {
        let cfg = cfg.clone();
        std::thread::spawn(move || -> ShmResult<Session> {
            std::thread::sleep(Duration::from_millis(50));
            Session::create(&SegmentManager::from_config(&cfg), &cfg, Flavor::Posix)
        })
    };

    let session = Session::attach(&mgr, 1, 50, Duration::from_millis(10))?;
    assert_eq!(session.state(), SessionState::Ready);
    let owner = daemon.join().expect("daemon thread panicked")?;
    assert_eq!(owner.flavor(), Some(Flavor::Posix));
    Ok(())
}

#[test]
fn test_messages_cross_handles() -> ShmResult<()> {
    let dir = TempDir::new()?;
    let cfg = config(&dir);
    let mgr = SegmentManager::from_config(&cfg);
    let daemon = Session::create(&mgr, &cfg, Flavor::Posix)?;
    let host = Session::attach_configured(&mgr, &cfg)?;

    let rec = LogRecord::new(MsgOrigin::Rt, cfg.rt_msg_level, "logic", "started");
    host.message_ring().record_writer()?.write(&rec.encode()?)?;

    let mut reader = daemon.message_ring().record_reader()?;
    let mut buf = Vec::new();
    reader.read(&mut buf)?;
    assert_eq!(LogRecord::decode(&buf)?, rec);
    Ok(())
}

#[test]
fn test_exit_is_seen_by_late_attachers() -> ShmResult<()> {
    let dir = TempDir::new()?;
    let cfg = config(&dir);
    let mgr = SegmentManager::from_config(&cfg);
    let daemon = Session::create(&mgr, &cfg, Flavor::Posix)?;
    let early = Session::attach_configured(&mgr, &cfg)?;
    daemon.mark_exited();
    assert_eq!(early.state(), SessionState::Exited);
    assert!(matches!(
        Session::attach(&mgr, 1, 2, Duration::from_millis(1)),
        Err(ShmError::SessionExited { .. })
    ));
    Ok(())
}

#[test]
fn test_second_daemon_refused() -> ShmResult<()> {
    let dir = TempDir::new()?;
    let cfg = config(&dir);
    let mgr = SegmentManager::from_config(&cfg);
    let _daemon = Session::create(&mgr, &cfg, Flavor::Posix)?;
    assert!(matches!(
        Session::create(&mgr, &cfg, Flavor::Posix),
        Err(ShmError::AlreadyExists { .. })
    ));
    Ok(())
}
