//! Segment creation, attachment and reclaim

use rtx_shared_memory::{
    OwnerState, SegmentDiscovery, SegmentKey, SegmentManager, ShmError, ShmResult,
};
use std::sync::{Arc, Barrier};
use tempfile::TempDir;

const MAGIC: u32 = 0x7465_7374;

#[test]
fn test_create_attach_detach() -> ShmResult<()> {
    let dir = TempDir::new()?;
    let mgr = SegmentManager::new(dir.path());
    let key = SegmentKey::hal(0);

    let owner = mgr.create(key, 8192, MAGIC, 1)?;
    // SAFETY: 8192 data bytes are mapped.
    unsafe { owner.data_ptr().write(0x5A) };

    let a = mgr.attach(key, MAGIC, 1)?;
    let b = mgr.attach(key, MAGIC, 1)?;
    assert_eq!(owner.attach_count(), 2);
    // SAFETY: as above.
    assert_eq!(unsafe { a.data_ptr().read() }, 0x5A);
    drop(a);
    b.detach();
    assert_eq!(owner.attach_count(), 0);

    owner.unlink()?;
    owner.unlink()?;
    assert!(matches!(
        mgr.attach(key, MAGIC, 1),
        Err(ShmError::NotFound { .. })
    ));
    Ok(())
}

#[test]
fn test_version_mismatch_refused() -> ShmResult<()> {
    let dir = TempDir::new()?;
    let mgr = SegmentManager::new(dir.path());
    let key = SegmentKey::global(3);
    let _owner = mgr.create(key, 4096, MAGIC, 2)?;

    assert!(matches!(
        mgr.attach(key, MAGIC, 1),
        Err(ShmError::VersionMismatch {
            found_version: 2,
            ..
        })
    ));
    assert!(matches!(
        mgr.attach(key, MAGIC + 1, 2),
        Err(ShmError::VersionMismatch { .. })
    ));
    Ok(())
}

#[test]
fn test_live_owner_blocks_second_create() -> ShmResult<()> {
    let dir = TempDir::new()?;
    let mgr = SegmentManager::new(dir.path());
    let key = SegmentKey::hal(4);
    let _owner = mgr.create(key, 4096, MAGIC, 1)?;

    assert!(matches!(
        mgr.probe_owner(key)?,
        OwnerState::Live { pid } if pid == std::process::id()
    ));
    assert!(matches!(
        mgr.create(key, 4096, MAGIC, 1),
        Err(ShmError::AlreadyExists { .. })
    ));
    Ok(())
}

#[test]
fn test_stale_segment_is_reclaimed() -> ShmResult<()> {
    let dir = TempDir::new()?;
    let mgr = SegmentManager::new(dir.path());
    let key = SegmentKey::hal(5);

    let first = mgr.create(key, 4096, MAGIC, 1)?;
    drop(first);
    assert!(matches!(mgr.probe_owner(key)?, OwnerState::Stale { .. }));

    let second = mgr.create(key, 4096, MAGIC, 1)?;
    assert!(second.reclaimed());
    assert!(matches!(mgr.probe_owner(key)?, OwnerState::Live { .. }));
    Ok(())
}

#[test]
fn test_concurrent_creators_one_wins() -> ShmResult<()> {
    let dir = TempDir::new()?;
    let mgr = Arc::new(SegmentManager::new(dir.path()));
    let key = SegmentKey::global(7);
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let mgr = mgr.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                mgr.create(key, 4096, MAGIC, 1)
            })
        })
        .collect();

    let results: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("creator thread panicked"))
        .collect();
    let winners: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
    assert_eq!(winners.len(), 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, ShmError::AlreadyExists { .. }))
    );
    Ok(())
}

#[test]
fn test_racing_reclaimers_one_wins() -> ShmResult<()> {
    for round in 0..20u8 {
        let dir = TempDir::new()?;
        let mgr = Arc::new(SegmentManager::new(dir.path()));
        let key = SegmentKey::hal(round);
        drop(mgr.create(key, 4096, MAGIC, 1)?);
        assert!(matches!(mgr.probe_owner(key)?, OwnerState::Stale { .. }));

        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mgr = mgr.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    mgr.create(key, 4096, MAGIC, 1)
                })
            })
            .collect();
        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("creator thread panicked"))
            .collect();

        let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1, "round {}", round);
        assert!(
            results
                .iter()
                .filter_map(|r| r.as_ref().err())
                .all(|e| matches!(e, ShmError::AlreadyExists { .. }))
        );
        // The winner's file is the one published under the key.
        assert!(matches!(mgr.probe_owner(key)?, OwnerState::Live { .. }));
        let attached = mgr.attach(key, MAGIC, 1)?;
        assert_eq!(winners[0].attach_count(), 1);
        drop(attached);
    }
    Ok(())
}

#[test]
fn test_instances_do_not_collide() -> ShmResult<()> {
    let dir = TempDir::new()?;
    let mgr = SegmentManager::new(dir.path());
    let _a = mgr.create(SegmentKey::global(0), 4096, MAGIC, 1)?;
    let _b = mgr.create(SegmentKey::global(1), 4096, MAGIC, 1)?;
    let _c = mgr.create(SegmentKey::hal(1), 4096, MAGIC, 1)?;

    let disc = SegmentDiscovery::new(&mgr);
    assert_eq!(disc.list_instance(0)?.len(), 1);
    assert_eq!(disc.list_instance(1)?.len(), 2);
    assert_eq!(disc.unlink_instance(1)?, 2);
    assert!(mgr.exists(SegmentKey::global(0)));
    Ok(())
}

#[test]
fn test_invalid_sizes_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let mgr = SegmentManager::new(dir.path());
    assert!(matches!(
        mgr.create(SegmentKey::hal(0), 16, MAGIC, 1),
        Err(ShmError::InvalidSize { size: 16 })
    ));
}
