//! Object store shared through a named segment.

use rtx_hal::{
    CompKind, HAL_LAYOUT_VERSION, HAL_MAGIC, HalError, HalStore, HalType, HalValue, ObjectFilter,
    ObjectType, PinDir, Visit,
};
use rtx_shared_memory::{SegmentKey, SegmentManager, ShmError};
use std::sync::Arc;
use tempfile::TempDir;

fn manager() -> (TempDir, SegmentManager) {
    let dir = tempfile::tempdir().unwrap();
    let mgr = SegmentManager::new(dir.path());
    (dir, mgr)
}

#[test]
fn second_handle_sees_objects_and_values() {
    let (_dir, mgr) = manager();
    let owner = Arc::new(HalStore::create(&mgr, 3, 256 * 1024, 128).unwrap());
    {
        let mut g = owner.lock().unwrap();
        let c = g.comp_new("enc", CompKind::User, 42).unwrap();
        g.pin_new(c, "enc.count", HalType::S32, PinDir::Out, 0).unwrap();
        g.net("count", &["enc.count"]).unwrap();
    }

    let other = Arc::new(HalStore::attach(&mgr, 3).unwrap());
    let count = owner.pin_ref("enc.count").unwrap();
    count.set(HalValue::S32(-17));
    assert_eq!(
        other.lock().unwrap().signal_get("count").unwrap(),
        HalValue::S32(-17)
    );
    assert_eq!(other.lock().unwrap().comp_info("enc").unwrap().pid, 42);

    other.lock().unwrap().signal_new("from_other", HalType::Bit).unwrap();
    assert!(owner
        .lock()
        .unwrap()
        .find(ObjectType::Signal, "from_other")
        .is_some());
}

#[test]
fn attach_requires_existing_store() {
    let (_dir, mgr) = manager();
    assert!(matches!(
        HalStore::attach(&mgr, 9),
        Err(HalError::Shm(ShmError::NotFound { .. }))
    ));
    let store = HalStore::create(&mgr, 9, 64 * 1024, 16).unwrap();
    assert!(matches!(
        HalStore::create(&mgr, 9, 64 * 1024, 16),
        Err(HalError::Shm(ShmError::AlreadyExists { .. }))
    ));
    store.unlink().unwrap();
    store.unlink().unwrap();
}

#[test]
fn rejected_layout_publishes_nothing() {
    let (dir, mgr) = manager();
    assert!(matches!(
        HalStore::create(&mgr, 5, 256 * 1024, 0),
        Err(HalError::InvalidArgument(_))
    ));
    assert!(matches!(
        HalStore::create(&mgr, 5, 64 * 1024, 1_000_000),
        Err(HalError::InvalidArgument(_))
    ));
    assert!(!mgr.exists(SegmentKey::hal(5)));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    assert!(matches!(
        HalStore::attach(&mgr, 5),
        Err(HalError::Shm(ShmError::NotFound { .. }))
    ));

    let store = HalStore::create(&mgr, 5, 256 * 1024, 64).unwrap();
    assert!(store.is_ready());
    assert!(HalStore::attach(&mgr, 5).unwrap().is_ready());
}

#[test]
fn uninitialised_store_is_not_attached() {
    let (_dir, mgr) = manager();
    let _raw = mgr
        .create(SegmentKey::hal(6), 64 * 1024, HAL_MAGIC, HAL_LAYOUT_VERSION)
        .unwrap();
    assert!(matches!(
        HalStore::attach(&mgr, 6),
        Err(HalError::Shm(ShmError::StartupTimeout { .. }))
    ));
}

#[test]
fn foreach_filters_by_owner_type_and_pattern() {
    let store = HalStore::in_memory(256 * 1024, 128).unwrap();
    let mut g = store.lock().unwrap();
    let a = g.comp_new("axis", CompKind::Remote, 0).unwrap();
    let b = g.comp_new("spindle", CompKind::Remote, 0).unwrap();
    for n in ["axis.x.pos", "axis.y.pos", "axis.x.vel"] {
        g.pin_new(a, n, HalType::Float, PinDir::In, 0).unwrap();
    }
    g.pin_new(b, "spindle.on", HalType::Bit, PinDir::In, 0).unwrap();

    let owned = ObjectFilter::of_type(ObjectType::Pin).owned_by(a.id);
    assert_eq!(g.count(&owned), 3);
    assert_eq!(
        g.names(&owned.clone().matching("axis.?.pos")),
        vec!["axis.x.pos", "axis.y.pos"]
    );
    assert_eq!(
        g.names(&ObjectFilter::of_type(ObjectType::Pin).matching("*[!s]")),
        vec!["axis.x.vel", "spindle.on"]
    );

    let mut first = None;
    let visited = g.foreach(&owned, |g, r| {
        first = Some(g.header(r).name().to_string());
        Visit::Stop
    });
    assert_eq!(visited, 1);
    assert_eq!(first.as_deref(), Some("axis.x.pos"));
}

#[test]
fn heap_exhaustion_is_reported() {
    let store = HalStore::in_memory(16 * 1024, 1024).unwrap();
    let mut g = store.lock().unwrap();
    let mut created = 0;
    let err = loop {
        match g.signal_new(&format!("s{created}"), HalType::U64) {
            Ok(_) => created += 1,
            Err(e) => break e,
        }
    };
    assert!(created > 10);
    assert!(matches!(err, HalError::AllocationExhausted { what: "heap" }));
    g.signal_delete("s0").unwrap();
    g.signal_new("again", HalType::U64).unwrap();
}
