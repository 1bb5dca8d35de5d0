//! Linking rules under arbitrary command sequences.

use proptest::prelude::*;
use rtx_hal::{CompKind, HalError, HalGuard, HalStore, HalType, ObjectFilter, ObjectType, PinDir};

const PINS: [(&str, PinDir); 6] = [
    ("c.out0", PinDir::Out),
    ("c.out1", PinDir::Out),
    ("c.io0", PinDir::Io),
    ("c.io1", PinDir::Io),
    ("c.in0", PinDir::In),
    ("c.in1", PinDir::In),
];
const SIGNALS: [&str; 3] = ["s0", "s1", "s2"];

#[derive(Debug, Clone)]
enum Op {
    Net(usize, Vec<usize>),
    Link(usize, usize),
    Unlink(usize),
    DelSig(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..3usize, prop::collection::vec(0..6usize, 1..4)).prop_map(|(s, p)| Op::Net(s, p)),
        (0..6usize, 0..3usize).prop_map(|(p, s)| Op::Link(p, s)),
        (0..6usize).prop_map(Op::Unlink),
        (0..3usize).prop_map(Op::DelSig),
    ]
}

fn setup(store: &HalStore) {
    let mut g = store.lock().unwrap();
    let c = g.comp_new("c", CompKind::Remote, 0).unwrap();
    for (name, dir) in PINS {
        g.pin_new(c, name, HalType::Float, dir, 0).unwrap();
    }
}

fn check_invariants(g: &mut HalGuard<'_>) {
    for sig in g.names(&ObjectFilter::of_type(ObjectType::Signal)) {
        let info = g.signal_info(&sig).unwrap();
        assert!(info.writers + info.bidirs <= 1, "{sig}: {info:?}");
        let count = |d: PinDir| info.pins.iter().filter(|(_, dir)| *dir == d).count() as u32;
        assert_eq!(count(PinDir::Out), info.writers);
        assert_eq!(count(PinDir::Io), info.bidirs);
        assert_eq!(count(PinDir::In), info.readers);
    }
    for (name, _) in PINS {
        let pin = g.pin_info(name).unwrap();
        if let Some(sig) = pin.signal {
            let info = g.signal_info(&sig).unwrap();
            assert_eq!(info.pins.iter().filter(|(p, _)| p == name).count(), 1);
        }
    }
}

proptest! {
    #[test]
    fn driver_rule_holds(ops in prop::collection::vec(op(), 1..40)) {
        let store = HalStore::in_memory(256 * 1024, 128).unwrap();
        setup(&store);
        let mut g = store.lock().unwrap();
        for op in ops {
            let before = g.names(&ObjectFilter::of_type(ObjectType::Signal));
            let res = match &op {
                Op::Net(s, pins) => {
                    let names: Vec<&str> = pins.iter().map(|&i| PINS[i].0).collect();
                    g.net(SIGNALS[*s], &names).map(|_| ())
                }
                Op::Link(p, s) => g.link(PINS[*p].0, SIGNALS[*s]),
                Op::Unlink(p) => g.unlink(PINS[*p].0),
                Op::DelSig(s) => g.signal_delete(SIGNALS[*s]),
            };
            if res.is_err() {
                if let Op::Net(..) = op {
                    prop_assert_eq!(g.names(&ObjectFilter::of_type(ObjectType::Signal)), before);
                }
            }
            check_invariants(&mut g);
        }
    }
}

#[test]
fn second_writer_scenario() {
    let store = HalStore::in_memory(128 * 1024, 64).unwrap();
    let mut g = store.lock().unwrap();
    let c = g.comp_new("comp", CompKind::Remote, 0).unwrap();
    let c2 = g.comp_new("comp2", CompKind::Remote, 0).unwrap();
    g.pin_new(c, "comp.out", HalType::Float, PinDir::Out, 0).unwrap();
    g.pin_new(c2, "comp2.out2", HalType::Float, PinDir::Out, 0).unwrap();

    g.net("s1", &["comp.out"]).unwrap();
    let info = g.signal_info("s1").unwrap();
    assert_eq!((info.hal_type, info.writers), (HalType::Float, 1));

    assert!(matches!(
        g.net("s1", &["comp2.out2"]),
        Err(HalError::CardinalityViolation { .. })
    ));
    assert_eq!(g.signal_info("s1").unwrap().writers, 1);
    assert_eq!(g.pin_info("comp2.out2").unwrap().signal, None);
}

#[test]
fn double_unlink_is_a_no_op() {
    let store = HalStore::in_memory(128 * 1024, 64).unwrap();
    setup(&store);
    let mut g = store.lock().unwrap();
    g.unlink("c.in0").unwrap();
    g.net("s", &["c.in0"]).unwrap();
    g.unlink("c.in0").unwrap();
    g.unlink("c.in0").unwrap();
    assert_eq!(g.signal_info("s").unwrap().readers, 0);
}
