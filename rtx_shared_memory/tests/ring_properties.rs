//! Record and stream ring integrity against a queue model

use proptest::prelude::*;
use rtx_shared_memory::{RingBuffer, RingConfig, ShmError};
use std::collections::VecDeque;

#[derive(Debug, Clone)]
enum Step {
    Write(Vec<u8>),
    Read,
}

fn step(max: usize) -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => prop::collection::vec(any::<u8>(), 0..max).prop_map(Step::Write),
        2 => Just(Step::Read),
    ]
}

proptest! {
    #[test]
    fn record_ring_matches_queue(steps in prop::collection::vec(step(120), 1..300)) {
        let ring = RingBuffer::create_local("prop", &RingConfig::record(512)).unwrap();
        let mut w = ring.record_writer().unwrap();
        let mut r = ring.record_reader().unwrap();
        let mut model: VecDeque<Vec<u8>> = VecDeque::new();
        let mut buf = Vec::new();
        let mut rejected = 0u64;

        for s in steps {
            match s {
                Step::Write(data) => match w.write(&data) {
                    Ok(()) => model.push_back(data),
                    Err(ShmError::WouldBlock) => rejected += 1,
                    Err(e) => prop_assert!(false, "unexpected {e}"),
                },
                Step::Read => match (r.read(&mut buf), model.pop_front()) {
                    (Ok(_), Some(expected)) => prop_assert_eq!(&buf, &expected),
                    (Err(ShmError::Empty), None) => {}
                    (got, want) => prop_assert!(false, "{got:?} vs {want:?}"),
                },
            }
        }
        prop_assert_eq!(ring.stats().full, rejected);
        while let Some(expected) = model.pop_front() {
            r.read(&mut buf).unwrap();
            prop_assert_eq!(&buf, &expected);
        }
        prop_assert!(r.is_empty());
    }

    #[test]
    fn stream_ring_preserves_accepted_bytes(steps in prop::collection::vec(step(100), 1..300)) {
        let ring = RingBuffer::create_local("prop", &RingConfig::stream(256)).unwrap();
        let mut w = ring.stream_writer().unwrap();
        let mut r = ring.stream_reader().unwrap();
        let mut model: VecDeque<u8> = VecDeque::new();

        for s in steps {
            match s {
                Step::Write(data) => {
                    let free = 256 - model.len();
                    let n = w.write(&data);
                    prop_assert_eq!(n, data.len().min(free));
                    model.extend(&data[..n]);
                }
                Step::Read => {
                    let mut buf = [0u8; 37];
                    let n = r.read(&mut buf);
                    let want: Vec<u8> = model.drain(..n.min(model.len())).collect();
                    prop_assert_eq!(&buf[..n], &want[..]);
                }
            }
            prop_assert_eq!(r.available(), model.len());
        }
    }
}
