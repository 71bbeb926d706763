//! Property tests for the sequence accountant and for relocation racing a
//! live segment writer.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use common::*;
use proptest::prelude::*;
use testbed::recording::{SegmentWriter, is_provisional};
use testbed::{Relocator, SeqWidth, SequenceAccountant};

fn feed(acc: &mut SequenceAccountant, seqs: impl IntoIterator<Item = u64>) {
    for seq in seqs {
        acc.observe(seq, 200);
    }
}

#[test]
fn hundred_packets_with_five_dropped() {
    let dropped = [15u64, 32, 48, 67, 83];
    let mut acc = SequenceAccountant::rtp();
    feed(&mut acc, (0..100).filter(|s| !dropped.contains(s)));

    let snap = acc.snapshot();
    assert_eq!(snap.received, 95);
    assert_eq!(snap.unique, 95);
    assert_eq!(snap.expected_span, 100);
    assert!((snap.loss_rate - 0.05).abs() < 1e-12);
    assert_eq!(acc.missing(20), dropped);
}

#[test]
fn small_gap_loss_rate() {
    let mut acc = SequenceAccountant::rtp();
    feed(&mut acc, [0, 1, 3, 4]);
    let snap = acc.snapshot();
    assert_eq!((snap.expected_span, snap.unique), (5, 4));
    assert!((snap.loss_rate - 0.2).abs() < 1e-12);
}

proptest! {
    #[test]
    fn counters_stay_consistent(seqs in prop::collection::vec(any::<u16>(), 1..400)) {
        let mut acc = SequenceAccountant::rtp();
        feed(&mut acc, seqs.iter().map(|&s| s as u64));
        let snap = acc.snapshot();

        prop_assert_eq!(snap.received, seqs.len() as u64);
        prop_assert!(snap.received >= snap.unique);
        prop_assert_eq!(snap.received - snap.unique, snap.duplicates);
        prop_assert!(snap.unique <= snap.expected_span);
        prop_assert!((0.0..=1.0).contains(&snap.loss_rate));
        prop_assert_eq!(snap.lost, snap.expected_span - snap.unique);
    }

    #[test]
    fn snapshot_is_idempotent(seqs in prop::collection::vec(any::<u16>(), 0..200)) {
        let mut acc = SequenceAccountant::rtp();
        feed(&mut acc, seqs.iter().map(|&s| s as u64));
        prop_assert_eq!(acc.snapshot(), acc.snapshot());
        prop_assert_eq!(acc.missing(50), acc.missing(50));
    }

    #[test]
    fn wraparound_is_continuous(start in any::<u16>(), len in 1u64..3_000) {
        let mut acc = SequenceAccountant::rtp();
        feed(&mut acc, (0..len).map(|i| (start as u64 + i) % 65_536));
        let snap = acc.snapshot();
        prop_assert_eq!(snap.expected_span, len);
        prop_assert_eq!(snap.lost, 0);
        prop_assert_eq!(snap.out_of_order, 0);
    }

    #[test]
    fn dropped_packets_are_listed(
        start in any::<u32>(),
        drops in prop::collection::btree_set(1u64..499, 0..30),
    ) {
        let mut acc = SequenceAccountant::new(SeqWidth::W32);
        let wire = |i: u64| (start as u64 + i) % (1 << 32);
        feed(&mut acc, (0..500).filter(|i| !drops.contains(i)).map(wire));

        let snap = acc.snapshot();
        prop_assert_eq!(snap.expected_span, 500);
        prop_assert_eq!(snap.lost, drops.len() as u64);
        let missing: BTreeSet<u64> = acc.missing(100).into_iter().collect();
        let expected: BTreeSet<u64> = drops.iter().map(|&i| wire(i)).collect();
        prop_assert_eq!(missing, expected);
    }
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Frame,
    Relocate,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![3 => Just(Step::Frame), 1 => Just(Step::Relocate)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn relocation_never_takes_a_provisional_file(steps in prop::collection::vec(step(), 1..60)) {
        let src = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let config = config(src.path(), root.path());
        let relocator = Relocator::new(config.clone()).unwrap();
        let mut writer = SegmentWriter::new(&stream(), &config.recording, Arc::new(RawEncoderFactory::default()))
            .unwrap()
            .with_clock(noon);

        for (i, step) in steps.iter().enumerate() {
            match step {
                Step::Frame => {
                    writer.write_frame(&[i as u8; FRAME_LEN], Some("overlay")).unwrap();
                }
                Step::Relocate => {
                    // Offer every file, provisional ones included.
                    for path in files_under(src.path()) {
                        let _ = relocator.on_finalized(&path);
                    }
                }
            }
            for path in files_under(root.path()) {
                prop_assert!(!is_provisional(&file_name(&path)), "{}", path.display());
                if path.extension().is_some_and(|e| e == "mp4") {
                    let size = std::fs::metadata(&path).unwrap().len();
                    prop_assert!(size > 0 && size % FRAME_LEN as u64 == 0);
                }
            }
            if let Some(open) = writer.current_path() {
                prop_assert!(open.exists());
            }
        }

        writer.close().unwrap();
        relocator.recover().unwrap();
        prop_assert!(files_under(src.path()).is_empty());
        let archived = files_under(root.path());
        let videos = archived.iter().filter(|p| p.extension().is_some_and(|e| e == "mp4")).count();
        let captions = archived.iter().filter(|p| p.extension().is_some_and(|e| e == "srt")).count();
        prop_assert_eq!(videos, captions);
    }
}
