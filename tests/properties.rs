//! Behavioural properties of the scheduling and resequencing engine,
//! exercised through the public API.

use std::net::Ipv4Addr;

use bytes::Bytes;
use mpflow::error::{Error, ProtocolError, RoutingError};
use mpflow::multipath::{
    DuplicatePolicy, FlowSpec, MemoryChannel, PathScheduler, PathSpec, ReassemblyBuffer,
    ReassemblyConfig, SchedulerConfig, SendOutcome,
};
use mpflow::protocol::{tag, untag, StreamDefragmenter};
use mpflow::routing::SplitRatioTable;
use mpflow::types::{FlowId, FlowKey, FlowProtocol, PathId, SequenceNumber};
use mpflow::util::{FixedDraws, RandomStreams};

fn key(src_port: u16) -> FlowKey {
    FlowKey::new(
        Ipv4Addr::new(10, 0, 0, 1),
        Ipv4Addr::new(10, 0, 0, 2),
        src_port,
        9,
        FlowProtocol::Tcp,
    )
}

fn seq(n: u64) -> SequenceNumber {
    SequenceNumber::new(n)
}

fn payload(len: usize, fill: u8) -> Bytes {
    Bytes::from(vec![fill; len])
}

#[test]
fn test_normalization_invariant() {
    let mut table = SplitRatioTable::new();
    let flows = [key(1), key(2), key(3)];
    for (i, flow) in flows.iter().enumerate() {
        for (j, weight) in [0.0, 3.7, 1.2, 1.2, 9.9].iter().enumerate() {
            table.add_choice(*flow, weight * (i + 1) as f64, j).unwrap();
        }
    }
    table.reconcile().unwrap();

    for flow in &flows {
        let choices = table.choices(flow).unwrap();
        assert_eq!(choices.len(), 4, "zero weight dropped");
        assert_eq!(choices.last().unwrap().weight, 1.0);
        for pair in choices.windows(2) {
            assert!(pair[0].weight >= 0.0);
            assert!(pair[0].weight <= pair[1].weight);
        }
    }
}

#[test]
fn test_equal_weights_keep_insertion_order() {
    let mut table = SplitRatioTable::new();
    let flow = key(1);
    table.add_choice(flow, 1.0, "first").unwrap();
    table.add_choice(flow, 1.0, "second").unwrap();
    table.reconcile().unwrap();

    assert_eq!(*table.select(&flow, 0.0).unwrap(), "first");
    assert_eq!(*table.select(&flow, 0.5).unwrap(), "first");
    assert_eq!(*table.select(&flow, 0.75).unwrap(), "second");
}

#[test]
fn test_determinism_under_fixed_draws() {
    let mut table = SplitRatioTable::new();
    let flow = key(1);
    table.add_choice(flow, 0.2, 'c').unwrap();
    table.add_choice(flow, 0.5, 'a').unwrap();
    table.add_choice(flow, 0.3, 'b').unwrap();
    table.reconcile().unwrap();

    let draws = [0.01, 0.49, 0.5, 0.51, 0.79, 0.8, 0.81, 0.999];
    let pick = |t: &SplitRatioTable<char>| -> Vec<char> {
        let mut source = FixedDraws::new(draws);
        (0..draws.len())
            .map(|_| *t.select_with(&flow, &mut source).unwrap())
            .collect()
    };

    let first = pick(&table);
    assert_eq!(first, vec!['a', 'a', 'a', 'b', 'b', 'b', 'c', 'c']);
    assert_eq!(pick(&table), first);
}

#[test]
fn test_weighted_distribution_converges() {
    let mut table = SplitRatioTable::new();
    let flow = key(1);
    let weights = [(PathId::new(0), 0.5), (PathId::new(1), 0.3), (PathId::new(2), 0.2)];
    for (path, weight) in weights {
        table.add_choice(flow, weight, path).unwrap();
    }
    table.reconcile().unwrap();

    let mut rng = RandomStreams::new(42, 1).next_rng();
    let draws = 100_000;
    let mut counts = [0u32; 3];
    for _ in 0..draws {
        let path = table.select_with(&flow, &mut rng).unwrap();
        counts[path.get() as usize] += 1;
    }

    for (path, weight) in weights {
        let fraction = f64::from(counts[path.get() as usize]) / f64::from(draws);
        assert!(
            (fraction - weight).abs() <= 0.01,
            "{path}: {fraction} vs {weight}"
        );
    }
}

#[test]
fn test_missing_and_empty_flows_are_distinct_errors() {
    let mut table: SplitRatioTable<u8> = SplitRatioTable::new();
    table.add_choice(key(1), 0.0, 1).unwrap();
    table.reconcile().unwrap();

    assert!(matches!(
        table.select(&key(1), 0.5),
        Err(Error::Routing(RoutingError::NoChoices { .. }))
    ));
    assert!(matches!(
        table.select(&key(2), 0.5),
        Err(Error::Routing(RoutingError::TableMiss { .. }))
    ));
}

#[test]
fn test_resequencing_correctness() {
    let mut buffer = ReassemblyBuffer::new(FlowId::new(1), &ReassemblyConfig::default());
    let mut delivered = Vec::new();
    for n in [2, 0, 4, 1, 3] {
        for unit in buffer.on_arrival(seq(n), payload(10, n as u8)).unwrap() {
            delivered.push(unit.seq.get());
        }
    }

    assert_eq!(delivered, vec![0, 1, 2, 3, 4]);
    assert!(buffer.is_empty());
    assert_eq!(buffer.expected(), seq(5));
}

#[test]
fn test_late_duplicate_is_detected() {
    let mut buffer = ReassemblyBuffer::new(FlowId::new(1), &ReassemblyConfig::default());
    for n in 0..=5 {
        buffer.on_arrival(seq(n), payload(4, 0)).unwrap();
    }

    let err = buffer.on_arrival(seq(5), payload(4, 0)).unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol(ProtocolError::LateDuplicate { seq: s, .. }) if s == seq(5)
    ));
    assert!(err.is_fatal());
}

#[test]
fn test_size_mismatch_is_detected() {
    for policy in [DuplicatePolicy::Fatal, DuplicatePolicy::LogAndDrop] {
        let config = ReassemblyConfig {
            duplicate_policy: policy,
            ..Default::default()
        };
        let mut buffer = ReassemblyBuffer::new(FlowId::new(1), &config);
        buffer.on_arrival(seq(7), payload(100, 7)).unwrap();

        let err = buffer.on_arrival(seq(7), payload(200, 7)).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::SizeMismatch {
                first: 100,
                got: 200,
                ..
            })
        ));
    }
}

#[test]
fn test_late_repeat_with_other_size_is_detected() {
    let config = ReassemblyConfig {
        duplicate_policy: DuplicatePolicy::LogAndDrop,
        ..Default::default()
    };
    let mut buffer = ReassemblyBuffer::new(FlowId::new(1), &config);
    assert_eq!(buffer.on_arrival(seq(0), payload(100, 0)).unwrap().len(), 1);

    // Same size: dropped by policy.
    assert!(buffer.on_arrival(seq(0), payload(100, 0)).unwrap().is_empty());
    let err = buffer.on_arrival(seq(0), payload(200, 0)).unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol(ProtocolError::SizeMismatch {
            first: 100,
            got: 200,
            ..
        })
    ));
    assert_eq!(buffer.stats().duplicates_dropped, 1);
}

#[test]
fn test_tag_round_trip() {
    for size in [0, 1, 7, 8, 9, 1_446, 65_535, 65_536, 70_000] {
        let data: Vec<u8> = (0..size).map(|i| (i % 253) as u8).collect();
        let s = seq(0xDEAD_BEEF_0000_0000 + size as u64);
        let (got_seq, got_payload) = untag(tag(s, &data)).unwrap();
        assert_eq!(got_seq, s);
        assert_eq!(&got_payload[..], &data[..]);
    }
}

#[test]
fn test_untag_rejects_short_unit() {
    assert!(matches!(
        untag(Bytes::from_static(&[0; 7])),
        Err(Error::Protocol(ProtocolError::MalformedUnit { len: 7, min: 8 }))
    ));
}

#[test]
fn test_defragmenter_framing_independent_of_chunking() {
    let unit_size = 100;
    let stream: Vec<u8> = (0..3 * unit_size).map(|i| (i % 256) as u8).collect();
    let chunkings: [&[usize]; 3] = [&[300], &[1; 300], &[37, 1, 99, 2, 150, 11]];

    for chunks in chunkings {
        let mut defrag = StreamDefragmenter::new();
        let mut units = Vec::new();
        let mut offset = 0;
        for &len in chunks {
            defrag.feed(&stream[offset..offset + len]);
            offset += len;
            units.extend(defrag.drain_units(unit_size));
        }
        assert_eq!(offset, stream.len());
        assert_eq!(units.len(), 3, "chunks {chunks:?}");
        assert!(units.iter().all(|u| u.len() == unit_size));
        assert_eq!(units.concat(), stream);
        assert!(defrag.is_empty());
    }
}

#[test]
fn test_zero_weight_flow_never_selects_or_opens() {
    let spec = FlowSpec::new(FlowId::new(9), FlowProtocol::Tcp, 0.0)
        .with_path(PathSpec::new(PathId::new(0), 1_000_000.0))
        .with_path(PathSpec::new(PathId::new(1), 1_000_000.0));

    let mut links = Vec::new();
    let mut scheduler = PathScheduler::for_flow(
        &spec,
        SchedulerConfig::default(),
        FixedDraws::new([0.5]),
        |path| {
            let (tx, rx) = MemoryChannel::pair(path.send_buffer);
            links.push(rx);
            tx
        },
    )
    .unwrap();

    scheduler.start().unwrap();
    for _ in 0..10 {
        let outcome = scheduler.send(payload(spec.data_payload_size(), 1)).unwrap();
        assert_eq!(outcome, SendOutcome::Inert);
    }
    scheduler.stop().unwrap();
    scheduler.close().unwrap();

    assert!(scheduler.is_inert());
    assert_eq!(scheduler.draws().taken(), 0);
    assert!(!scheduler.table().is_reconciled());
    assert!(links.iter().all(|l| l.open_calls() == 0 && l.queued_units() == 0));
}

#[test]
fn test_rated_flow_on_weightless_paths_fails_to_route() {
    let spec = FlowSpec::new(FlowId::new(10), FlowProtocol::Udp, 1_000_000.0)
        .with_path(PathSpec::new(PathId::new(0), 0.0))
        .with_path(PathSpec::new(PathId::new(1), 0.0));
    assert!(matches!(spec.validate(), Err(Error::InvalidConfig(_))));

    let mut scheduler = PathScheduler::for_flow(
        &spec,
        SchedulerConfig::default(),
        FixedDraws::new([0.5]),
        |path| MemoryChannel::pair(path.send_buffer).0,
    )
    .unwrap();
    scheduler.start().unwrap();
    assert!(!scheduler.is_inert());

    let err = scheduler.send(payload(spec.data_payload_size(), 1)).unwrap_err();
    assert!(matches!(err, Error::Routing(RoutingError::NoChoices { .. })));
    assert_eq!(scheduler.stats().inert_sends, 0);
}
