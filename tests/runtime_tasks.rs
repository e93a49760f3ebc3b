//! Per-flow tasks wired together by hand over memory channels.

use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use mpflow::error::{ChannelError, ChannelErrorKind, Error, TransportError};
use mpflow::metrics::{MemorySink, MetricsSink};
use mpflow::multipath::{
    DrainPolicy, FlowSpec, MemoryChannel, MemoryLink, MultipathReceiver, PathScheduler, PathSpec,
    ReassemblyConfig, SchedulerConfig, SchedulerState,
};
use mpflow::protocol::UnitCodec;
use mpflow::runtime::{spawn_receiver, spawn_sender};
use mpflow::types::{FlowId, FlowProtocol, PathId, SequenceNumber};
use mpflow::util::{FixedDraws, ManualClock};
use tokio_util::codec::{FramedRead, FramedWrite};

fn tcp_flow() -> FlowSpec {
    FlowSpec::new(FlowId::new(1), FlowProtocol::Tcp, 2_000_000.0)
        .with_packet_size(200)
        .with_path(PathSpec::new(PathId::new(0), 1_000_000.0))
        .with_path(PathSpec::new(PathId::new(1), 1_000_000.0))
}

fn build(
    spec: &FlowSpec,
    config: SchedulerConfig,
    draws: FixedDraws,
    send_buffer: usize,
) -> (PathScheduler<MemoryChannel, FixedDraws>, Vec<(PathId, MemoryLink)>) {
    let mut links = Vec::new();
    let scheduler = PathScheduler::for_flow(spec, config, draws, |path| {
        let (tx, rx) = MemoryChannel::pair(send_buffer);
        links.push((path.id, rx));
        tx
    })
    .unwrap();
    (scheduler, links)
}

#[tokio::test]
async fn test_stream_flow_reassembles_across_paths() {
    let spec = tcp_flow();
    let unit_size = spec.unit_size();
    let payload_size = spec.data_payload_size();
    let sink = Arc::new(MemorySink::new());

    // Alternate paths: 0.25 -> path-0, 0.75 -> path-1.
    let (scheduler, links) = build(
        &spec,
        SchedulerConfig::default(),
        FixedDraws::new([0.25, 0.75]),
        64 * unit_size,
    );
    let scheduler = scheduler.with_sink(Arc::clone(&sink) as Arc<dyn MetricsSink>);
    let receiver = MultipathReceiver::for_flow(&spec, &ReassemblyConfig::default())
        .unwrap()
        .with_sink(Arc::clone(&sink) as Arc<dyn MetricsSink>);

    let sender = spawn_sender(scheduler, 16);
    let (receiver, mut deliveries) = spawn_receiver(receiver, 64);

    for i in 0..20u8 {
        sender.send(Bytes::from(vec![i; payload_size])).await.unwrap();
    }
    sender.stop().await.unwrap();
    sender.close().await.unwrap();
    let report = sender.join().await.unwrap();
    assert_eq!(report.stats.units_sent, 20);
    assert_eq!(report.state, SchedulerState::Closed);

    // Path 1 arrives first, in odd-sized chunks; path 0 follows as one blob.
    let (path1, link1) = &links[1];
    while let Some(chunk) = link1.take(unit_size / 3 + 1) {
        receiver.data(*path1, chunk).await.unwrap();
    }
    let (path0, link0) = &links[0];
    while let Some(chunk) = link0.take(usize::MAX) {
        receiver.data(*path0, chunk).await.unwrap();
    }

    let mut order = Vec::new();
    for _ in 0..20 {
        let unit = deliveries.recv().await.unwrap();
        assert_eq!(unit.payload[0], unit.seq.get() as u8);
        assert_eq!(unit.size(), payload_size);
        order.push(unit.seq.get());
    }
    assert_eq!(order, (0..20).collect::<Vec<_>>());

    receiver.teardown().await.unwrap();
    let report = receiver.join().await.unwrap();
    assert_eq!(report.lost, 0);
    assert_eq!(report.stats.delivered, 20);
    assert!(report.stats.reordered > 0);

    let summary = sink.summary(spec.id);
    assert_eq!(summary.transmitted, 20);
    assert_eq!(summary.delivered, 20);
    assert_eq!(summary.bytes_delivered, 20 * payload_size as u64);
    assert_eq!(sink.delivery_order(spec.id), (0..20).map(SequenceNumber::new).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_backpressure_defers_until_capacity() {
    let spec = tcp_flow();
    let unit_size = spec.unit_size();
    let config = SchedulerConfig {
        drain_policy: DrainPolicy::Flush,
    };
    // Everything on path-0, which holds two units.
    let (scheduler, links) = build(&spec, config, FixedDraws::new([0.1]), 2 * unit_size);
    let sender = spawn_sender(scheduler, 16);

    for _ in 0..5 {
        sender.send(Bytes::from(vec![0; spec.data_payload_size()])).await.unwrap();
    }
    // Stop flushes what fits; the rest waits for capacity.
    sender.stop().await.unwrap();

    let (path, link) = &links[0];
    let mut received = 0;
    while received < 5 {
        match link.pop() {
            Some(unit) => {
                assert_eq!(unit.len(), unit_size);
                received += 1;
                sender.capacity_available(*path).await.unwrap();
            }
            None => tokio::task::yield_now().await,
        }
    }
    sender.close().await.unwrap();

    let report = sender.join().await.unwrap();
    assert_eq!(report.stats.units_sent, 5);
    assert_eq!(report.stats.units_deferred, 3);
    assert_eq!(report.discarded, 0);
    assert_eq!(report.per_path, vec![(PathId::new(0), 5), (PathId::new(1), 0)]);
}

#[tokio::test]
async fn test_send_failure_halts_flow_with_context() {
    let spec = tcp_flow();
    let (scheduler, links) = build(&spec, SchedulerConfig::default(), FixedDraws::new([0.9]), 10_000);
    let sender = spawn_sender(scheduler, 16);

    sender.send(Bytes::from(vec![0; spec.data_payload_size()])).await.unwrap();
    while links[1].1.queued_units() == 0 {
        tokio::task::yield_now().await;
    }
    links[1]
        .1
        .fail_next_send(ChannelError::new(ChannelErrorKind::NoRouteToHost, "link down"));
    sender.send(Bytes::from(vec![1; spec.data_payload_size()])).await.unwrap();

    let err = sender.join().await.unwrap_err();
    match err {
        Error::Transport(TransportError::SendFailed {
            flow,
            path,
            seq,
            size,
            source,
        }) => {
            assert_eq!(flow, spec.id);
            assert_eq!(path, PathId::new(1));
            assert_eq!(seq, SequenceNumber::new(1));
            assert_eq!(size, spec.unit_size());
            assert_eq!(source.kind, ChannelErrorKind::NoRouteToHost);
        }
        other => panic!("unexpected error {other}"),
    }
    // Channels are released even though the flow failed.
    assert!(links.iter().all(|(_, link)| link.is_closed()));
}

#[tokio::test]
async fn test_short_write_is_fatal() {
    let spec = tcp_flow();
    let (scheduler, links) = build(&spec, SchedulerConfig::default(), FixedDraws::new([0.1]), 10_000);
    links[0].1.set_accept_limit(Some(10));
    let sender = spawn_sender(scheduler, 16);

    sender.send(Bytes::from(vec![0; spec.data_payload_size()])).await.unwrap();
    let err = sender.join().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Transport(TransportError::ShortWrite { accepted: 10, .. })
    ));
}

#[tokio::test]
async fn test_teardown_reports_undelivered_units() {
    let mut receiver = MultipathReceiver::new(
        FlowId::new(4),
        FlowProtocol::Udp,
        0,
        &ReassemblyConfig::default(),
    )
    .unwrap()
    .with_clock(Arc::new(ManualClock::new()));
    receiver.add_path(PathId::new(0));
    let (handle, mut deliveries) = spawn_receiver(receiver, 8);

    for n in [0u64, 2, 3] {
        let unit = mpflow::protocol::tag(n.into(), b"payload");
        handle.data(PathId::new(0), unit).await.unwrap();
    }
    assert_eq!(deliveries.recv().await.unwrap().seq, SequenceNumber::ZERO);

    handle.teardown().await.unwrap();
    let report = handle.join().await.unwrap();
    assert_eq!(report.stats.delivered, 1);
    assert_eq!(report.lost, 2);
    assert!(deliveries.recv().await.is_none());
}

#[tokio::test]
async fn test_unit_codec_over_byte_stream() {
    let codec = UnitCodec::new(24).unwrap();
    let (client, server) = tokio::io::duplex(7);

    let writer = tokio::spawn(async move {
        let mut framed = FramedWrite::new(client, codec);
        for n in 0..10u64 {
            let payload = Bytes::from(vec![n as u8; 16]);
            framed.send((SequenceNumber::new(n), payload)).await.unwrap();
        }
    });

    let mut framed = FramedRead::new(server, codec);
    let mut seen = Vec::new();
    while let Some(item) = framed.next().await {
        let (seq, payload) = item.unwrap();
        assert_eq!(payload, Bytes::from(vec![seq.get() as u8; 16]));
        seen.push(seq.get());
    }
    writer.await.unwrap();
    assert_eq!(seen, (0..10).collect::<Vec<_>>());
}
