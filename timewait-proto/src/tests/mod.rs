use std::net::{Ipv4Addr, SocketAddr};

use assert_matches::assert_matches;
use bytes::Bytes;
use hex_literal::hex;

use super::*;

use util::*;

fn cid(name: &[u8]) -> ConnectionId {
    ConnectionId::new(name)
}

#[test]
fn termination_packets_replayed_in_order() {
    let _guard = subscribe();
    let mut h = Harness::new(config());
    let id = cid(b"abc123");
    let t1 = Bytes::from_static(b"termination one");
    let t2 = Bytes::from_static(b"termination two");
    h.add(id, TimeWaitAction::SendTerminationPackets, vec![t1.clone(), t2.clone()]);
    assert!(h.manager.is_connection_id_in_time_wait(&id));

    h.process(id);
    assert_eq!(h.written(), [t1, t2]);
    let writer = h.writer.state.lock().unwrap();
    for datagram in &writer.written {
        assert_eq!(datagram.destination, h.peer_address);
        assert_eq!(datagram.src_ip, h.self_address.ip());
    }
}

#[test]
fn stateless_reset_backs_off() {
    let _guard = subscribe();
    let mut h = Harness::new(config());
    let id = cid(b"deadbeef");
    h.add(id, TimeWaitAction::SendStatelessReset, Vec::new());

    let mut replies = Vec::new();
    for _ in 0..5 {
        let before = h.written().len();
        h.process(id);
        replies.push(h.written().len() - before);
    }
    assert_eq!(replies, [1, 1, 0, 1, 0]);

    let token = h.manager.stateless_reset_token(&id);
    for packet in h.written() {
        assert_eq!(&packet[packet.len() - RESET_TOKEN_SIZE..], &token[..]);
    }
    let stats = h.manager.stats();
    assert_eq!(stats.packets_received, 5);
    assert_eq!(stats.responses_throttled, 2);
    assert_eq!(stats.packets_written, 3);
}

#[test]
fn reset_token_is_stable() {
    let h = Harness::new(config());
    let id = cid(b"deadbeef");
    assert_eq!(
        h.manager.stateless_reset_token(&id),
        h.manager.stateless_reset_token(&id)
    );
    assert_ne!(
        h.manager.stateless_reset_token(&id),
        h.manager.stateless_reset_token(&cid(b"deadbeee"))
    );
}

#[test]
fn public_reset_for_google_quic() {
    let _guard = subscribe();
    let mut h = Harness::new(config());
    h.peer_address = SocketAddr::new(Ipv4Addr::new(192, 0, 2, 1).into(), 443);
    let id = cid(&hex!("0102030405060708"));
    h.manager.add_connection_id_to_time_wait(
        id,
        PacketFormat::Google,
        TimeWaitAction::SendStatelessReset,
        Vec::new(),
    );
    h.process(id);

    let written = h.written();
    assert_eq!(written.len(), 1);
    let packet = &written[0];
    assert_eq!(packet[0], 0x0a);
    assert_eq!(&packet[1..9], &id[..]);
    // Nonce proof followed by the peer's address
    assert!(packet.ends_with(&hex!("b5690f0000000000 0200 c0000201 bb01")));
}

#[test]
fn do_nothing_never_writes() {
    let _guard = subscribe();
    let mut h = Harness::new(config());
    let id = cid(b"silent");
    h.add(id, TimeWaitAction::DoNothing, Vec::new());
    for _ in 0..16 {
        h.process(id);
    }
    assert!(h.written().is_empty());
    assert!(!h.manager.has_pending_packets());
    assert_eq!(h.manager.stats().packets_received, 16);
}

#[test]
fn replacement_keeps_packet_count() {
    let _guard = subscribe();
    let mut h = Harness::new(config());
    let id = cid(b"reused");
    h.add(id, TimeWaitAction::SendStatelessReset, Vec::new());
    h.process(id);
    h.process(id);
    assert_eq!(h.written().len(), 2);

    let close = Bytes::from_static(b"close");
    h.add(id, TimeWaitAction::SendTerminationPackets, vec![close.clone()]);
    assert_eq!(h.manager.num_connections(), 1);
    assert_eq!(h.visitor.lock().unwrap().added, [id]);

    // Third packet overall, so throttled
    h.process(id);
    assert_eq!(h.written().len(), 2);
    // Fourth packet overall, answered with the new action
    h.process(id);
    assert_eq!(h.written().len(), 3);
    assert_eq!(h.written()[2], close);
}

#[test]
fn replacement_restarts_retention() {
    let period = Duration::from_secs(10);
    let mut config = config();
    config.time_wait_period(period).unwrap();
    let mut h = Harness::new(config);
    let id = cid(b"reused");
    h.add(id, TimeWaitAction::SendStatelessReset, Vec::new());
    h.advance(period / 2);
    h.add(id, TimeWaitAction::SendStatelessReset, Vec::new());
    h.advance(period / 2);
    assert!(h.manager.is_connection_id_in_time_wait(&id));
    h.advance(period / 2);
    assert!(!h.manager.is_connection_id_in_time_wait(&id));
}

#[test]
fn evicts_oldest() {
    let _guard = subscribe();
    let mut config = config();
    config.max_connections(Some(2)).unwrap();
    let mut h = Harness::new(config);
    let (a, b, c) = (cid(b"A"), cid(b"B"), cid(b"C"));
    for id in [a, b, c] {
        h.add(id, TimeWaitAction::SendStatelessReset, Vec::new());
    }
    assert!(!h.manager.is_connection_id_in_time_wait(&a));
    assert!(h.manager.is_connection_id_in_time_wait(&b));
    assert!(h.manager.is_connection_id_in_time_wait(&c));
    assert_eq!(h.manager.stats().evicted, 1);
}

#[test]
fn capacity_bound_holds() {
    let mut config = config();
    config.max_connections(Some(3)).unwrap();
    let mut h = Harness::new(config);
    for i in 0..10u8 {
        h.add(cid(&[i; 4]), TimeWaitAction::DoNothing, Vec::new());
        assert!(h.manager.num_connections() <= 3);
    }
    assert_eq!(h.manager.num_connections(), 3);
    assert_eq!(h.manager.stats().evicted, 7);
    assert_eq!(h.visitor.lock().unwrap().added.len(), 10);
    for i in 7..10u8 {
        assert!(h.manager.is_connection_id_in_time_wait(&cid(&[i; 4])));
    }
}

#[test]
fn unlimited_capacity() {
    let mut config = config();
    config.max_connections(None).unwrap();
    let mut h = Harness::new(config);
    for i in 0..1000u16 {
        h.add(cid(&i.to_be_bytes()), TimeWaitAction::DoNothing, Vec::new());
    }
    assert_eq!(h.manager.num_connections(), 1000);
    assert_eq!(h.manager.stats().evicted, 0);
}

#[test]
fn expires_after_time_wait_period() {
    let _guard = subscribe();
    let period = Duration::from_secs(10);
    let mut config = config();
    config.time_wait_period(period).unwrap();
    let mut h = Harness::new(config);
    let t0 = h.clock.approximate_now();
    assert_eq!(h.alarm_deadline(), Some(t0 + period));

    let id = cid(b"expiring");
    h.add(id, TimeWaitAction::SendStatelessReset, Vec::new());
    h.advance(period - Duration::from_millis(1));
    assert!(h.manager.is_connection_id_in_time_wait(&id));

    h.advance(Duration::from_millis(1));
    assert!(!h.manager.is_connection_id_in_time_wait(&id));
    assert_eq!(h.manager.stats().expired, 1);
    // Nothing left, so the next sweep is a full period out
    assert_eq!(h.alarm_deadline(), Some(t0 + 2 * period));
}

#[test]
fn alarm_tracks_oldest_entry() {
    let period = Duration::from_secs(10);
    let mut config = config();
    config.time_wait_period(period).unwrap();
    let mut h = Harness::new(config);
    let t0 = h.clock.approximate_now();

    h.advance(Duration::from_secs(3));
    h.add(cid(b"first"), TimeWaitAction::DoNothing, Vec::new());
    h.advance(Duration::from_secs(4));
    h.add(cid(b"second"), TimeWaitAction::DoNothing, Vec::new());

    // Initial sweep finds nothing old enough and aims at the first entry's expiry
    h.advance(Duration::from_secs(3));
    assert_eq!(h.manager.num_connections(), 2);
    assert_eq!(h.alarm_deadline(), Some(t0 + Duration::from_secs(13)));

    h.advance(Duration::from_secs(3));
    assert!(!h.manager.is_connection_id_in_time_wait(&cid(b"first")));
    assert!(h.manager.is_connection_id_in_time_wait(&cid(b"second")));
    assert_eq!(h.alarm_deadline(), Some(t0 + Duration::from_secs(17)));

    h.advance(Duration::from_secs(4));
    assert_eq!(h.manager.num_connections(), 0);
}

#[test]
fn lingering_entry_fires_immediately() {
    let period = Duration::from_secs(10);
    let mut config = config();
    config.time_wait_period(period).unwrap();
    let mut h = Harness::new(config);
    h.add(cid(b"late"), TimeWaitAction::DoNothing, Vec::new());

    // Clock moves past expiry without the alarm being serviced
    h.clock.advance(2 * period);
    h.manager.set_connection_id_clean_up_alarm();
    let now = h.clock.approximate_now();
    assert_eq!(h.alarm_deadline(), Some(now));

    h.advance(Duration::ZERO);
    assert_eq!(h.manager.num_connections(), 0);
}

#[test]
fn queued_writes_keep_order() {
    let _guard = subscribe();
    let mut h = Harness::new(config());
    let ids = [cid(b"one"), cid(b"two"), cid(b"three")];
    let packets = [
        Bytes::from_static(b"P1"),
        Bytes::from_static(b"P2"),
        Bytes::from_static(b"P3"),
    ];
    for (id, packet) in ids.iter().zip(&packets) {
        h.add(*id, TimeWaitAction::SendTerminationPackets, vec![packet.clone()]);
    }

    h.writer.set_blocked(true);
    for id in ids {
        h.process(id);
    }
    assert!(h.written().is_empty());
    assert!(h.manager.has_pending_packets());
    assert_eq!(h.visitor.lock().unwrap().write_blocked, 3);
    assert_eq!(h.manager.stats().packets_queued, 3);

    h.manager.on_blocked_writer_can_write();
    assert_eq!(h.written(), packets);
    assert!(!h.manager.has_pending_packets());
    assert_eq!(h.writer.state.lock().unwrap().set_writable_calls, 1);
}

#[test]
fn drain_stops_when_blocked_again() {
    let mut h = Harness::new(config());
    let packets = [
        Bytes::from_static(b"P1"),
        Bytes::from_static(b"P2"),
        Bytes::from_static(b"P3"),
    ];
    let id = cid(b"multi");
    h.add(id, TimeWaitAction::SendTerminationPackets, packets.to_vec());
    h.writer.set_blocked(true);
    h.process(id);
    assert_eq!(h.manager.stats().packets_queued, 3);

    // P1 goes out, P2 finds the socket full again
    h.writer.script([Scripted::Written, Scripted::Blocked]);
    h.manager.on_blocked_writer_can_write();
    assert_eq!(h.written(), &packets[..1]);
    assert!(h.manager.has_pending_packets());

    h.manager.on_blocked_writer_can_write();
    assert_eq!(h.written(), packets);
    assert!(!h.manager.has_pending_packets());
}

#[test]
fn blocked_but_buffered_is_delivered() {
    let mut h = Harness::new(config());
    let id = cid(b"buffered");
    h.add(id, TimeWaitAction::SendStatelessReset, Vec::new());
    h.writer.script([Scripted::BlockedDataBuffered]);
    h.process(id);

    assert_eq!(h.written().len(), 1);
    assert!(!h.manager.has_pending_packets());
    assert_eq!(h.visitor.lock().unwrap().write_blocked, 1);
    assert!(h.writer.is_write_blocked());
}

#[test]
fn batch_writer_is_flushed() {
    let mut h = Harness::new(config());
    h.writer.state.lock().unwrap().batch_mode = true;
    let id = cid(b"batched");
    let packet = Bytes::from_static(b"close");
    h.add(id, TimeWaitAction::SendTerminationPackets, vec![packet.clone()]);
    h.process(id);

    let state = h.writer.state.lock().unwrap();
    assert_eq!(state.flushes, 1);
    assert!(state.buffered.is_empty());
    assert_eq!(state.written.len(), 1);
    assert_eq!(state.written[0].contents, packet);
}

#[test]
fn write_errors_drop_packet() {
    let _guard = subscribe();
    let mut h = Harness::new(config());
    let id = cid(b"unreachable");
    h.add(id, TimeWaitAction::SendStatelessReset, Vec::new());
    h.writer.script([Scripted::Error, Scripted::Error]);
    h.process(id);
    h.process(id);

    assert!(h.written().is_empty());
    assert!(!h.manager.has_pending_packets());
    let stats = h.manager.stats();
    assert_eq!(stats.write_errors, 2);
    assert_eq!(stats.packets_written, 0);
}

#[test]
fn write_error_logging_is_rate_limited() {
    let (_guard, logs) = capture_warnings();
    let mut config = config();
    config.error_log_interval(Duration::from_secs(60));
    let mut h = Harness::new(config);
    let id = cid(b"flaky");
    h.add(id, TimeWaitAction::SendStatelessReset, Vec::new());
    h.writer
        .script([Scripted::Error, Scripted::Error, Scripted::Error]);

    h.process(id);
    assert_eq!(logs.count("failed to send termination reply"), 1);
    h.advance(Duration::from_secs(30));
    h.process(id);
    assert_eq!(logs.count("failed to send termination reply"), 1);

    // The third packet is throttled; the fourth is answered a full interval after the first error
    h.advance(Duration::from_secs(30));
    h.process(id);
    h.process(id);
    assert_eq!(logs.count("failed to send termination reply"), 2);
    assert_eq!(h.manager.stats().write_errors, 3);
}

#[test]
fn unrepresentable_cleanup_deadline_is_not_scheduled() {
    let mut config = config();
    config.time_wait_period(Duration::MAX).unwrap();
    let mut h = Harness::new(config);
    assert_eq!(h.alarm_deadline(), None);

    let id = cid(b"forever");
    h.add(id, TimeWaitAction::DoNothing, Vec::new());
    h.advance(Duration::from_secs(1_000_000));
    h.manager.clean_up_old_connection_ids();
    assert!(h.manager.is_connection_id_in_time_wait(&id));
    assert_eq!(h.alarm_deadline(), None);
}

#[test]
fn retry_queue_is_bounded() {
    let mut config = config();
    config.max_pending_bytes(10);
    let mut h = Harness::new(config);
    let id = cid(b"bounded");
    let packets = vec![Bytes::from_static(b"123456"), Bytes::from_static(b"abcdef")];
    h.add(id, TimeWaitAction::SendTerminationPackets, packets.clone());
    h.writer.set_blocked(true);
    h.process(id);

    let stats = h.manager.stats();
    assert_eq!(stats.packets_queued, 1);
    assert_eq!(stats.packets_dropped, 1);

    h.manager.on_blocked_writer_can_write();
    assert_eq!(h.written(), &packets[..1]);
}

#[test]
fn send_or_queue_reports_delivery() {
    let mut h = Harness::new(config());
    let packet = QueuedPacket::new(h.self_address, h.peer_address, Bytes::from_static(b"x"));
    assert!(h.manager.send_or_queue_packet(packet.clone(), None));
    h.writer.set_blocked(true);
    assert!(!h.manager.send_or_queue_packet(packet, None));
    assert!(h.manager.has_pending_packets());
}

#[test]
fn version_negotiation_leaves_list_alone() {
    let _guard = subscribe();
    let mut h = Harness::new(config());
    let id = cid(&hex!("0102030405060708"));
    h.manager.send_version_negotiation_packet(
        id,
        PacketFormat::Google,
        &[u32::from_be_bytes(*b"Q043")],
        h.self_address,
        h.peer_address,
        None,
    );
    let written = h.written();
    assert_eq!(written.len(), 1);
    assert_eq!(&written[0][..], hex!("09 0102030405060708 51303433"));
    assert_eq!(h.manager.num_connections(), 0);
    assert!(h.visitor.lock().unwrap().added.is_empty());
}

#[test]
fn context_is_opaque() {
    #[derive(Debug)]
    struct Context(u32);
    impl PerPacketContext for Context {}

    let mut h = Harness::new(config());
    let id = cid(b"context");
    h.add(id, TimeWaitAction::SendStatelessReset, Vec::new());
    let (local, peer) = (h.self_address, h.peer_address);
    h.manager.process_packet(local, peer, id, Some(&Context(42)));
    assert_eq!(h.written().len(), 1);
}

#[test]
fn drop_cancels_alarm() {
    let h = Harness::new(config());
    assert_matches!(h.alarm_deadline(), Some(_));
    let alarm = h.alarm.clone();
    drop(h);
    let state = alarm.lock().unwrap();
    assert_eq!(state.deadline, None);
    assert_eq!(state.cancels, 1);
}

#[test]
#[should_panic(expected = "termination packets required")]
fn termination_action_requires_packets() {
    let mut h = Harness::new(config());
    h.add(cid(b"empty"), TimeWaitAction::SendTerminationPackets, Vec::new());
}

#[test]
#[should_panic(expected = "only IETF QUIC")]
fn google_quic_cannot_do_nothing() {
    let mut h = Harness::new(config());
    h.manager.add_connection_id_to_time_wait(
        cid(b"legacy"),
        PacketFormat::Google,
        TimeWaitAction::DoNothing,
        Vec::new(),
    );
}

#[test]
#[cfg_attr(debug_assertions, should_panic(expected = "not in the time-wait list"))]
fn unknown_connection_id() {
    let mut h = Harness::new(config());
    h.process(cid(b"stranger"));
    assert!(h.written().is_empty());
    assert_eq!(h.manager.stats().packets_received, 0);
}
