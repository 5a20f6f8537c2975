mod common;

use bytes::Bytes;
use common::*;
use sctp_output::transports::sctp::chunk::{
    CT_ASCONF, CT_DATA, CT_ERROR, CT_SACK, ChunkState, DATA_FLAG_FIRST, DATA_FLAG_LAST,
    DATA_FLAG_NOT_FRAGMENTED,
};
use sctp_output::{
    AssociationParams, EngineConfig, ReachState, RecordingSink, SendOptions, SendReason,
    SendStatus,
};
use std::time::Instant;

#[test]
fn test_large_message_fragments_at_mtu_budget() {
    init();
    // 1248 byte MTU leaves 1200 bytes of DATA payload
    let config = EngineConfig {
        default_mtu: 1248,
        ..no_nagle()
    };
    let (mut assoc, net) = association(config, 4);
    assert_eq!(assoc.frag_point(), 1200);
    assoc.destination_mut(net).unwrap().cwnd = 100_000;

    let message = pattern(5000);
    let now = Instant::now();
    assoc
        .enqueue(3, message.clone(), &SendOptions::default(), now)
        .unwrap();

    let mut sink = RecordingSink::new();
    while assoc
        .output_round(SendReason::UserSend, &mut sink, false, now)
        .unwrap()
        > 0
    {}

    let data = all_data(&sink);
    let sizes: Vec<usize> = data.iter().map(|d| d.payload.len()).collect();
    assert_eq!(sizes, vec![1200, 1200, 1200, 1200, 200]);
    assert_eq!(data[0].flags & DATA_FLAG_NOT_FRAGMENTED, DATA_FLAG_FIRST);
    assert_eq!(data[4].flags & DATA_FLAG_NOT_FRAGMENTED, DATA_FLAG_LAST);
    assert_eq!(data.iter().filter(|d| d.flags & DATA_FLAG_FIRST != 0).count(), 1);
    assert_eq!(data.iter().filter(|d| d.flags & DATA_FLAG_LAST != 0).count(), 1);
    assert!(data.iter().all(|d| d.sid == 3 && d.ssn == data[0].ssn));

    let reassembled: Vec<u8> = data.iter().flat_map(|d| d.payload.iter().copied()).collect();
    assert_eq!(Bytes::from(reassembled), message);
    for packet in &sink.packets {
        assert!(sctp_output::transports::sctp::packet::verify_checksum(&packet.payload));
    }
}

#[test]
fn test_output_round_respects_each_congestion_window() {
    init();
    let (mut assoc, a) = association(no_nagle(), 1);
    let b = assoc.add_destination(addr(PEER_B), ReachState::Active);
    assoc.destination_mut(a).unwrap().cwnd = 3000;
    assoc.destination_mut(b).unwrap().cwnd = 1500;

    // 984 bytes of payload make a 1000 byte chunk
    let now = Instant::now();
    for _ in 0..10 {
        assoc
            .enqueue(0, pattern(984), &SendOptions::default(), now)
            .unwrap();
    }
    let mut sink = RecordingSink::new();
    assoc
        .output_round(SendReason::UserSend, &mut sink, false, now)
        .unwrap();

    let to_a: usize = sink.packets_to(addr(PEER_A)).map(|p| data_chunks(p).len()).sum();
    let to_b: usize = sink.packets_to(addr(PEER_B)).map(|p| data_chunks(p).len()).sum();
    assert_eq!((to_a, to_b), (3, 1));
    assert_eq!(assoc.destination(a).unwrap().flight_size, 3000);
    assert_eq!(assoc.destination(b).unwrap().flight_size, 1000);
    assert_eq!(assoc.buffered_amount(), 10 * 984);
    assert_flight_conserved(&assoc);
}

#[test]
fn test_unreachable_destination_migrates_unsent_chunks() {
    init();
    let (mut assoc, a) = association(no_nagle(), 2);
    let b = assoc.add_destination(addr(PEER_B), ReachState::Active);

    let now = Instant::now();
    for _ in 0..4 {
        assoc
            .enqueue(1, pattern(500), &SendOptions::default(), now)
            .unwrap();
    }
    let mut sink = RecordingSink::new();
    sink.fail_dest(addr(PEER_A), SendStatus::HostUnreachable);
    // keep B from draining the migrated chunks so they stay observable
    sink.fail_dest(addr(PEER_B), SendStatus::Backpressure);
    let sent = assoc
        .output_round(SendReason::UserSend, &mut sink, false, now)
        .unwrap();

    assert_eq!(sent, 0);
    assert_eq!(assoc.send_queue().len(), 4);
    assert!(assoc.send_queue().iter().all(|c| c.dest == b));
    assert_eq!(assoc.destination(a).unwrap().flight_size, 0);
    assert_eq!(assoc.destination(b).unwrap().backpressure, 1);
    assert_eq!(assoc.stats().unreachable_sends, 1);

    // once B takes packets again the migrated chunks go there
    sink.per_dest.clear();
    assoc
        .output_round(SendReason::UserSend, &mut sink, false, now)
        .unwrap();
    assert_eq!(sink.packets_to(addr(PEER_B)).flat_map(data_chunks).count(), 4);
    assert!(assoc.send_queue().is_empty());
    assert_flight_conserved(&assoc);
}

#[test]
fn test_streams_share_the_window_round_robin() {
    init();
    let (mut assoc, net) = association(no_nagle(), 3);
    // room for exactly seven 116 byte chunks
    assoc.destination_mut(net).unwrap().cwnd = 7 * 116;

    let now = Instant::now();
    for sid in 0..3 {
        for _ in 0..4 {
            assoc
                .enqueue(sid, pattern(100), &SendOptions::default(), now)
                .unwrap();
        }
    }
    let mut sink = RecordingSink::new();
    assoc
        .output_round(SendReason::UserSend, &mut sink, false, now)
        .unwrap();

    let sids: Vec<u16> = all_data(&sink).iter().map(|d| d.sid).collect();
    assert_eq!(sids, vec![0, 1, 2, 0, 1, 2, 0]);
    for sid in 0..3 {
        let n = sids.iter().filter(|s| **s == sid).count();
        assert!(n == 2 || n == 3, "stream {} got {} chunks", sid, n);
    }
}

#[test]
fn test_sack_reports_one_block_per_run() {
    init();
    let (mut assoc, net) = association(no_nagle(), 1);
    // cum ack 2, then runs 4, 6-20 (spanning several bitmap bytes) and 23
    for tsn in [1, 2, 4, 23].into_iter().chain(6..=20) {
        assoc.note_received(tsn, net, false);
    }
    assoc.note_received(4, net, false);

    let mut sink = RecordingSink::new();
    assoc
        .chunk_output(SendReason::Control, &mut sink, Instant::now())
        .unwrap();

    let sack = sink
        .packets
        .iter()
        .flat_map(chunks)
        .find(|c| c.kind == CT_SACK)
        .expect("SACK sent");
    let body = &sack.body;
    let cum = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    let gaps = u16::from_be_bytes([body[8], body[9]]);
    let dups = u16::from_be_bytes([body[10], body[11]]);
    assert_eq!(cum, 2);
    assert_eq!(gaps, 3);
    assert_eq!(dups, 1);
    let blocks: Vec<(u16, u16)> = (0..gaps as usize)
        .map(|i| {
            let at = 12 + 4 * i;
            (
                u16::from_be_bytes([body[at], body[at + 1]]),
                u16::from_be_bytes([body[at + 2], body[at + 3]]),
            )
        })
        .collect();
    assert_eq!(blocks, vec![(2, 2), (4, 18), (21, 21)]);
    // SACKs are not kept around once sent
    assert!(assoc.control_queue().is_empty());
}

#[test]
fn test_input_errors_leave_state_untouched() {
    let (mut assoc, _) = association(no_nagle(), 2);
    let now = Instant::now();
    let too_big = SendOptions {
        no_fragment: true,
        ..Default::default()
    };
    let limit = assoc.frag_point();
    assert!(assoc.enqueue(0, pattern(limit + 1), &too_big, now).is_err());
    assert!(assoc.enqueue(7, pattern(10), &SendOptions::default(), now).is_err());
    assert_eq!(assoc.buffered_amount(), 0);

    assoc.enqueue(0, pattern(10), &SendOptions::default(), now).unwrap();
    assoc.shutdown().unwrap();
    assert!(assoc.enqueue(0, pattern(10), &SendOptions::default(), now).is_err());
    assert_eq!(assoc.buffered_amount(), 10);
}

#[test]
fn test_zero_window_sends_one_probe_then_recovers_it() {
    init();
    let mut params = AssociationParams::new(1);
    params.peer_rwnd = 0;
    let (mut assoc, net) = association_with(params, no_nagle());
    let now = Instant::now();
    for _ in 0..3 {
        assoc
            .enqueue(0, pattern(100), &SendOptions::default(), now)
            .unwrap();
    }
    let mut sink = RecordingSink::new();
    assoc
        .chunk_output(SendReason::UserSend, &mut sink, now)
        .unwrap();

    let tsns: Vec<u32> = all_data(&sink).iter().map(|d| d.tsn).collect();
    assert_eq!(tsns, vec![1]);
    assert!(assoc.sent_queue()[0].window_probe);
    assert_eq!(assoc.stats().window_probes, 1);
    assert_eq!(assoc.send_queue().len(), 2);
    sink.clear();

    // the window opens while the probe is still unacknowledged
    assoc.mark_acked(0, &[], 64 * 1024, now);
    let probe = &assoc.sent_queue()[0];
    assert_eq!(probe.state, ChunkState::Resend);
    assert!(!probe.window_probe);
    assert_eq!(assoc.total_flight(), 0);
    assert_eq!(assoc.retransmit_pending(), 1);
    assert!(assoc.destination(net).unwrap().t3_deadline.is_none());
    assert_flight_conserved(&assoc);

    assoc
        .chunk_output(SendReason::SackReceived, &mut sink, now)
        .unwrap();
    let tsns: Vec<u32> = all_data(&sink).iter().map(|d| d.tsn).collect();
    assert_eq!(tsns, vec![1, 2, 3]);
    assert_eq!(assoc.sent_queue()[0].snd_count, 2);
    assert_flight_conserved(&assoc);
}

#[test]
fn test_nagle_holds_small_chunk_while_data_in_flight() {
    init();
    let (mut assoc, _) = association(EngineConfig::default(), 1);
    let now = Instant::now();
    let mut sink = RecordingSink::new();
    assoc
        .enqueue(0, pattern(100), &SendOptions::default(), now)
        .unwrap();
    assoc
        .chunk_output(SendReason::UserSend, &mut sink, now)
        .unwrap();
    assert_eq!(sink.packets.len(), 1);

    assoc
        .enqueue(0, pattern(100), &SendOptions::default(), now)
        .unwrap();
    assoc
        .chunk_output(SendReason::UserSend, &mut sink, now)
        .unwrap();
    assert_eq!(sink.packets.len(), 1);
    assert_eq!(assoc.buffered_amount(), 200);

    // a full packet's worth goes; the 48 byte tail fragment waits again
    assoc
        .enqueue(0, pattern(1500), &SendOptions::default(), now)
        .unwrap();
    assoc
        .chunk_output(SendReason::UserSend, &mut sink, now)
        .unwrap();
    let tsns: Vec<u32> = all_data(&sink).iter().map(|d| d.tsn).collect();
    assert_eq!(tsns, vec![1, 2, 3]);
    assert_eq!(assoc.send_queue().len(), 1);
    assert_eq!(assoc.send_queue()[0].payload.len(), 48);
}

#[test]
fn test_enobufs_leaves_chunks_queued() {
    init();
    let (mut assoc, net) = association(no_nagle(), 1);
    assoc.destination_mut(net).unwrap().cwnd = 100_000;
    let now = Instant::now();
    // 1000 byte payloads travel one per packet
    for _ in 0..4 {
        assoc
            .enqueue(0, pattern(1000), &SendOptions::default(), now)
            .unwrap();
    }
    let mut sink = RecordingSink::new();
    assoc
        .chunk_output(SendReason::UserSend, &mut sink, now)
        .unwrap();
    assert_eq!(sink.packets.len(), 4);
    let flight = assoc.total_flight();
    assert_eq!(flight, 4 * 1016);

    assoc
        .enqueue(0, pattern(1000), &SendOptions::default(), now)
        .unwrap();
    sink.next.push_back(SendStatus::NoMemory);
    assoc
        .chunk_output(SendReason::UserSend, &mut sink, now)
        .unwrap();
    assert_eq!(sink.packets.len(), 4);
    assert_eq!(sink.refused, 1);
    assert_eq!(assoc.stats().enobufs, 1);
    assert_eq!(assoc.send_queue().len(), 1);
    assert_eq!(assoc.send_queue()[0].state, ChunkState::Unsent);
    assert_eq!(assoc.send_queue()[0].tsn, 5);
    assert_eq!(assoc.total_flight(), flight);
    assert!(assoc.destination(net).unwrap().had_enobuf);

    // plenty in flight: the next user send only queues
    assoc
        .chunk_output(SendReason::UserSend, &mut sink, now)
        .unwrap();
    assert_eq!(sink.packets.len(), 4);
    assert!(!assoc.destination(net).unwrap().had_enobuf);

    assoc
        .chunk_output(SendReason::UserSend, &mut sink, now)
        .unwrap();
    let tsns: Vec<u32> = all_data(&sink).iter().map(|d| d.tsn).collect();
    assert_eq!(tsns, vec![1, 2, 3, 4, 5]);
    assert!(assoc.send_queue().is_empty());
    assert_flight_conserved(&assoc);
}

#[test]
fn test_asconf_leads_the_control_section() {
    init();
    let (mut assoc, _) = association(no_nagle(), 1);
    let now = Instant::now();
    assoc.send_operation_error(Bytes::from_static(&[0, 1, 0, 4]));
    assoc.send_asconf(7, Bytes::from_static(&[0xC0, 0x04, 0, 8, 0, 0, 0, 1]));
    assoc
        .enqueue(0, pattern(100), &SendOptions::default(), now)
        .unwrap();

    let mut sink = RecordingSink::new();
    assoc
        .chunk_output(SendReason::UserSend, &mut sink, now)
        .unwrap();
    assert_eq!(sink.packets.len(), 1);
    assert!(sink.packets[0].opts.asconf);
    let kinds: Vec<u8> = chunks(&sink.packets[0]).iter().map(|c| c.kind).collect();
    assert_eq!(kinds, vec![CT_ASCONF, CT_ERROR, CT_DATA]);
}
