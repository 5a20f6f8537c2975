#![allow(dead_code)]

use bytes::Bytes;
use sctp_output::transports::sctp::chunk::{DataView, RawChunk, SCTP_COMMON_HEADER_SIZE};
use sctp_output::{
    Association, AssociationParams, EngineConfig, NetId, OutgoingPacket, ReachState, RecordingSink,
};
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

pub const PEER_A: &str = "192.0.2.1:5000";
pub const PEER_B: &str = "198.51.100.1:5000";

pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

pub fn no_nagle() -> EngineConfig {
    EngineConfig {
        nagle: false,
        ..Default::default()
    }
}

pub fn association(config: EngineConfig, streams: u16) -> (Association, NetId) {
    association_with(AssociationParams::new(streams), config)
}

pub fn association_with(params: AssociationParams, config: EngineConfig) -> (Association, NetId) {
    let mut assoc = Association::new(params, config, std::time::Instant::now());
    let net = assoc.add_destination(addr(PEER_A), ReachState::Active);
    (assoc, net)
}

pub fn chunks(packet: &OutgoingPacket) -> Vec<RawChunk> {
    RawChunk::parse_all(packet.payload.slice(SCTP_COMMON_HEADER_SIZE..)).unwrap()
}

pub fn data_chunks(packet: &OutgoingPacket) -> Vec<DataView> {
    chunks(packet).iter().filter_map(|c| c.data()).collect()
}

pub fn all_data(sink: &RecordingSink) -> Vec<DataView> {
    sink.packets.iter().flat_map(data_chunks).collect()
}

pub fn pattern(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

/// Per-destination flight must match what the sent queue says is in flight.
pub fn assert_flight_conserved(assoc: &Association) {
    let per_dest: usize = assoc
        .destination_ids()
        .iter()
        .filter_map(|n| assoc.destination(*n))
        .map(|d| d.flight_size)
        .sum();
    assert_eq!(per_dest, assoc.sent_unacked_bytes());
    assert_eq!(assoc.total_flight(), assoc.sent_unacked_bytes());
}
