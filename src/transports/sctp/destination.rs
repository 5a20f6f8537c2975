use super::rto::RtoCalculator;
use crate::config::EngineConfig;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachState {
    Active,
    Unconfirmed,
    PartiallyFailed,
    Unreachable,
}

/// One transport address of the peer.
#[derive(Debug)]
pub struct Destination {
    pub addr: SocketAddr,
    pub mtu: usize,
    pub cwnd: usize,
    pub ssthresh: usize,
    /// Padded bytes of DATA sent here and not yet acknowledged.
    pub flight_size: usize,
    pub flight_count: usize,
    pub partial_bytes_acked: usize,
    pub rto: RtoCalculator,
    pub state: ReachState,
    pub error_count: u32,
    /// Last stream serviced for this destination.
    pub cursor: Option<u16>,
    pub cached_source: Option<IpAddr>,
    pub heartbeat_enabled: bool,
    pub last_heartbeat: Option<Instant>,
    pub heartbeat_nonce: Option<(u32, u32)>,
    pub t3_deadline: Option<Instant>,
    /// Transient send failures; throttles the burst size.
    pub backpressure: u32,
    /// The transport refused a packet here for lack of buffers.
    pub had_enobuf: bool,
    /// Fast retransmitted this pass; new data is held to one burst.
    pub fast_retran_ip: bool,
    /// Address is usable from our bound addresses (heartbeats skip it otherwise).
    pub in_scope: bool,
}

impl Destination {
    pub fn new(addr: SocketAddr, state: ReachState, ssthresh: usize, config: &EngineConfig) -> Self {
        let mtu = config.default_mtu;
        Self {
            addr,
            mtu,
            // RFC 4960 7.2.1
            cwnd: (4 * mtu).min((2 * mtu).max(4380)),
            ssthresh,
            flight_size: 0,
            flight_count: 0,
            partial_bytes_acked: 0,
            rto: RtoCalculator::new(config.rto_initial, config.rto_min, config.rto_max),
            state,
            error_count: 0,
            cursor: None,
            cached_source: None,
            heartbeat_enabled: true,
            last_heartbeat: None,
            heartbeat_nonce: None,
            t3_deadline: None,
            backpressure: 0,
            had_enobuf: false,
            fast_retran_ip: false,
            in_scope: true,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }

    pub fn reachable(&self) -> bool {
        self.state != ReachState::Unreachable
    }

    pub fn start_t3(&mut self, now: Instant) {
        if self.t3_deadline.is_none() {
            self.t3_deadline = Some(now + self.rto.rto());
        }
    }

    pub fn restart_t3(&mut self, now: Instant) {
        self.t3_deadline = Some(now + self.rto.rto());
    }
}
