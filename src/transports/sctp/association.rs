use super::arena::Arena;
use super::chunk::{
    AbandonRule, CHUNK_HEADER_SIZE, CT_ECN_ECHO, CT_FORWARD_TSN, ChunkState, ControlChunk, DATA_CHUNK_HEADER_SIZE,
    DataChunk, IPV4_HEADER_SIZE, IPV6_HEADER_SIZE, NetId, SCTP_COMMON_HEADER_SIZE, padded, tsn_gt,
    tsn_lt, tsn_lte,
};
use super::destination::{Destination, ReachState};
use super::packet::PacketSink;
use super::sack::ReceiveMap;
use super::stream::{AppendMode, PrPolicy, SendOptions, SendQueues};
use crate::config::EngineConfig;
use crate::error::{SctpError, SctpResult};
use crate::transports::source::SourceSelector;
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const DUP_THRESH: u8 = 3;

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssocState {
    Established,
    ShutdownPending,
    ShutdownSent,
    ShutdownReceived,
    ShutdownAckSent,
    Aborted,
}

/// Negotiated AUTH parameters. The HMAC itself is filled in below us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthParams {
    pub key_id: u16,
    pub hmac_id: u16,
    pub hmac_len: usize,
    /// Chunk types the peer wants authenticated.
    pub chunks: Vec<u8>,
}

impl AuthParams {
    pub fn requires(&self, kind: u8) -> bool {
        self.chunks.contains(&kind)
    }

    pub fn chunk_len(&self) -> usize {
        padded(CHUNK_HEADER_SIZE + 4 + self.hmac_len)
    }
}

/// Extensions the peer agreed to during setup.
#[derive(Debug, Clone, Default)]
pub struct PeerCapabilities {
    pub prsctp: bool,
    pub nr_sack: bool,
    pub ecn: bool,
    pub packet_drop: bool,
    pub reconfig: bool,
    pub auth: Option<AuthParams>,
}

/// What handshake completion hands to the engine.
#[derive(Debug, Clone)]
pub struct AssociationParams {
    pub local_port: u16,
    pub peer_port: u16,
    pub peer_vtag: u32,
    pub initial_tsn: u32,
    pub peer_initial_tsn: u32,
    pub outbound_streams: u16,
    pub peer_rwnd: u32,
    pub capabilities: PeerCapabilities,
    pub sources: Option<SourceSelector>,
}

impl AssociationParams {
    pub fn new(outbound_streams: u16) -> Self {
        Self {
            local_port: 5000,
            peer_port: 5000,
            peer_vtag: 0,
            initial_tsn: 1,
            peer_initial_tsn: 1,
            outbound_streams,
            peer_rwnd: 1024 * 1024,
            capabilities: PeerCapabilities::default(),
            sources: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Stats {
    pub created: Instant,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub data_chunks_sent: u64,
    pub control_chunks_sent: u64,
    pub retransmissions: u64,
    pub fast_retransmits: u64,
    pub t3_timeouts: u64,
    pub window_probes: u64,
    pub abandoned: u64,
    pub enobufs: u64,
    pub unreachable_sends: u64,
    pub heartbeats_sent: u64,
}

impl Stats {
    fn new(now: Instant) -> Self {
        Self {
            created: now,
            packets_sent: 0,
            bytes_sent: 0,
            data_chunks_sent: 0,
            control_chunks_sent: 0,
            retransmissions: 0,
            fast_retransmits: 0,
            t3_timeouts: 0,
            window_probes: 0,
            abandoned: 0,
            enobufs: 0,
            unreachable_sends: 0,
            heartbeats_sent: 0,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ResetState {
    pub out_seq: u32,
    /// Sequence number of our request awaiting a response.
    pub outstanding: Option<u32>,
    /// Streams named in the outstanding outgoing reset.
    pub outgoing: Vec<u16>,
    /// Last request sequence received from the peer.
    pub peer_seq: u32,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AckOutcome {
    pub bytes_retired: usize,
    pub fast_retransmits: usize,
    pub cum_advanced: bool,
}

/// Per-peer transmission state. Every method expects to run inside the
/// association-wide exclusive section; the stream queues additionally sit
/// behind their own lock so application writers can make progress while the
/// association lock is held elsewhere.
pub struct Association {
    pub(crate) config: EngineConfig,
    pub(crate) state: AssocState,
    pub(crate) local_port: u16,
    pub(crate) peer_port: u16,
    pub(crate) peer_vtag: u32,
    pub(crate) caps: PeerCapabilities,
    pub(crate) destinations: Arena<Destination>,
    pub(crate) dest_order: Vec<NetId>,
    pub(crate) primary: Option<NetId>,
    pub(crate) queues: Arc<Mutex<SendQueues>>,
    /// DATA with a TSN, not yet sent. TSN ordered.
    pub(crate) send_queue: VecDeque<DataChunk>,
    /// DATA sent and not cumulatively acked. TSN ordered.
    pub(crate) sent_queue: VecDeque<DataChunk>,
    pub(crate) control_queue: VecDeque<ControlChunk>,
    pub(crate) asconf_queue: VecDeque<ControlChunk>,
    pub(crate) sending_seq: u32,
    pub(crate) last_acked_seq: u32,
    pub(crate) advanced_peer_ack_point: u32,
    pub(crate) peers_rwnd: u32,
    pub(crate) total_flight: usize,
    pub(crate) total_flight_count: usize,
    /// Chunks currently marked for resend.
    pub(crate) retran_count: usize,
    pub(crate) fast_recovery_exit: Option<u32>,
    pub(crate) recv: ReceiveMap,
    pub(crate) sack_pending: bool,
    pub(crate) reset: ResetState,
    pub(crate) used_alt_onsack: usize,
    pub(crate) used_alt_asconfack: usize,
    pub(crate) last_control_chunk_from: Option<NetId>,
    pub(crate) sources: Option<SourceSelector>,
    pub(crate) epoch: Instant,
    pub(crate) stats: Stats,
}

impl Association {
    pub fn new(params: AssociationParams, config: EngineConfig, now: Instant) -> Self {
        let last_acked = params.initial_tsn.wrapping_sub(1);
        Self {
            recv: ReceiveMap::new(params.peer_initial_tsn, config.receive_buffer),
            config,
            state: AssocState::Established,
            local_port: params.local_port,
            peer_port: params.peer_port,
            peer_vtag: params.peer_vtag,
            caps: params.capabilities,
            destinations: Arena::new(),
            dest_order: Vec::new(),
            primary: None,
            queues: Arc::new(Mutex::new(SendQueues::new(params.outbound_streams))),
            send_queue: VecDeque::new(),
            sent_queue: VecDeque::new(),
            control_queue: VecDeque::new(),
            asconf_queue: VecDeque::new(),
            sending_seq: params.initial_tsn,
            last_acked_seq: last_acked,
            advanced_peer_ack_point: last_acked,
            peers_rwnd: params.peer_rwnd,
            total_flight: 0,
            total_flight_count: 0,
            retran_count: 0,
            fast_recovery_exit: None,
            sack_pending: false,
            reset: ResetState::default(),
            used_alt_onsack: 0,
            used_alt_asconfack: 0,
            last_control_chunk_from: None,
            sources: params.sources,
            epoch: now,
            stats: Stats::new(now),
        }
    }

    pub fn add_destination(&mut self, addr: SocketAddr, state: ReachState) -> NetId {
        let dest = Destination::new(addr, state, self.peers_rwnd as usize, &self.config);
        let net = self.destinations.insert(dest);
        self.dest_order.push(net);
        if self.primary.is_none() {
            self.primary = Some(net);
        }
        net
    }

    pub fn set_primary(&mut self, net: NetId) -> SctpResult<()> {
        if !self.destinations.is_live(net) {
            return Err(SctpError::UnknownDestination);
        }
        self.primary = Some(net);
        Ok(())
    }

    /// Removes a peer address. Everything queued or in flight to it moves to
    /// an alternate first.
    pub fn remove_destination(&mut self, net: NetId) -> SctpResult<()> {
        if !self.destinations.is_live(net) {
            return Err(SctpError::UnknownDestination);
        }
        if let Some(alt) = self.find_alternate(net) {
            self.move_to_alternate(net, alt);
            let in_flight: Vec<usize> = (0..self.sent_queue.len())
                .filter(|&i| self.sent_queue[i].dest == net)
                .collect();
            for i in in_flight {
                let (book, flying) = {
                    let c = &self.sent_queue[i];
                    (c.book_size, c.in_flight())
                };
                if flying {
                    self.flight_sub(net, book);
                    self.flight_add(alt, book);
                }
                self.sent_queue[i].dest = alt;
                self.destinations.acquire(alt);
                self.release_dest(net);
            }
        }
        self.dest_order.retain(|n| *n != net);
        if self.primary == Some(net) {
            self.primary = self.dest_order.first().copied();
        }
        if self.destinations.remove(net).is_none() {
            debug!(
                "destination {:?} retired with {} references",
                net,
                self.destinations.refs(net)
            );
        }
        Ok(())
    }

    pub fn state(&self) -> AssocState {
        self.state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn capabilities_mut(&mut self) -> &mut PeerCapabilities {
        &mut self.caps
    }

    pub fn primary(&self) -> Option<NetId> {
        self.primary
    }

    pub fn destination(&self, net: NetId) -> Option<&Destination> {
        self.destinations.get(net)
    }

    pub fn destination_mut(&mut self, net: NetId) -> Option<&mut Destination> {
        self.destinations.get_mut(net)
    }

    pub fn destination_ids(&self) -> &[NetId] {
        &self.dest_order
    }

    pub fn send_queue(&self) -> &VecDeque<DataChunk> {
        &self.send_queue
    }

    pub fn sent_queue(&self) -> &VecDeque<DataChunk> {
        &self.sent_queue
    }

    pub fn control_queue(&self) -> &VecDeque<ControlChunk> {
        &self.control_queue
    }

    pub fn asconf_queue(&self) -> &VecDeque<ControlChunk> {
        &self.asconf_queue
    }

    pub fn queues(&self) -> Arc<Mutex<SendQueues>> {
        Arc::clone(&self.queues)
    }

    pub fn total_flight(&self) -> usize {
        self.total_flight
    }

    pub fn peers_rwnd(&self) -> u32 {
        self.peers_rwnd
    }

    pub fn set_peers_rwnd(&mut self, rwnd: u32) {
        self.peers_rwnd = rwnd;
    }

    pub fn next_tsn(&self) -> u32 {
        self.sending_seq
    }

    pub fn last_acked(&self) -> u32 {
        self.last_acked_seq
    }

    pub fn advanced_peer_ack_point(&self) -> u32 {
        self.advanced_peer_ack_point
    }

    pub fn retransmit_pending(&self) -> usize {
        self.retran_count
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn receive_map(&self) -> &ReceiveMap {
        &self.recv
    }

    pub fn receive_map_mut(&mut self) -> &mut ReceiveMap {
        &mut self.recv
    }

    pub fn buffered_amount(&self) -> usize {
        lock(&self.queues).total_output_queue_size
    }

    /// Earliest retransmission deadline over all destinations.
    pub fn next_timeout(&self) -> Option<(NetId, Instant)> {
        self.dest_order
            .iter()
            .filter_map(|n| {
                self.destinations
                    .get(*n)
                    .and_then(|d| d.t3_deadline)
                    .map(|t| (*n, t))
            })
            .min_by_key(|(_, t)| *t)
    }

    pub(crate) fn abandon_rule(&self, policy: PrPolicy, now: Instant) -> AbandonRule {
        if !self.caps.prsctp {
            return AbandonRule::Never;
        }
        match policy {
            PrPolicy::Reliable => AbandonRule::Never,
            PrPolicy::Ttl(ttl) => AbandonRule::Deadline(now + ttl),
            PrPolicy::Rtx(limit) => AbandonRule::Retransmits(limit),
            PrPolicy::Buf(priority) => AbandonRule::Priority(priority),
        }
    }

    /// Queues an application message on stream `sid`.
    pub fn enqueue(
        &mut self,
        sid: u16,
        data: Bytes,
        opts: &SendOptions,
        now: Instant,
    ) -> SctpResult<()> {
        let complete = !self.config.explicit_eor || opts.eor;
        self.append(sid, data, opts, AppendMode::whole(complete), now)
            .map(|_| ())
    }

    /// Caller-input checks shared by every send path. Mutates nothing.
    pub fn check_send(&self, sid: u16, len: usize, opts: &SendOptions) -> SctpResult<()> {
        match self.state {
            AssocState::Established => {}
            AssocState::Aborted => return Err(SctpError::Aborted),
            _ => return Err(SctpError::ShuttingDown),
        }
        if let Some(dest) = opts.destination {
            if !self.destinations.is_live(dest) {
                return Err(SctpError::UnknownDestination);
            }
        }
        let limit = self.frag_point();
        if opts.no_fragment && len > limit {
            return Err(SctpError::MessageTooLarge { len, limit });
        }
        lock(&self.queues).check_stream(sid)
    }

    /// Appends one piece of a send to stream `sid`. Returns the message the
    /// bytes went to and whether this piece created it, or `None` when there
    /// was nothing to queue.
    pub(crate) fn append(
        &mut self,
        sid: u16,
        data: Bytes,
        opts: &SendOptions,
        mode: AppendMode,
        now: Instant,
    ) -> SctpResult<Option<(u64, bool)>> {
        self.check_send(sid, data.len(), opts)?;
        let abandon = self.abandon_rule(opts.pr_policy, now);
        let queues = Arc::clone(&self.queues);
        let mut q = lock(&queues);
        q.check_stream(sid)?;
        let continues = q.streams[sid as usize]
            .queue
            .back()
            .is_some_and(|m| !m.complete);
        if data.is_empty() && !continues && mode.continues.is_none() {
            return Ok(None);
        }
        let (msg_id, created) = q.append(sid, data, opts, mode, abandon, now)?;
        if created {
            if let Some(dest) = opts.destination {
                self.destinations.acquire(dest);
            }
        }
        trace!(
            "queued message {} on stream {} ({} bytes pending)",
            msg_id, sid, q.pending_bytes
        );
        Ok(Some((msg_id, created)))
    }

    /// Graceful close: SHUTDOWN goes out once everything queued is acked.
    pub fn shutdown(&mut self) -> SctpResult<()> {
        match self.state {
            AssocState::Established => {}
            AssocState::Aborted => return Err(SctpError::Aborted),
            _ => return Ok(()),
        }
        if self.nothing_outstanding() {
            self.send_shutdown();
            self.state = AssocState::ShutdownSent;
        } else {
            self.state = AssocState::ShutdownPending;
        }
        debug!("association shutdown requested, state {:?}", self.state);
        Ok(())
    }

    pub(crate) fn nothing_outstanding(&self) -> bool {
        self.send_queue.is_empty()
            && self.sent_queue.is_empty()
            && lock(&self.queues).wheel.is_empty()
    }

    /// Processes the peer's acknowledgment of `cum_tsn` plus gap blocks.
    pub fn mark_acked(
        &mut self,
        cum_tsn: u32,
        gaps: &[(u16, u16)],
        a_rwnd: u32,
        now: Instant,
    ) -> AckOutcome {
        if self.state == AssocState::Aborted {
            return AckOutcome::default();
        }
        if tsn_lt(cum_tsn, self.last_acked_seq) {
            trace!(
                "ignoring stale SACK cum={} (last acked {})",
                cum_tsn, self.last_acked_seq
            );
            return AckOutcome::default();
        }
        let cum_advanced = tsn_gt(cum_tsn, self.last_acked_seq);
        let old_rwnd = self.peers_rwnd;
        let outcome = apply_sack_to_sent_queue(&mut self.sent_queue, cum_tsn, gaps, now);

        let mut retired = 0;
        for chunk in &outcome.acked {
            if chunk.state != ChunkState::Abandoned {
                retired += chunk.payload.len();
            }
            self.release_dest(chunk.dest);
        }
        for &(net, bytes) in &outcome.flight_reduction {
            self.flight_sub(net, bytes);
        }
        self.retran_count =
            self.retran_count.saturating_sub(outcome.resend_cleared) + outcome.fast_retransmit.len();

        let mut sampled: Vec<NetId> = Vec::new();
        for &(net, rtt) in &outcome.rtt_samples {
            if sampled.contains(&net) {
                continue;
            }
            sampled.push(net);
            if let Some(d) = self.destinations.get_mut(net) {
                d.rto.update(rtt);
            }
        }

        let in_recovery = self
            .fast_recovery_exit
            .is_some_and(|exit| tsn_lt(cum_tsn, exit));
        if !in_recovery {
            self.fast_recovery_exit = None;
        }

        let mut acked_per_net: Vec<(NetId, usize)> = Vec::new();
        for &(net, bytes) in &outcome.newly_acked {
            match acked_per_net.iter_mut().find(|(n, _)| *n == net) {
                Some(entry) => entry.1 += bytes,
                None => acked_per_net.push((net, bytes)),
            }
        }
        for &(net, bytes) in &acked_per_net {
            let Some(d) = self.destinations.get_mut(net) else {
                continue;
            };
            d.error_count = 0;
            if d.state == ReachState::PartiallyFailed {
                debug!("destination {:?} answered, back to active", net);
                d.state = ReachState::Active;
            }
            if cum_advanced && !in_recovery {
                if d.cwnd <= d.ssthresh {
                    d.cwnd += bytes.min(d.mtu);
                } else {
                    d.partial_bytes_acked += bytes;
                    if d.partial_bytes_acked >= d.cwnd {
                        d.partial_bytes_acked -= d.cwnd;
                        d.cwnd += d.mtu;
                    }
                }
            }
        }

        if !outcome.fast_retransmit.is_empty() && !in_recovery {
            let mut nets: Vec<NetId> = outcome.fast_retransmit.iter().map(|(n, _)| *n).collect();
            nets.dedup();
            for net in nets {
                if let Some(d) = self.destinations.get_mut(net) {
                    d.ssthresh = (d.cwnd / 2).max(4 * d.mtu);
                    d.cwnd = d.ssthresh;
                    d.partial_bytes_acked = 0;
                }
            }
            self.fast_recovery_exit = self.sent_queue.back().map(|c| c.tsn);
            debug!(
                "fast retransmit of {} chunks, recovery until TSN {:?}",
                outcome.fast_retransmit.len(),
                self.fast_recovery_exit
            );
        }

        if cum_advanced {
            self.last_acked_seq = cum_tsn;
            if tsn_lt(self.advanced_peer_ack_point, cum_tsn) {
                self.advanced_peer_ack_point = cum_tsn;
            }
            if tsn_lte(self.advanced_peer_ack_point, cum_tsn) {
                self.drop_control(|c| c.kind == CT_FORWARD_TSN);
            }
        }

        let outstanding = self.total_flight
            + self.total_flight_count * self.config.peer_chunk_overhead as usize;
        self.peers_rwnd = self.sws(a_rwnd.saturating_sub(outstanding.min(u32::MAX as usize) as u32));
        if self.peers_rwnd > old_rwnd {
            self.recover_window_probes();
        }

        for net in self.dest_order.clone() {
            let acked_here = acked_per_net.iter().any(|(n, _)| *n == net);
            if let Some(d) = self.destinations.get_mut(net) {
                if d.flight_size == 0 {
                    d.t3_deadline = None;
                } else if cum_advanced && acked_here {
                    d.restart_t3(now);
                }
            }
        }

        if retired > 0 {
            lock(&self.queues).retire(retired);
        }

        if self.caps.prsctp && self.advance_peer_ack_point() {
            self.send_forward_tsn();
        }

        if self.state == AssocState::ShutdownPending && self.nothing_outstanding() {
            self.send_shutdown();
            self.state = AssocState::ShutdownSent;
        }

        self.check_invariants();
        AckOutcome {
            bytes_retired: retired,
            fast_retransmits: outcome.fast_retransmit.len(),
            cum_advanced,
        }
    }

    pub fn mark_destination_state(&mut self, net: NetId, state: ReachState) {
        let Some(d) = self.destinations.get_mut(net) else {
            return;
        };
        if d.state == state {
            return;
        }
        let old = d.state;
        d.state = state;
        d.cached_source = None;
        if state == ReachState::Active {
            d.error_count = 0;
        }
        debug!("destination {:?} ({}) {:?} -> {:?}", net, d.addr, old, state);
    }

    pub fn note_duplicate(&mut self, tsn: u32) {
        self.recv.note_duplicate(tsn);
        self.sack_pending = true;
    }

    /// Receive path hook: DATA with `tsn` arrived from `from`.
    pub fn note_received(&mut self, tsn: u32, from: NetId, non_renegable: bool) -> bool {
        self.sack_pending = true;
        self.recv.note_received(tsn, from, non_renegable)
    }

    /// Retransmission timer of `net` fired.
    pub fn t3_expired(&mut self, net: NetId, now: Instant) {
        if self.state == AssocState::Aborted {
            return;
        }
        let Some(d) = self.destinations.get_mut(net) else {
            return;
        };
        d.rto.backoff();
        d.error_count += 1;
        d.ssthresh = (d.cwnd / 2).max(4 * d.mtu);
        d.cwnd = d.mtu;
        d.partial_bytes_acked = 0;
        d.t3_deadline = None;
        d.fast_retran_ip = false;
        let errors = d.error_count;
        let rto = d.rto.rto();
        self.stats.t3_timeouts += 1;

        let mut reductions = Vec::new();
        for chunk in self.sent_queue.iter_mut() {
            if chunk.dest == net && chunk.in_flight() {
                chunk.state = ChunkState::Resend;
                chunk.fast_retransmit = false;
                chunk.missing_reports = 0;
                reductions.push(chunk.book_size);
            }
        }
        for book in &reductions {
            self.flight_sub(net, *book);
        }
        self.retran_count += reductions.len();
        if self.caps.prsctp {
            self.abandon_expired_resends(now);
        }

        for chunk in self
            .control_queue
            .iter_mut()
            .chain(self.asconf_queue.iter_mut())
        {
            if chunk.dest == net
                && chunk.state == ChunkState::Sent
                && chunk.is_timed()
                && chunk.kind != CT_ECN_ECHO
            {
                chunk.state = ChunkState::Resend;
            }
        }

        debug!(
            "T3 expired on {:?}: {} chunks marked for resend, RTO {:?}, errors {}",
            net,
            reductions.len(),
            rto,
            errors
        );

        if errors > self.config.path_max_retransmits {
            self.mark_destination_state(net, ReachState::Unreachable);
        }
        if let Some(alt) = self.find_alternate(net) {
            self.rehome_resend(net, alt);
        }
        self.check_invariants();
    }

    /// Tears the association down after sending ABORT best effort.
    pub fn abort(&mut self, sink: &mut dyn PacketSink, cause: Option<Bytes>) {
        if self.state == AssocState::Aborted {
            return;
        }
        let status = self.send_abort(sink, cause);
        debug!("ABORT sent: {:?}", status);
        self.teardown("abort");
    }

    pub(crate) fn teardown(&mut self, reason: &str) {
        self.state = AssocState::Aborted;
        let chunks: Vec<NetId> = self
            .send_queue
            .drain(..)
            .chain(self.sent_queue.drain(..))
            .map(|c| c.dest)
            .collect();
        for net in chunks {
            self.release_dest(net);
        }
        let controls: Vec<NetId> = self
            .control_queue
            .drain(..)
            .chain(self.asconf_queue.drain(..))
            .map(|c| c.dest)
            .collect();
        for net in controls {
            self.release_dest(net);
        }
        let dropped = {
            let mut q = lock(&self.queues);
            let dropped = q.clear();
            q.total_output_queue_size = 0;
            dropped
        };
        for msg in dropped {
            if let Some(net) = msg.dest {
                self.release_dest(net);
            }
        }
        for net in self.dest_order.clone() {
            if let Some(d) = self.destinations.get_mut(net) {
                d.flight_size = 0;
                d.flight_count = 0;
                d.t3_deadline = None;
            }
        }
        self.total_flight = 0;
        self.total_flight_count = 0;
        self.retran_count = 0;
        self.print_stats(reason);
    }

    pub(crate) fn release_dest(&mut self, net: NetId) {
        if self.destinations.release(net).is_some() {
            debug!("destination {:?} freed", net);
        }
    }

    pub(crate) fn push_control(&mut self, chunk: ControlChunk) {
        self.destinations.acquire(chunk.dest);
        self.control_queue.push_back(chunk);
    }

    pub(crate) fn push_control_front(&mut self, chunk: ControlChunk) {
        self.destinations.acquire(chunk.dest);
        self.control_queue.push_front(chunk);
    }

    pub(crate) fn drop_control<F: Fn(&ControlChunk) -> bool>(&mut self, pred: F) -> usize {
        let mut dropped = Vec::new();
        self.control_queue.retain(|c| {
            if pred(c) {
                dropped.push(c.dest);
                false
            } else {
                true
            }
        });
        let n = dropped.len();
        for net in dropped {
            self.release_dest(net);
        }
        n
    }

    /// Inserts into the sent queue keeping TSN order.
    pub(crate) fn insert_sent(&mut self, chunk: DataChunk) {
        let mut at = self.sent_queue.len();
        while at > 0 && tsn_lt(chunk.tsn, self.sent_queue[at - 1].tsn) {
            at -= 1;
        }
        self.sent_queue.insert(at, chunk);
    }

    pub(crate) fn flight_add(&mut self, net: NetId, book: usize) {
        if let Some(d) = self.destinations.get_mut(net) {
            d.flight_size += book;
            d.flight_count += 1;
        }
        self.total_flight += book;
        self.total_flight_count += 1;
    }

    /// The window reopened: a probe still in flight is resent right away
    /// instead of waiting for T3.
    fn recover_window_probes(&mut self) {
        let mut recovered = Vec::new();
        for c in self.sent_queue.iter_mut().filter(|c| c.window_probe) {
            c.window_probe = false;
            if c.in_flight() {
                c.state = ChunkState::Resend;
                recovered.push((c.dest, c.book_size, c.tsn));
            }
        }
        for (net, book, tsn) in recovered {
            self.flight_sub(net, book);
            self.retran_count += 1;
            debug!("window reopened, probe TSN {} marked for resend", tsn);
        }
    }

    pub(crate) fn flight_sub(&mut self, net: NetId, book: usize) {
        if let Some(d) = self.destinations.get_mut(net) {
            debug_assert!(d.flight_size >= book, "destination flight underflow");
            d.flight_size = d.flight_size.saturating_sub(book);
            d.flight_count = d.flight_count.saturating_sub(1);
        }
        self.total_flight = self.total_flight.saturating_sub(book);
        self.total_flight_count = self.total_flight_count.saturating_sub(1);
    }

    pub(crate) fn sws(&self, rwnd: u32) -> u32 {
        if rwnd < self.config.sws_sender {
            0
        } else {
            rwnd
        }
    }

    /// Charges one transmitted DATA chunk against the peer window.
    pub(crate) fn charge_peer_window(&mut self, send_size: usize) {
        let cost = send_size as u32 + self.config.peer_chunk_overhead;
        self.peers_rwnd = self.sws(self.peers_rwnd.saturating_sub(cost));
    }

    pub(crate) fn ip_overhead(&self, net: NetId) -> usize {
        match self.destinations.get(net) {
            Some(d) if d.is_ipv6() => IPV6_HEADER_SIZE,
            _ => IPV4_HEADER_SIZE,
        }
    }

    /// Room for chunks in one packet to `net`.
    pub(crate) fn packet_space(&self, net: NetId) -> usize {
        self.destinations.get(net).map_or(0, |d| {
            d.mtu
                .saturating_sub(self.ip_overhead(net) + SCTP_COMMON_HEADER_SIZE)
        })
    }

    pub(crate) fn smallest_mtu(&self) -> usize {
        self.dest_order
            .iter()
            .filter_map(|n| self.destinations.get(*n))
            .map(|d| d.mtu)
            .min()
            .unwrap_or(self.config.default_mtu)
    }

    fn any_ipv6(&self) -> bool {
        self.dest_order
            .iter()
            .filter_map(|n| self.destinations.get(*n))
            .any(|d| d.is_ipv6())
    }

    /// Largest DATA payload that fits every path.
    pub fn frag_point(&self) -> usize {
        let ip = if self.any_ipv6() {
            IPV6_HEADER_SIZE
        } else {
            IPV4_HEADER_SIZE
        };
        let overhead = ip
            + SCTP_COMMON_HEADER_SIZE
            + DATA_CHUNK_HEADER_SIZE
            + self.auth_len(super::chunk::CT_DATA);
        self.smallest_mtu().saturating_sub(overhead) & !3
    }

    /// Bytes an AUTH chunk adds in front of `kind`, if the peer requires it.
    pub(crate) fn auth_len(&self, kind: u8) -> usize {
        match &self.caps.auth {
            Some(auth) if auth.requires(kind) => auth.chunk_len(),
            _ => 0,
        }
    }

    pub(crate) fn usable_for_data(&self, net: NetId) -> bool {
        match self.destinations.get(net).map(|d| d.state) {
            Some(ReachState::Active) => true,
            Some(ReachState::PartiallyFailed) => !self.dest_order.iter().any(|n| {
                self.destinations
                    .get(*n)
                    .is_some_and(|d| d.state == ReachState::Active)
            }),
            _ => false,
        }
    }

    /// Another destination to use instead of `net`, preferring active over
    /// partially failed ones and walking the list from `net` onwards.
    pub fn find_alternate(&self, net: NetId) -> Option<NetId> {
        let start = self
            .dest_order
            .iter()
            .position(|n| *n == net)
            .map_or(0, |p| p + 1);
        let n = self.dest_order.len();
        let ring = (0..n).map(|i| self.dest_order[(start + i) % n]);
        let candidates: Vec<NetId> = ring.filter(|c| *c != net).collect();
        let with_state = |s: ReachState| {
            candidates.iter().copied().find(|c| {
                self.destinations
                    .get(*c)
                    .is_some_and(|d| d.state == s)
            })
        };
        with_state(ReachState::Active).or_else(|| with_state(ReachState::PartiallyFailed))
    }

    /// Moves everything queued but unsent for `from` over to `to`. Flight
    /// counters are untouched since none of it was sent.
    pub fn move_to_alternate(&mut self, from: NetId, to: NetId) -> usize {
        let mut moved = 0;
        for chunk in self.send_queue.iter_mut() {
            if chunk.dest == from {
                chunk.dest = to;
                moved += 1;
            }
        }
        let mut controls = 0;
        for chunk in self
            .control_queue
            .iter_mut()
            .chain(self.asconf_queue.iter_mut())
        {
            if chunk.dest == from
                && chunk.state == ChunkState::Unsent
                && chunk.kind != super::chunk::CT_HEARTBEAT
            {
                chunk.dest = to;
                controls += 1;
            }
        }
        for _ in 0..moved + controls {
            self.destinations.acquire(to);
            self.release_dest(from);
        }
        if moved + controls > 0 {
            debug!(
                "moved {} DATA and {} control chunks from {:?} to {:?}",
                moved, controls, from, to
            );
        }
        moved
    }

    /// Re-addresses chunks marked for resend on `from` to `to`.
    pub(crate) fn rehome_resend(&mut self, from: NetId, to: NetId) {
        let mut moved = 0;
        for chunk in self.sent_queue.iter_mut() {
            if chunk.dest == from && chunk.state == ChunkState::Resend {
                chunk.dest = to;
                moved += 1;
            }
        }
        for chunk in self
            .control_queue
            .iter_mut()
            .chain(self.asconf_queue.iter_mut())
        {
            if chunk.dest == from && chunk.state == ChunkState::Resend {
                chunk.dest = to;
                moved += 1;
            }
        }
        for _ in 0..moved {
            self.destinations.acquire(to);
            self.release_dest(from);
        }
    }

    /// Local address to send to `net` from, chosen once and cached.
    pub(crate) fn source_for(&mut self, net: NetId) -> SctpResult<Option<IpAddr>> {
        let Some(selector) = &self.sources else {
            return Ok(None);
        };
        let d = self
            .destinations
            .get(net)
            .ok_or(SctpError::UnknownDestination)?;
        if let Some(src) = d.cached_source {
            return Ok(Some(src));
        }
        let src = selector.choose_source(d.addr.ip())?;
        if let Some(d) = self.destinations.get_mut(net) {
            d.cached_source = Some(src);
        }
        Ok(Some(src))
    }

    /// Payload bytes not yet handed to the wire: stream queues plus send queue.
    pub(crate) fn unsent_bytes(&self) -> usize {
        let queued: usize = self.send_queue.iter().map(|c| c.payload.len()).sum();
        lock(&self.queues).pending_bytes + queued
    }

    /// Bytes in flight according to the sent queue itself.
    pub fn sent_unacked_bytes(&self) -> usize {
        self.sent_queue
            .iter()
            .filter(|c| c.in_flight())
            .map(|c| c.book_size)
            .sum()
    }

    pub(crate) fn check_invariants(&self) {
        if cfg!(debug_assertions) {
            let per_dest: usize = self
                .dest_order
                .iter()
                .filter_map(|n| self.destinations.get(*n))
                .map(|d| d.flight_size)
                .sum();
            let sent = self.sent_unacked_bytes();
            if per_dest != sent || self.total_flight != sent {
                warn!(
                    "flight accounting mismatch: destinations={} total={} sent queue={}",
                    per_dest, self.total_flight, sent
                );
            }
            debug_assert_eq!(per_dest, sent);
            debug_assert_eq!(self.total_flight, sent);
        }
    }

    pub fn print_stats(&self, reason: &str) {
        let duration = self.stats.created.elapsed();
        let s = &self.stats;
        let cwnds: Vec<String> = self
            .dest_order
            .iter()
            .filter_map(|n| self.destinations.get(*n))
            .map(|d| {
                format!(
                    "{} cwnd={} flight={} rto={:.3}s {:?}",
                    d.addr,
                    d.cwnd,
                    d.flight_size,
                    d.rto.rto().as_secs_f64(),
                    d.state
                )
            })
            .collect();

        debug!(
            "\n==================== SCTP ASSOCIATION CLOSED ====================\n\
             Reason: {}\n\
             Duration: {:.2}s\n\
             Packets Sent: {} ({} bytes)\n\
             DATA Chunks Sent: {}\n\
             Control Chunks Sent: {}\n\
             Retransmissions: {} (fast {})\n\
             T3 Timeouts: {}\n\
             Window Probes: {}\n\
             Abandoned: {}\n\
             ENOBUFS: {}, Unreachable sends: {}\n\
             Heartbeats Sent: {}\n\
             Peer RWND: {} bytes{}\n\
             Destinations: {:?}\n\
             ================================================================",
            reason,
            duration.as_secs_f64(),
            s.packets_sent,
            s.bytes_sent,
            s.data_chunks_sent,
            s.control_chunks_sent,
            s.retransmissions,
            s.fast_retransmits,
            s.t3_timeouts,
            s.window_probes,
            s.abandoned,
            s.enobufs,
            s.unreachable_sends,
            s.heartbeats_sent,
            self.peers_rwnd,
            if self.peers_rwnd == 0 {
                " (ZERO WINDOW!)"
            } else {
                ""
            },
            cwnds
        );
    }
}

#[derive(Debug, Default)]
pub(crate) struct SackOutcome {
    pub acked: Vec<DataChunk>,
    pub flight_reduction: Vec<(NetId, usize)>,
    pub newly_acked: Vec<(NetId, usize)>,
    pub rtt_samples: Vec<(NetId, Duration)>,
    pub fast_retransmit: Vec<(NetId, u32)>,
    pub resend_cleared: usize,
    pub highest_newly_acked: Option<u32>,
}

fn credit_chunk(outcome: &mut SackOutcome, chunk: &mut DataChunk, now: Instant) {
    match chunk.state {
        ChunkState::Sent => outcome.flight_reduction.push((chunk.dest, chunk.book_size)),
        ChunkState::Resend => {
            outcome.resend_cleared += 1;
            chunk.state = ChunkState::Sent;
        }
        _ => {}
    }
    if chunk.state != ChunkState::Abandoned {
        outcome.newly_acked.push((chunk.dest, chunk.book_size));
    }
    if chunk.do_rtt && chunk.snd_count == 1 {
        if let Some(at) = chunk.sent_at {
            outcome
                .rtt_samples
                .push((chunk.dest, now.saturating_duration_since(at)));
        }
    }
    chunk.do_rtt = false;
    match outcome.highest_newly_acked {
        Some(h) if !tsn_gt(chunk.tsn, h) => {}
        _ => outcome.highest_newly_acked = Some(chunk.tsn),
    }
}

/// Applies one SACK to the TSN ordered sent queue: removes what the
/// cumulative ack covers, flags gap acked chunks, and counts missing reports
/// below the highest newly acked TSN for fast retransmit.
pub(crate) fn apply_sack_to_sent_queue(
    sent: &mut VecDeque<DataChunk>,
    cum_tsn: u32,
    gaps: &[(u16, u16)],
    now: Instant,
) -> SackOutcome {
    let mut outcome = SackOutcome::default();

    while sent.front().is_some_and(|c| tsn_lte(c.tsn, cum_tsn)) {
        let Some(mut chunk) = sent.pop_front() else {
            break;
        };
        trace!("SACK acknowledging TSN {} (len={})", chunk.tsn, chunk.book_size);
        if !chunk.gap_acked {
            credit_chunk(&mut outcome, &mut chunk, now);
        }
        outcome.acked.push(chunk);
    }

    for &(start, end) in gaps {
        let s = cum_tsn.wrapping_add(start as u32);
        let e = cum_tsn.wrapping_add(end as u32);
        for chunk in sent.iter_mut() {
            if tsn_lt(chunk.tsn, s) {
                continue;
            }
            if tsn_gt(chunk.tsn, e) {
                break;
            }
            if !chunk.gap_acked {
                credit_chunk(&mut outcome, chunk, now);
                chunk.gap_acked = true;
            }
        }
    }

    if let Some(htna) = outcome.highest_newly_acked {
        for chunk in sent.iter_mut() {
            if !tsn_lt(chunk.tsn, htna) {
                break;
            }
            if chunk.gap_acked || chunk.state != ChunkState::Sent {
                continue;
            }
            chunk.missing_reports = chunk.missing_reports.saturating_add(1);
            if chunk.missing_reports >= DUP_THRESH && !chunk.fast_retransmit {
                chunk.state = ChunkState::Resend;
                chunk.fast_retransmit = true;
                chunk.missing_reports = 0;
                outcome
                    .flight_reduction
                    .push((chunk.dest, chunk.book_size));
                outcome.fast_retransmit.push((chunk.dest, chunk.tsn));
                debug!(
                    "Fast retransmit triggered for TSN {} after {} missing reports",
                    chunk.tsn, DUP_THRESH
                );
            }
        }
    }

    outcome
}
