//! Builders for every control chunk the engine originates.

use super::association::{Association, lock};
use super::chunk::{
    ABORT_FLAG_NO_TCB, CHUNK_HEADER_SIZE, CT_ABORT, CT_ASCONF, CT_ASCONF_ACK, CT_COOKIE_ACK,
    CT_COOKIE_ECHO, CT_CWR, CT_ECN_ECHO, CT_ERROR, CT_HEARTBEAT, CT_HEARTBEAT_ACK,
    CT_PACKET_DROPPED, CT_RECONFIG, CT_SHUTDOWN, CT_SHUTDOWN_ACK, CT_SHUTDOWN_COMPLETE,
    ChunkState, ControlChunk, MAX_DROPPED_REPORT, NetId, PKTDROP_FLAG_BAD_CRC,
    PKTDROP_FLAG_TRUNCATED, SHUTDOWN_COMPLETE_FLAG_NO_TCB, encode_chunk, padding, tsn_gt, tsn_lte,
};
use super::destination::ReachState;
use super::packet::{PacketOptions, PacketSink, SendStatus};
use crate::error::{SctpError, SctpResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

// Parameter Types
const PARAM_HEARTBEAT_INFO: u16 = 1;
const PARAM_OUTGOING_RESET: u16 = 13;
const PARAM_INCOMING_RESET: u16 = 14;
const PARAM_SSN_TSN_RESET: u16 = 15;
const PARAM_RESET_RESPONSE: u16 = 16;

const HEARTBEAT_INFO_LEN: usize = 44;

/// Stream reset response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetResult {
    SuccessNothingToDo = 0,
    SuccessPerformed = 1,
    Denied = 2,
    ErrorWrongSsn = 3,
    ErrorRequestInProgress = 4,
    ErrorBadSeqNumber = 5,
    InProgress = 6,
}

impl ResetResult {
    pub fn is_success(self) -> bool {
        matches!(
            self,
            ResetResult::SuccessNothingToDo | ResetResult::SuccessPerformed
        )
    }
}

fn put_address(buf: &mut BytesMut, addr: SocketAddr) {
    match addr {
        SocketAddr::V4(v4) => {
            buf.put_u16(4);
            buf.put_u16(v4.port());
            buf.put_slice(&v4.ip().octets());
            buf.put_bytes(0, 12);
        }
        SocketAddr::V6(v6) => {
            buf.put_u16(6);
            buf.put_u16(v6.port());
            buf.put_slice(&v6.ip().octets());
        }
    }
}

impl Association {
    /// Where association-level control goes: the primary, or an alternate
    /// while the primary is unreachable.
    pub(crate) fn control_destination(&self) -> Option<NetId> {
        let primary = self.primary?;
        let reachable = self.destinations.get(primary).is_some_and(|d| d.reachable());
        if reachable {
            return Some(primary);
        }
        self.find_alternate(primary).or(Some(primary))
    }

    fn reply_destination(&self) -> Option<NetId> {
        self.last_control_chunk_from
            .filter(|n| self.destinations.is_live(*n))
            .or_else(|| self.control_destination())
    }

    /// Records the source of the last control chunk received.
    pub fn note_control_from(&mut self, net: NetId) {
        self.last_control_chunk_from = Some(net);
    }

    /// Picks the destination most in need of a heartbeat and queues one.
    pub fn send_heartbeat(&mut self, now: Instant) -> Option<NetId> {
        let mut best: Option<(NetId, Duration)> = None;
        for &net in &self.dest_order {
            let Some(d) = self.destinations.get(net) else {
                continue;
            };
            if !d.heartbeat_enabled || !d.in_scope {
                continue;
            }
            if d.state == ReachState::Unconfirmed {
                best = Some((net, Duration::MAX));
                break;
            }
            let idle = d
                .last_heartbeat
                .map_or(Duration::MAX, |t| now.saturating_duration_since(t));
            if idle < d.rto.rto() {
                continue;
            }
            if best.is_none_or(|(_, longest)| idle > longest) {
                best = Some((net, idle));
            }
        }
        let (net, _) = best?;

        let d = self.destinations.get_mut(net)?;
        let nonce = if d.state == ReachState::Unconfirmed {
            (rand::random::<u32>(), rand::random::<u32>())
        } else {
            (0, 0)
        };
        d.heartbeat_nonce = Some(nonce);
        d.last_heartbeat = Some(now);
        let addr = d.addr;

        let mut buf = BytesMut::with_capacity(HEARTBEAT_INFO_LEN);
        buf.put_u16(PARAM_HEARTBEAT_INFO);
        buf.put_u16(HEARTBEAT_INFO_LEN as u16);
        buf.put_u64(now.saturating_duration_since(self.epoch).as_micros() as u64);
        buf.put_u32(nonce.0);
        buf.put_u32(nonce.1);
        put_address(&mut buf, addr);
        buf.put_u32(0);

        self.stats.heartbeats_sent += 1;
        trace!("Sending SCTP Heartbeat to {}", addr);
        self.push_control(ControlChunk::new(CT_HEARTBEAT, 0, buf.freeze(), net));
        Some(net)
    }

    /// Processes the echoed heartbeat info. Confirms the address when the
    /// nonce matches and takes an RTT sample.
    pub fn heartbeat_acked(&mut self, net: NetId, info: &[u8], now: Instant) -> bool {
        if info.len() < HEARTBEAT_INFO_LEN {
            return false;
        }
        let mut b = &info[4..];
        let sent = self.epoch + Duration::from_micros(b.get_u64());
        let nonce = (b.get_u32(), b.get_u32());
        let Some(d) = self.destinations.get_mut(net) else {
            return false;
        };
        if d.heartbeat_nonce != Some(nonce) {
            debug!("heartbeat ack from {:?} with stale nonce", net);
            return false;
        }
        d.heartbeat_nonce = None;
        d.error_count = 0;
        d.rto.update(now.saturating_duration_since(sent));
        if d.state != ReachState::Active {
            self.mark_destination_state(net, ReachState::Active);
        }
        true
    }

    pub fn send_heartbeat_ack(&mut self, net: NetId, info: Bytes) {
        trace!("Received SCTP Heartbeat, queueing ACK");
        self.push_control(ControlChunk::new(CT_HEARTBEAT_ACK, 0, info, net));
    }

    /// COOKIE-ECHO always leads the control queue.
    pub fn send_cookie_echo(&mut self, cookie: Bytes) {
        let Some(dest) = self.control_destination() else {
            return;
        };
        self.drop_control(|c| c.kind == CT_COOKIE_ECHO);
        self.push_control_front(ControlChunk::new(CT_COOKIE_ECHO, 0, cookie, dest));
    }

    pub fn cookie_acked(&mut self) {
        self.drop_control(|c| c.kind == CT_COOKIE_ECHO);
    }

    pub fn send_cookie_ack(&mut self) {
        if let Some(dest) = self.reply_destination() {
            self.push_control(ControlChunk::new(CT_COOKIE_ACK, 0, Bytes::new(), dest));
        }
    }

    pub(crate) fn send_shutdown(&mut self) {
        self.drop_control(|c| c.kind == CT_SHUTDOWN);
        let Some(dest) = self.control_destination() else {
            return;
        };
        let mut body = BytesMut::with_capacity(4);
        body.put_u32(self.recv.cum_tsn);
        debug!("queueing SHUTDOWN (cum TSN {})", self.recv.cum_tsn);
        self.push_control(ControlChunk::new(CT_SHUTDOWN, 0, body.freeze(), dest));
    }

    pub fn send_shutdown_ack(&mut self) {
        self.drop_control(|c| c.kind == CT_SHUTDOWN_ACK);
        if let Some(dest) = self.reply_destination() {
            self.push_control(ControlChunk::new(CT_SHUTDOWN_ACK, 0, Bytes::new(), dest));
        }
    }

    /// Sent straight to the sink, bypassing the queues.
    pub fn send_shutdown_complete(&mut self, sink: &mut dyn PacketSink, no_tcb: bool) -> SendStatus {
        let Some(dest) = self.reply_destination() else {
            return SendStatus::HostUnreachable;
        };
        let flags = if no_tcb { SHUTDOWN_COMPLETE_FLAG_NO_TCB } else { 0 };
        let mut buf = BytesMut::with_capacity(CHUNK_HEADER_SIZE);
        encode_chunk(CT_SHUTDOWN_COMPLETE, flags, &[], &mut buf);
        let opts = PacketOptions {
            no_tcb,
            control_chunks: 1,
            ..Default::default()
        };
        self.transmit(dest, &buf, opts, sink)
    }

    /// ABORT goes out immediately to the primary with an optional cause.
    pub(crate) fn send_abort(&mut self, sink: &mut dyn PacketSink, cause: Option<Bytes>) -> SendStatus {
        let Some(dest) = self.control_destination() else {
            return SendStatus::HostUnreachable;
        };
        let cause = cause.unwrap_or_default();
        let mut buf = BytesMut::with_capacity(CHUNK_HEADER_SIZE + cause.len() + 4);
        if self.auth_len(CT_ABORT) > 0 {
            if let Some(auth) = self.auth_chunk() {
                buf.put_slice(&auth);
            }
        }
        encode_chunk(CT_ABORT, 0, &cause, &mut buf);
        let opts = PacketOptions {
            control_chunks: 1,
            ..Default::default()
        };
        self.transmit(dest, &buf, opts, sink)
    }

    /// ABORT in answer to a packet for which we hold no association state.
    pub fn send_abort_no_tcb(&mut self, sink: &mut dyn PacketSink, to: SocketAddr) -> SendStatus {
        let mut buf = BytesMut::with_capacity(CHUNK_HEADER_SIZE);
        encode_chunk(CT_ABORT, ABORT_FLAG_NO_TCB, &[], &mut buf);
        let opts = PacketOptions {
            no_tcb: true,
            control_chunks: 1,
            ..Default::default()
        };
        self.transmit_to(to, None, &buf, opts, sink)
    }

    pub fn send_operation_error(&mut self, cause: Bytes) {
        if let Some(dest) = self.reply_destination() {
            self.push_control(ControlChunk::new(CT_ERROR, 0, cause, dest));
        }
    }

    /// Coalesced: an existing ECN-ECHO just takes the new TSN.
    pub fn send_ecn_echo(&mut self, net: NetId, tsn: u32) {
        if !self.caps.ecn {
            return;
        }
        if let Some(c) = self.control_queue.iter_mut().find(|c| c.kind == CT_ECN_ECHO) {
            c.body = Bytes::copy_from_slice(&tsn.to_be_bytes());
            c.state = ChunkState::Unsent;
            return;
        }
        let body = Bytes::copy_from_slice(&tsn.to_be_bytes());
        self.push_control(ControlChunk::new(CT_ECN_ECHO, 0, body, net));
    }

    /// The peer reduced its window; stop echoing up to `tsn`.
    pub fn cwr_received(&mut self, tsn: u32) {
        self.drop_control(|c| {
            c.kind == CT_ECN_ECHO && c.body.len() >= 4 && tsn_lte((&c.body[..]).get_u32(), tsn)
        });
    }

    /// Coalesced: only ever raises the reported TSN.
    pub fn send_cwr(&mut self, net: NetId, tsn: u32) {
        if let Some(c) = self.control_queue.iter_mut().find(|c| c.kind == CT_CWR) {
            let current = (&c.body[..]).get_u32();
            if tsn_gt(tsn, current) {
                c.body = Bytes::copy_from_slice(&tsn.to_be_bytes());
            }
            return;
        }
        let body = Bytes::copy_from_slice(&tsn.to_be_bytes());
        self.push_control(ControlChunk::new(CT_CWR, 0, body, net));
    }

    /// Reports a packet we had to drop, truncated to what fits.
    pub fn send_packet_dropped(&mut self, net: NetId, packet: &[u8], bad_crc: bool) -> bool {
        if !self.caps.packet_drop {
            return false;
        }
        let fixed = CHUNK_HEADER_SIZE + 12;
        let room = self
            .packet_space(net)
            .saturating_sub(fixed + self.auth_len(CT_PACKET_DROPPED))
            .min(MAX_DROPPED_REPORT);
        let len = packet.len().min(room);
        let truncated = len < packet.len();

        let mut flags = 0;
        if bad_crc {
            flags |= PKTDROP_FLAG_BAD_CRC;
        }
        if truncated {
            flags |= PKTDROP_FLAG_TRUNCATED;
        }
        let capacity = self.recv.capacity();
        let mut body = BytesMut::with_capacity(12 + len);
        body.put_u32(capacity);
        body.put_u32(capacity.saturating_sub(self.recv.advertised_rwnd()));
        body.put_u16(if truncated { packet.len() as u16 } else { 0 });
        body.put_u16(0);
        body.put_slice(&packet[..len]);
        debug!(
            "reporting dropped packet of {} bytes (bad_crc={}, truncated={})",
            packet.len(),
            bad_crc,
            truncated
        );
        self.push_control(ControlChunk::new(CT_PACKET_DROPPED, flags, body.freeze(), net));
        true
    }

    /// Queues an ASCONF to the primary. `params` follow the serial number.
    pub fn send_asconf(&mut self, serial: u32, params: Bytes) {
        let Some(dest) = self.control_destination() else {
            return;
        };
        let mut body = BytesMut::with_capacity(4 + params.len());
        body.put_u32(serial);
        body.put_slice(&params);
        let mut chunk = ControlChunk::new(CT_ASCONF, 0, body.freeze(), dest);
        chunk.seq = Some(serial);
        self.destinations.acquire(dest);
        self.asconf_queue.push_back(chunk);
    }

    pub fn asconf_acked(&mut self, serial: u32) {
        let mut released = Vec::new();
        self.asconf_queue.retain(|c| {
            if c.seq == Some(serial) {
                released.push(c.dest);
                false
            } else {
                true
            }
        });
        for net in released {
            self.release_dest(net);
        }
    }

    /// A retransmitted ASCONF-ACK walks the alternates up to two times
    /// before returning to where the ASCONF came from.
    pub fn send_asconf_ack(&mut self, serial: u32, response: Bytes, retransmit: bool) {
        let Some(from) = self.reply_destination() else {
            return;
        };
        let dest = if retransmit {
            self.used_alt_asconfack += 1;
            if self.used_alt_asconfack > 2 {
                self.used_alt_asconfack = 0;
                from
            } else {
                self.find_alternate(from).unwrap_or(from)
            }
        } else {
            self.used_alt_asconfack = 0;
            from
        };
        self.drop_control(|c| c.kind == CT_ASCONF_ACK);
        let mut body = BytesMut::with_capacity(4 + response.len());
        body.put_u32(serial);
        body.put_slice(&response);
        self.push_control(ControlChunk::new(CT_ASCONF_ACK, 0, body.freeze(), dest));
    }

    /// Queues a stream reset request. Only one may be outstanding; DATA is
    /// held back until the peer answers.
    pub fn request_stream_reset(
        &mut self,
        outgoing: &[u16],
        incoming: &[u16],
        tsn_reset: bool,
    ) -> SctpResult<u32> {
        if self.reset.outstanding.is_some() {
            return Err(SctpError::ResetInProgress);
        }
        let stream_count = lock(&self.queues).stream_count();
        let nothing = outgoing.is_empty() && incoming.is_empty() && !tsn_reset;
        let mixed = tsn_reset && (!outgoing.is_empty() || !incoming.is_empty());
        let out_of_range = outgoing.iter().any(|sid| *sid >= stream_count);
        if !self.caps.reconfig || nothing || mixed || out_of_range {
            return Err(SctpError::InvalidResetRequest);
        }
        let Some(dest) = self.control_destination() else {
            return Err(SctpError::UnknownDestination);
        };

        let first = self.reset.out_seq;
        let mut body = BytesMut::new();
        if !outgoing.is_empty() {
            let len = 16 + 2 * outgoing.len();
            body.put_u16(PARAM_OUTGOING_RESET);
            body.put_u16(len as u16);
            body.put_u32(self.reset.out_seq);
            body.put_u32(self.reset.peer_seq);
            body.put_u32(self.sending_seq.wrapping_sub(1));
            outgoing.iter().for_each(|sid| body.put_u16(*sid));
            body.put_bytes(0, padding(len));
            self.reset.out_seq = self.reset.out_seq.wrapping_add(1);
        }
        if !incoming.is_empty() {
            let len = 8 + 2 * incoming.len();
            body.put_u16(PARAM_INCOMING_RESET);
            body.put_u16(len as u16);
            body.put_u32(self.reset.out_seq);
            incoming.iter().for_each(|sid| body.put_u16(*sid));
            body.put_bytes(0, padding(len));
            self.reset.out_seq = self.reset.out_seq.wrapping_add(1);
        }
        if tsn_reset {
            body.put_u16(PARAM_SSN_TSN_RESET);
            body.put_u16(8);
            body.put_u32(self.reset.out_seq);
            self.reset.out_seq = self.reset.out_seq.wrapping_add(1);
        }

        let mut chunk = ControlChunk::new(CT_RECONFIG, 0, body.freeze(), dest);
        chunk.seq = Some(first);
        self.push_control(chunk);
        self.reset.outstanding = Some(first);
        self.reset.outgoing = outgoing.to_vec();
        debug!(
            "stream reset request {} (outgoing {:?}, incoming {:?}, tsn {})",
            first, outgoing, incoming, tsn_reset
        );
        Ok(first)
    }

    /// Answers a peer request; `tsns` carries the next TSNs for SSN/TSN resets.
    pub fn send_stream_reset_response(
        &mut self,
        resp_seq: u32,
        result: ResetResult,
        tsns: Option<(u32, u32)>,
    ) {
        let Some(dest) = self.reply_destination() else {
            return;
        };
        self.reset.peer_seq = resp_seq;
        let len = if tsns.is_some() { 20 } else { 12 };
        let mut body = BytesMut::with_capacity(len);
        body.put_u16(PARAM_RESET_RESPONSE);
        body.put_u16(len as u16);
        body.put_u32(resp_seq);
        body.put_u32(result as u32);
        if let Some((sender_next, receiver_next)) = tsns {
            body.put_u32(sender_next);
            body.put_u32(receiver_next);
        }
        self.push_control(ControlChunk::new(CT_RECONFIG, 0, body.freeze(), dest));
    }

    /// The peer answered our outstanding request.
    pub fn stream_reset_completed(&mut self, resp_seq: u32, result: ResetResult) -> bool {
        if self.reset.outstanding != Some(resp_seq) {
            return false;
        }
        self.reset.outstanding = None;
        self.drop_control(|c| c.kind == CT_RECONFIG && c.seq == Some(resp_seq));
        let streams = std::mem::take(&mut self.reset.outgoing);
        if result.is_success() && !streams.is_empty() {
            lock(&self.queues).reset_sequences(&streams);
        }
        debug!("stream reset {} completed: {:?}", resp_seq, result);
        true
    }
}
