//! Per-destination packet building and the output driver.

use super::association::{AssocState, Association};
use super::chunk::{
    CT_AUTH, CT_DATA, CT_ECN_ECHO, ChunkState, DATA_CHUNK_HEADER_SIZE, NetId, encode_chunk,
};
use super::destination::ReachState;
use super::packet::{PacketOptions, PacketSink, SendStatus, assemble};
use super::retransmit::RetransmitStatus;
use crate::error::{SctpError, SctpResult};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Why an output pass was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendReason {
    UserSend,
    T3Timeout,
    HeartbeatTimer,
    SackReceived,
    Control,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketResult {
    Sent,
    Nothing,
    Stop,
}

/// Chunks picked for one packet, by index into their queues.
#[derive(Debug, Default)]
struct Selection {
    asconf: Vec<usize>,
    control: Vec<usize>,
    data: Vec<usize>,
    auth: bool,
    used: usize,
    window_probe: bool,
}

impl Association {
    pub(crate) fn auth_chunk(&self) -> Option<Bytes> {
        let auth = self.caps.auth.as_ref()?;
        let mut body = BytesMut::with_capacity(4 + auth.hmac_len);
        body.put_u16(auth.key_id);
        body.put_u16(auth.hmac_id);
        body.put_bytes(0, auth.hmac_len);
        let mut buf = BytesMut::new();
        encode_chunk(CT_AUTH, 0, &body, &mut buf);
        Some(buf.freeze())
    }

    /// Hands a finished chunk section to the sink, resolving the source
    /// address first. A missing source counts as an unreachable host.
    pub(crate) fn transmit(
        &mut self,
        net: NetId,
        chunks: &[u8],
        opts: PacketOptions,
        sink: &mut dyn PacketSink,
    ) -> SendStatus {
        let Some(addr) = self.destinations.get(net).map(|d| d.addr) else {
            return SendStatus::HostUnreachable;
        };
        let source = match self.source_for(net) {
            Ok(source) => source,
            Err(e) => {
                debug!("no source address for {}: {}", addr, e);
                return SendStatus::HostUnreachable;
            }
        };
        self.transmit_to(addr, source, chunks, opts, sink)
    }

    pub(crate) fn transmit_to(
        &mut self,
        addr: SocketAddr,
        source: Option<IpAddr>,
        chunks: &[u8],
        opts: PacketOptions,
        sink: &mut dyn PacketSink,
    ) -> SendStatus {
        let packet = assemble(self.local_port, self.peer_port, self.peer_vtag, chunks);
        let len = packet.len();
        let status = sink.send_packet(addr, source, packet, opts);
        if status == SendStatus::Ok {
            self.stats.packets_sent += 1;
            self.stats.bytes_sent += len as u64;
            self.stats.data_chunks_sent += opts.data_chunks as u64;
            self.stats.control_chunks_sent += opts.control_chunks as u64;
        }
        status
    }

    /// Reacts to a refused send on `net`. Returns the error to surface, if any.
    pub(crate) fn send_failed(&mut self, net: NetId, status: SendStatus) -> Option<SctpError> {
        match status {
            SendStatus::Ok => None,
            SendStatus::NoMemory => {
                if let Some(d) = self.destinations.get_mut(net) {
                    d.had_enobuf = true;
                }
                self.stats.enobufs += 1;
                debug!("ENOBUFS sending to {:?}, batch rolled back", net);
                Some(SctpError::NoMemory)
            }
            SendStatus::HostUnreachable => {
                self.stats.unreachable_sends += 1;
                if let Some(d) = self.destinations.get_mut(net) {
                    d.cached_source = None;
                }
                match self.find_alternate(net) {
                    Some(alt) => {
                        debug!("destination {:?} unreachable, migrating to {:?}", net, alt);
                        self.move_to_alternate(net, alt);
                        self.rehome_resend(net, alt);
                    }
                    None => debug!("destination {:?} unreachable and no alternate", net),
                }
                None
            }
            SendStatus::Backpressure => {
                if let Some(d) = self.destinations.get_mut(net) {
                    d.backpressure += 1;
                    trace!("backpressure on {:?} ({})", net, d.backpressure);
                }
                None
            }
        }
    }

    fn select_chunks(&self, net: NetId, reason: SendReason, no_data: bool) -> Selection {
        let mut sel = Selection::default();
        let space = self.packet_space(net);
        let auth_total = self.caps.auth.as_ref().map_or(0, |a| a.chunk_len());

        let charge = |sel: &mut Selection, kind: u8, size: usize| -> usize {
            if !sel.auth && self.auth_len(kind) > 0 {
                size + auth_total
            } else {
                size
            }
        };

        // ASCONF first; only one outstanding at a time.
        if !self.asconf_queue.iter().any(|c| c.state == ChunkState::Sent) {
            for (i, c) in self.asconf_queue.iter().enumerate() {
                if c.dest != net || c.state != ChunkState::Unsent {
                    continue;
                }
                let size = charge(&mut sel, c.kind, c.book_size());
                if sel.used + size > space {
                    break;
                }
                sel.auth |= self.auth_len(c.kind) > 0;
                sel.used += size;
                sel.asconf.push(i);
            }
        }

        for (i, c) in self.control_queue.iter().enumerate() {
            if c.dest != net || c.state != ChunkState::Unsent {
                continue;
            }
            let size = charge(&mut sel, c.kind, c.book_size());
            if sel.used + size > space {
                if sel.used == 0 {
                    warn!(
                        "control chunk {} of {} bytes exceeds path MTU space {}",
                        c.kind, size, space
                    );
                } else {
                    continue;
                }
            }
            sel.auth |= self.auth_len(c.kind) > 0;
            sel.used += size;
            sel.control.push(i);
        }

        if no_data || !self.usable_for_data(net) {
            return sel;
        }
        let Some(d) = self.destinations.get(net) else {
            return sel;
        };

        if reason == SendReason::UserSend && self.config.nagle && self.total_flight > 0 {
            let overhead = self.ip_overhead(net)
                + super::chunk::SCTP_COMMON_HEADER_SIZE
                + DATA_CHUNK_HEADER_SIZE;
            if self.unsent_bytes() < self.smallest_mtu().saturating_sub(overhead) {
                trace!("Nagle: holding back small residual for {:?}", net);
                return sel;
            }
        }

        let mut data_space = space;
        let mut one_chunk = false;
        if d.mtu > self.peers_rwnd as usize {
            if self.total_flight > 0 {
                data_space = data_space.min(sel.used + self.peers_rwnd as usize);
            } else {
                one_chunk = true;
            }
        }

        let mut bundled = 0;
        for (i, c) in self.send_queue.iter().enumerate() {
            if c.dest != net {
                continue;
            }
            if sel.data.len() >= self.config.max_bundling {
                break;
            }
            let admitted =
                d.flight_size + bundled + c.book_size <= d.cwnd || d.flight_size + bundled == 0;
            if !admitted {
                break;
            }
            let size = charge(&mut sel, CT_DATA, c.book_size);
            if sel.used + size > data_space {
                let alone = sel.used == 0 && size > space;
                if !alone {
                    break;
                }
                warn!(
                    "DATA chunk TSN {} of {} bytes exceeds path MTU space {}",
                    c.tsn, c.book_size, space
                );
            }
            sel.auth |= self.auth_len(CT_DATA) > 0;
            sel.used += size;
            bundled += c.book_size;
            sel.data.push(i);
            if one_chunk {
                sel.window_probe = self.peers_rwnd == 0;
                break;
            }
        }
        sel
    }

    fn send_one_packet(
        &mut self,
        net: NetId,
        reason: SendReason,
        no_data: bool,
        sink: &mut dyn PacketSink,
        now: Instant,
    ) -> SctpResult<PacketResult> {
        let sel = self.select_chunks(net, reason, no_data);
        if sel.asconf.is_empty() && sel.control.is_empty() && sel.data.is_empty() {
            return Ok(PacketResult::Nothing);
        }

        let mut buf = BytesMut::with_capacity(sel.used);
        if sel.auth {
            if let Some(auth) = self.auth_chunk() {
                buf.put_slice(&auth);
            }
        }
        for &i in &sel.asconf {
            self.asconf_queue[i].encode(&mut buf);
        }
        for &i in &sel.control {
            self.control_queue[i].encode(&mut buf);
        }
        for &i in &sel.data {
            self.send_queue[i].encode(&mut buf);
        }
        let opts = PacketOptions {
            asconf: !sel.asconf.is_empty(),
            no_tcb: false,
            data_chunks: sel.data.len(),
            control_chunks: sel.asconf.len() + sel.control.len(),
        };

        let status = self.transmit(net, &buf, opts, sink);
        if status != SendStatus::Ok {
            return match self.send_failed(net, status) {
                Some(e) => Err(e),
                None => Ok(PacketResult::Stop),
            };
        }

        self.mark_packet_sent(net, sel, now);
        Ok(PacketResult::Sent)
    }

    fn mark_packet_sent(&mut self, net: NetId, sel: Selection, now: Instant) {
        let mut timed_sent = false;
        for &i in &sel.asconf {
            let c = &mut self.asconf_queue[i];
            c.state = ChunkState::Sent;
            c.snd_count += 1;
            c.sent_at = Some(now);
            timed_sent = true;
        }

        let mut removed = Vec::new();
        for &i in sel.control.iter().rev() {
            if self.control_queue[i].is_timed() {
                let c = &mut self.control_queue[i];
                c.state = ChunkState::Sent;
                c.snd_count += 1;
                c.sent_at = Some(now);
                timed_sent |= c.kind != CT_ECN_ECHO;
            } else if let Some(c) = self.control_queue.remove(i) {
                removed.push(c.dest);
            }
        }
        for dest in removed {
            self.release_dest(dest);
        }

        let mut chunks = Vec::with_capacity(sel.data.len());
        for &i in sel.data.iter().rev() {
            if let Some(c) = self.send_queue.remove(i) {
                chunks.push(c);
            }
        }
        chunks.reverse();
        let probe = sel.window_probe && self.total_flight == 0;
        for (n, mut chunk) in chunks.into_iter().enumerate() {
            chunk.state = ChunkState::Sent;
            chunk.snd_count = 1;
            chunk.sent_at = Some(now);
            chunk.do_rtt = n == 0;
            chunk.window_probe = probe;
            trace!(
                "Sent DATA TSN {} stream {} ({} bytes) to {:?}",
                chunk.tsn, chunk.sid, chunk.send_size, net
            );
            self.flight_add(net, chunk.book_size);
            self.charge_peer_window(chunk.send_size);
            self.insert_sent(chunk);
        }
        if probe {
            self.stats.window_probes += 1;
            debug!("window probe sent to {:?}", net);
        }

        if let Some(d) = self.destinations.get_mut(net) {
            d.backpressure = d.backpressure.saturating_sub(1);
            d.had_enobuf = false;
            if !sel.data.is_empty() || timed_sent {
                d.start_t3(now);
            }
        }
    }

    /// One pass over all destinations. Returns the number of packets sent.
    pub fn output_round(
        &mut self,
        reason: SendReason,
        sink: &mut dyn PacketSink,
        control_only: bool,
        now: Instant,
    ) -> SctpResult<usize> {
        if self.state == AssocState::Aborted {
            return Err(SctpError::Aborted);
        }
        let no_data = control_only || self.reset.outstanding.is_some();

        let order = self.dest_order.clone();
        if !no_data {
            for &net in &order {
                let headroom = self
                    .destinations
                    .get(net)
                    .is_some_and(|d| d.flight_size < d.cwnd);
                if headroom {
                    self.fill_outqueue(net, now);
                }
            }
        }

        let mut sent = 0;
        for &net in &order {
            let Some(d) = self.destinations.get(net) else {
                continue;
            };
            if d.state == ReachState::Unreachable {
                continue;
            }
            let burst = self
                .config
                .max_burst
                .saturating_sub(d.backpressure as usize)
                .max(1);
            for _ in 0..burst {
                match self.send_one_packet(net, reason, no_data, sink, now)? {
                    PacketResult::Sent => sent += 1,
                    PacketResult::Nothing | PacketResult::Stop => break,
                }
            }
        }
        self.check_invariants();
        Ok(sent)
    }

    /// ECN-ECHO keeps going out with every packet until a CWR arrives.
    pub(crate) fn fix_ecn_echo(&mut self) {
        for c in self.control_queue.iter_mut() {
            if c.kind == CT_ECN_ECHO && c.state == ChunkState::Sent {
                c.state = ChunkState::Unsent;
            }
        }
    }

    /// The output driver: pending SACK, retransmissions, then new data.
    pub fn chunk_output(
        &mut self,
        reason: SendReason,
        sink: &mut dyn PacketSink,
        now: Instant,
    ) -> SctpResult<()> {
        if self.state == AssocState::Aborted {
            return Ok(());
        }
        if reason == SendReason::UserSend && self.hold_after_enobuf() {
            return Ok(());
        }
        if self.sack_pending {
            self.build_ack();
        }

        if reason != SendReason::HeartbeatTimer {
            let mut rounds = 0;
            while self.retran_count > 0 && rounds < self.config.max_burst {
                let status = match self.retransmit_round(reason, sink, now) {
                    Ok(status) => status,
                    Err(SctpError::NoMemory) => {
                        debug!("retransmission deferred by ENOBUFS");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                };
                match status {
                    RetransmitStatus::Sent { fast, .. } => {
                        rounds += 1;
                        if reason == SendReason::T3Timeout {
                            self.control_round(reason, sink, now);
                            return Ok(());
                        }
                        if fast {
                            break;
                        }
                    }
                    RetransmitStatus::Deferred => {
                        self.control_round(reason, sink, now);
                        self.fix_ecn_echo();
                        return Ok(());
                    }
                    RetransmitStatus::Exit => break,
                }
            }
        }

        self.limit_fast_retransmit_burst();

        for net in self.dest_order.clone() {
            let unreachable = self
                .destinations
                .get(net)
                .is_some_and(|d| d.state == ReachState::Unreachable);
            if unreachable {
                if let Some(alt) = self.find_alternate(net) {
                    self.move_to_alternate(net, alt);
                }
            }
        }

        match self.output_round(reason, sink, false, now) {
            Ok(_) => {}
            Err(SctpError::NoMemory) => debug!("output round stopped by ENOBUFS"),
            Err(e) => return Err(e),
        }
        self.fix_ecn_echo();
        Ok(())
    }

    /// A user send right after the transport ran out of buffers only
    /// queues while more than two MTUs are in flight there. Clears the marks.
    fn hold_after_enobuf(&mut self) -> bool {
        let mut hold = false;
        for net in self.dest_order.clone() {
            if let Some(d) = self.destinations.get_mut(net) {
                if d.had_enobuf {
                    d.had_enobuf = false;
                    hold |= d.flight_size > 2 * d.mtu;
                }
            }
        }
        if hold {
            debug!("user send queued only, transport recently out of buffers");
        }
        hold
    }

    /// Destinations that just fast retransmitted may send at most a burst
    /// of new data on top of what is in flight.
    fn limit_fast_retransmit_burst(&mut self) {
        let burst = self.config.max_burst;
        for net in self.dest_order.clone() {
            let Some(d) = self.destinations.get_mut(net) else {
                continue;
            };
            if !d.fast_retran_ip {
                continue;
            }
            d.fast_retran_ip = false;
            let limit = d.flight_size + burst * d.mtu;
            if limit < d.cwnd {
                d.ssthresh = d.ssthresh.max(d.cwnd);
                d.cwnd = limit;
                debug!("cwnd of {:?} held to {} after fast retransmit", net, limit);
            }
        }
    }

    fn control_round(&mut self, reason: SendReason, sink: &mut dyn PacketSink, now: Instant) {
        if let Err(e) = self.output_round(reason, sink, true, now) {
            debug!("control-only round failed: {}", e);
        }
    }
}
