use super::association::Association;
use super::chunk::{AbandonRule, CT_DATA, ChunkState, SCTP_COMMON_HEADER_SIZE};
use super::output::SendReason;
use super::packet::{PacketOptions, PacketSink, SendStatus};
use crate::error::{SctpError, SctpResult};
use bytes::{BufMut, BytesMut};
use std::time::Instant;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetransmitStatus {
    Sent { chunks: usize, fast: bool },
    /// Window does not allow it yet.
    Deferred,
    /// Nothing (more) to retransmit.
    Exit,
}

/// Which control queue a chunk marked for resend sits in.
#[derive(Debug, Clone, Copy)]
enum ControlSlot {
    Asconf(usize),
    Control(usize),
}

impl Association {
    /// Retransmits one packet worth of chunks marked for resend.
    pub fn retransmit_round(
        &mut self,
        _reason: SendReason,
        sink: &mut dyn PacketSink,
        now: Instant,
    ) -> SctpResult<RetransmitStatus> {
        if let Some(status) = self.retransmit_control(sink, now)? {
            return Ok(status);
        }

        if self.caps.prsctp {
            self.abandon_expired_resends(now);
        }
        if self.sent_queue.is_empty() {
            return Ok(RetransmitStatus::Exit);
        }
        let Some(first) = self
            .sent_queue
            .iter()
            .position(|c| c.state == ChunkState::Resend)
        else {
            return Ok(RetransmitStatus::Exit);
        };

        let (tsn, snd_count, mut net, fast) = {
            let c = &self.sent_queue[first];
            (c.tsn, c.snd_count, c.dest, c.fast_retransmit)
        };
        if snd_count > self.config.max_retransmits {
            warn!(
                "TSN {} reached the retransmission limit ({}), aborting association",
                tsn, self.config.max_retransmits
            );
            self.abort(sink, None);
            return Err(SctpError::RetransmitLimit { tsn });
        }

        let reachable = self.destinations.get(net).is_some_and(|d| d.reachable());
        if !reachable {
            if let Some(alt) = self.find_alternate(net) {
                self.rehome_resend(net, alt);
                net = alt;
            }
        }
        let Some(d) = self.destinations.get(net) else {
            return Ok(RetransmitStatus::Exit);
        };
        let (cwnd, flight) = (d.cwnd, d.flight_size);

        let auth = self.auth_len(CT_DATA);
        let space = self.packet_space(net).saturating_sub(auth);
        let oldest = tsn == self.last_acked_seq.wrapping_add(1);
        let rwnd = self.peers_rwnd as usize;
        if rwnd < space && self.total_flight > 0 && !oldest {
            trace!("retransmission of TSN {} deferred by peer window", tsn);
            return Ok(RetransmitStatus::Deferred);
        }
        let one_chunk = rwnd < space;
        if !fast && flight >= cwnd && !oldest {
            trace!("retransmission of TSN {} deferred by cwnd", tsn);
            return Ok(RetransmitStatus::Deferred);
        }

        let mut picked = Vec::new();
        let mut used = 0;
        let mut bundled = 0;
        for (i, c) in self.sent_queue.iter().enumerate().skip(first) {
            if c.state != ChunkState::Resend || c.dest != net || c.fast_retransmit != fast {
                continue;
            }
            if picked.len() >= self.config.max_bundling {
                break;
            }
            if !picked.is_empty() {
                if used + c.book_size > space {
                    break;
                }
                if !fast && flight + bundled + c.book_size > cwnd {
                    break;
                }
            }
            used += c.book_size;
            bundled += c.book_size;
            picked.push(i);
            if one_chunk {
                break;
            }
        }

        let mut buf = BytesMut::with_capacity(used + auth);
        if auth > 0 {
            if let Some(chunk) = self.auth_chunk() {
                buf.put_slice(&chunk);
            }
        }
        for &i in &picked {
            self.sent_queue[i].encode(&mut buf);
        }
        let opts = PacketOptions {
            data_chunks: picked.len(),
            ..Default::default()
        };
        let status = self.transmit(net, &buf, opts, sink);
        if status != SendStatus::Ok {
            return match self.send_failed(net, status) {
                Some(e) => Err(e),
                None => Ok(RetransmitStatus::Exit),
            };
        }

        for &i in &picked {
            let (book, send_size) = {
                let c = &mut self.sent_queue[i];
                c.state = ChunkState::Sent;
                c.snd_count += 1;
                c.do_rtt = false;
                c.sent_at = Some(now);
                c.missing_reports = 0;
                trace!("Retransmitted TSN {} (attempt {}) to {:?}", c.tsn, c.snd_count, net);
                (c.book_size, c.send_size)
            };
            self.flight_add(net, book);
            self.charge_peer_window(send_size);
        }
        self.retran_count = self.retran_count.saturating_sub(picked.len());
        self.stats.retransmissions += picked.len() as u64;
        if fast {
            self.stats.fast_retransmits += picked.len() as u64;
            if let Some(d) = self.destinations.get_mut(net) {
                d.fast_retran_ip = true;
            }
        }
        if let Some(d) = self.destinations.get_mut(net) {
            d.start_t3(now);
        }
        debug!(
            "Retransmitted {} chunks to {:?} (fast={}, oldest TSN {})",
            picked.len(),
            net,
            fast,
            tsn
        );
        self.check_invariants();
        Ok(RetransmitStatus::Sent {
            chunks: picked.len(),
            fast,
        })
    }

    /// COOKIE-ECHO, stream reset requests, FORWARD-TSN and ASCONF go out
    /// alone, ahead of any DATA.
    fn retransmit_control(
        &mut self,
        sink: &mut dyn PacketSink,
        now: Instant,
    ) -> SctpResult<Option<RetransmitStatus>> {
        let slot = self
            .asconf_queue
            .iter()
            .position(|c| c.state == ChunkState::Resend)
            .map(ControlSlot::Asconf)
            .or_else(|| {
                self.control_queue
                    .iter()
                    .position(|c| c.state == ChunkState::Resend)
                    .map(ControlSlot::Control)
            });
        let Some(slot) = slot else {
            return Ok(None);
        };

        let (chunk, asconf) = match slot {
            ControlSlot::Asconf(i) => (&self.asconf_queue[i], true),
            ControlSlot::Control(i) => (&self.control_queue[i], false),
        };
        let net = chunk.dest;
        let needs_auth = self.auth_len(chunk.kind) > 0;
        let mut buf = BytesMut::with_capacity(SCTP_COMMON_HEADER_SIZE + chunk.book_size());
        if needs_auth {
            if let Some(auth) = self.auth_chunk() {
                buf.put_slice(&auth);
            }
        }
        chunk.encode(&mut buf);
        let kind = chunk.kind;

        let opts = PacketOptions {
            asconf,
            control_chunks: 1,
            ..Default::default()
        };
        let status = self.transmit(net, &buf, opts, sink);
        if status != SendStatus::Ok {
            return match self.send_failed(net, status) {
                Some(e) => Err(e),
                None => Ok(Some(RetransmitStatus::Exit)),
            };
        }

        let chunk = match slot {
            ControlSlot::Asconf(i) => &mut self.asconf_queue[i],
            ControlSlot::Control(i) => &mut self.control_queue[i],
        };
        chunk.state = ChunkState::Sent;
        chunk.snd_count += 1;
        chunk.sent_at = Some(now);
        if let Some(d) = self.destinations.get_mut(net) {
            d.start_t3(now);
        }
        self.stats.retransmissions += 1;
        debug!("Retransmitted control chunk type {} to {:?}", kind, net);
        Ok(Some(RetransmitStatus::Sent {
            chunks: 1,
            fast: false,
        }))
    }

    /// Abandons resend-marked chunks whose partial reliability ran out.
    pub(crate) fn abandon_expired_resends(&mut self, now: Instant) {
        let expired: Vec<(u64, u16)> = self
            .sent_queue
            .iter()
            .filter(|c| c.state == ChunkState::Resend)
            .filter(|c| match c.abandon {
                AbandonRule::Deadline(at) => at <= now,
                AbandonRule::Retransmits(limit) => c.snd_count > limit,
                _ => false,
            })
            .map(|c| (c.msg_id, c.sid))
            .collect();
        if expired.is_empty() {
            return;
        }
        let mut freed = 0;
        for (msg_id, sid) in expired {
            freed += self.abandon_message(msg_id, sid);
        }
        debug!("abandoned expired chunks at retransmission, {} bytes freed", freed);
        if self.advance_peer_ack_point() {
            self.send_forward_tsn();
        }
    }
}
