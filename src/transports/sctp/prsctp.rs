//! Partial reliability: abandoning chunks and reporting them with FORWARD-TSN.

use super::association::{Association, lock};
use super::chunk::{
    AbandonRule, CHUNK_HEADER_SIZE, CT_FORWARD_TSN, ChunkState, ControlChunk, tsn_gt, tsn_lt,
    tsn_lte,
};
use super::stream::{AppendMode, SendOptions};
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

impl Association {
    /// Abandons every piece of message `msg_id` on stream `sid`: sent and
    /// unsent chunks become abandoned entries of the sent queue and an
    /// unfinished remainder is dropped. Returns the payload bytes released.
    pub(crate) fn abandon_message(&mut self, msg_id: u64, sid: u16) -> usize {
        let mut freed = 0;
        let mut reductions = Vec::new();
        let mut resends = 0;
        for c in self.sent_queue.iter_mut() {
            if c.msg_id != msg_id || c.state == ChunkState::Abandoned {
                continue;
            }
            if c.in_flight() {
                reductions.push((c.dest, c.book_size));
            }
            if c.state == ChunkState::Resend {
                resends += 1;
            }
            freed += c.payload.len();
            c.payload = Bytes::new();
            c.state = ChunkState::Abandoned;
            self.stats.abandoned += 1;
            trace!("abandoned sent TSN {}", c.tsn);
        }
        for (net, book) in reductions {
            self.flight_sub(net, book);
        }
        self.retran_count = self.retran_count.saturating_sub(resends);

        let mut unsent = Vec::new();
        let mut i = 0;
        while i < self.send_queue.len() {
            if self.send_queue[i].msg_id == msg_id {
                if let Some(c) = self.send_queue.remove(i) {
                    unsent.push(c);
                }
            } else {
                i += 1;
            }
        }
        for mut c in unsent {
            freed += c.payload.len();
            c.payload = Bytes::new();
            c.state = ChunkState::Abandoned;
            self.stats.abandoned += 1;
            trace!("abandoned unsent TSN {}", c.tsn);
            self.insert_sent(c);
        }

        let queues = Arc::clone(&self.queues);
        let mut q = lock(&queues);
        let q = &mut *q;
        let mut dropped_dest = None;
        if let Some(stream) = q.streams.get_mut(sid as usize) {
            if let Some(pos) = stream.queue.iter().position(|m| m.msg_id == msg_id) {
                let msg = &mut stream.queue[pos];
                let released = msg.data.len();
                if msg.some_taken {
                    // keep the stub so the fragmenter unlocks the stream
                    msg.data.clear();
                    msg.discard_rest = true;
                    msg.complete = true;
                } else if let Some(msg) = stream.queue.remove(pos) {
                    dropped_dest = msg.dest;
                    self.stats.abandoned += 1;
                }
                q.pending_bytes = q.pending_bytes.saturating_sub(released);
                freed += released;
            }
        }
        if q.open_record == Some(sid) {
            q.open_record = None;
        }
        if q.streams.get(sid as usize).is_some_and(|s| s.queue.is_empty()) {
            q.wheel.remove(&mut q.streams, sid);
            q.unlock(sid);
        }
        q.retire(freed);
        drop(q);

        if let Some(net) = dropped_dest {
            self.release_dest(net);
        }
        freed
    }

    /// Settles a message whose send stopped before all of it was copied in.
    /// A message the send created is withdrawn when none of it was
    /// fragmented yet, or abandoned when the peer supports partial
    /// reliability. Otherwise the remaining bytes are queued past the buffer
    /// ceiling so the message ends where the sender meant it to. Returns the
    /// payload bytes released.
    pub fn cancel_partial(
        &mut self,
        sid: u16,
        msg_id: u64,
        rest: Bytes,
        owned: bool,
        complete: bool,
        now: Instant,
    ) -> usize {
        let queues = Arc::clone(&self.queues);
        let some_taken = {
            let q = lock(&queues);
            q.streams
                .get(sid as usize)
                .and_then(|s| s.queue.iter().find(|m| m.msg_id == msg_id && !m.complete))
                .map(|m| m.some_taken)
        };
        let Some(some_taken) = some_taken else {
            return 0;
        };

        if owned && !some_taken {
            let Some(msg) = lock(&queues).withdraw(sid, msg_id) else {
                return 0;
            };
            if let Some(net) = msg.dest {
                self.release_dest(net);
            }
            debug!("withdrew unfinished message {} from stream {}", msg_id, sid);
            return msg.len();
        }
        if owned && self.caps.prsctp {
            let freed = self.abandon_message(msg_id, sid);
            if self.advance_peer_ack_point() {
                self.send_forward_tsn();
            }
            debug!("abandoned unfinished message {} on stream {}", msg_id, sid);
            self.check_invariants();
            return freed;
        }

        let mode = AppendMode {
            complete,
            copying: false,
            continues: Some(msg_id),
        };
        let len = rest.len();
        let result = lock(&queues).append(
            sid,
            rest,
            &SendOptions::default(),
            mode,
            AbandonRule::Never,
            now,
        );
        match result {
            Ok(_) => debug!("finished message {} on stream {} with {} bytes", msg_id, sid, len),
            Err(e) => debug!("could not finish message {}: {}", msg_id, e),
        }
        0
    }

    /// Frees at least `dataout` bytes of send buffer if abandon-eligible
    /// chunks allow it. Buffer-priority chunks at or below the importance of
    /// `new_priority` go first, then expired ones. Safe to call repeatedly.
    pub fn prune_prsctp(&mut self, dataout: usize, new_priority: u32, now: Instant) -> usize {
        if !(self.caps.prsctp && self.config.prsctp_drain) {
            return 0;
        }
        let mut freed = 0;

        let mut candidates: Vec<(u64, u16)> = Vec::new();
        let mut push = |msg_id: u64, sid: u16| {
            if !candidates.contains(&(msg_id, sid)) {
                candidates.push((msg_id, sid));
            }
        };
        for c in &self.sent_queue {
            if c.state != ChunkState::Abandoned
                && matches!(c.abandon, AbandonRule::Priority(p) if p >= new_priority)
            {
                push(c.msg_id, c.sid);
            }
        }
        for c in &self.send_queue {
            let eligible = match c.abandon {
                AbandonRule::Priority(p) => p >= new_priority,
                AbandonRule::Deadline(at) => at <= now,
                _ => false,
            };
            if eligible {
                push(c.msg_id, c.sid);
            }
        }
        {
            let q = lock(&self.queues);
            for stream in &q.streams {
                for m in &stream.queue {
                    if !m.discard_rest && matches!(m.abandon, AbandonRule::Deadline(at) if at <= now)
                    {
                        push(m.msg_id, m.sid);
                    }
                }
            }
        }

        for (msg_id, sid) in candidates {
            if freed >= dataout {
                break;
            }
            freed += self.abandon_message(msg_id, sid);
        }

        if freed > 0 {
            debug!(
                "PR-SCTP pruned {} bytes (wanted {}, priority {})",
                freed, dataout, new_priority
            );
            if self.advance_peer_ack_point() {
                self.send_forward_tsn();
            }
        }
        self.check_invariants();
        freed
    }

    /// Moves the advanced peer ack point over abandoned chunks at the head of
    /// the sent queue. True when it now lies past the cumulative ack.
    pub fn advance_peer_ack_point(&mut self) -> bool {
        if tsn_lt(self.advanced_peer_ack_point, self.last_acked_seq) {
            self.advanced_peer_ack_point = self.last_acked_seq;
        }
        for c in &self.sent_queue {
            if tsn_lte(c.tsn, self.advanced_peer_ack_point) {
                continue;
            }
            if c.state == ChunkState::Abandoned
                && c.tsn == self.advanced_peer_ack_point.wrapping_add(1)
            {
                self.advanced_peer_ack_point = c.tsn;
            } else {
                break;
            }
        }
        tsn_gt(self.advanced_peer_ack_point, self.last_acked_seq)
    }

    /// Queues a FORWARD-TSN for the current advanced peer ack point,
    /// replacing any earlier one.
    pub(crate) fn send_forward_tsn(&mut self) {
        self.drop_control(|c| c.kind == CT_FORWARD_TSN);
        let Some(dest) = self.control_destination() else {
            return;
        };
        let space = self
            .packet_space(dest)
            .saturating_sub(CHUNK_HEADER_SIZE + 4 + self.auth_len(CT_FORWARD_TSN));
        let max_pairs = space / 4;

        let mut pairs: Vec<(u16, u16)> = Vec::new();
        let mut new_cum = self.last_acked_seq;
        for c in &self.sent_queue {
            if tsn_lte(c.tsn, self.last_acked_seq) {
                continue;
            }
            if tsn_gt(c.tsn, self.advanced_peer_ack_point) {
                break;
            }
            if !c.unordered() {
                match pairs.iter().position(|(sid, _)| *sid == c.sid) {
                    Some(i) => pairs[i].1 = c.ssn,
                    None if pairs.len() < max_pairs => pairs.push((c.sid, c.ssn)),
                    None => {
                        debug!(
                            "FORWARD-TSN trimmed to {} streams, reporting TSN {}",
                            max_pairs, new_cum
                        );
                        self.advanced_peer_ack_point = new_cum;
                        break;
                    }
                }
            }
            new_cum = c.tsn;
        }
        if !tsn_gt(new_cum, self.last_acked_seq) {
            return;
        }

        let mut body = BytesMut::with_capacity(4 + 4 * pairs.len());
        body.put_u32(new_cum);
        for (sid, ssn) in &pairs {
            body.put_u16(*sid);
            body.put_u16(*ssn);
        }
        trace!("FORWARD-TSN {} with {} stream entries", new_cum, pairs.len());
        self.push_control(ControlChunk::new(CT_FORWARD_TSN, 0, body.freeze(), dest));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SctpError;
    use crate::config::EngineConfig;
    use crate::transports::sctp::association::AssociationParams;
    use crate::transports::sctp::chunk::NetId;
    use crate::transports::sctp::destination::ReachState;
    use crate::transports::sctp::output::SendReason;
    use crate::transports::sctp::packet::RecordingSink;
    use crate::transports::sctp::stream::PrPolicy;

    fn assoc(prsctp: bool) -> (Association, NetId) {
        let mut params = AssociationParams::new(4);
        params.capabilities.prsctp = prsctp;
        let config = EngineConfig {
            nagle: false,
            ..Default::default()
        };
        let mut a = Association::new(params, config, Instant::now());
        let net = a.add_destination("192.0.2.1:5000".parse().unwrap(), ReachState::Active);
        (a, net)
    }

    fn copying() -> AppendMode {
        AppendMode {
            complete: false,
            copying: true,
            continues: None,
        }
    }

    fn forward_tsns(a: &Association) -> Vec<Bytes> {
        a.control_queue()
            .iter()
            .filter(|c| c.kind == CT_FORWARD_TSN)
            .map(|c| c.body.clone())
            .collect()
    }

    #[test]
    fn test_forward_tsn_keeps_highest_ssn_per_stream() {
        let (mut a, _) = assoc(true);
        let now = Instant::now();
        let cheap = SendOptions {
            pr_policy: PrPolicy::Buf(5),
            ..Default::default()
        };
        for sid in [0, 1, 0] {
            a.enqueue(sid, Bytes::from(vec![7u8; 100]), &cheap, now).unwrap();
        }
        let mut sink = RecordingSink::new();
        a.output_round(SendReason::UserSend, &mut sink, false, now)
            .unwrap();
        assert_eq!(a.sent_queue().len(), 3);

        assert_eq!(a.prune_prsctp(300, 5, now), 300);
        assert_eq!(a.advanced_peer_ack_point, 3);
        let fwd = forward_tsns(&a);
        assert_eq!(fwd.len(), 1);
        // cum TSN 3; stream 0 through SSN 1, stream 1 through SSN 0
        assert_eq!(&fwd[0][..], &[0, 0, 0, 3, 0, 0, 0, 1, 0, 1, 0, 0]);
    }

    #[test]
    fn test_forward_tsn_stops_at_unabandoned_chunk() {
        let (mut a, _) = assoc(true);
        let now = Instant::now();
        let cheap = SendOptions {
            pr_policy: PrPolicy::Buf(5),
            ..Default::default()
        };
        a.enqueue(0, Bytes::from(vec![1u8; 100]), &cheap, now).unwrap();
        a.enqueue(1, Bytes::from(vec![2u8; 100]), &SendOptions::default(), now)
            .unwrap();
        a.enqueue(2, Bytes::from(vec![3u8; 100]), &cheap, now).unwrap();
        let mut sink = RecordingSink::new();
        a.output_round(SendReason::UserSend, &mut sink, false, now)
            .unwrap();

        a.prune_prsctp(200, 5, now);
        // TSN 2 is reliable, so only TSN 1 may be skipped
        assert_eq!(a.advanced_peer_ack_point, 1);
        assert_eq!(&forward_tsns(&a)[0][..], &[0, 0, 0, 1, 0, 0, 0, 0]);
    }

    #[test]
    fn test_cancel_withdraws_unfragmented_message() {
        let (mut a, _) = assoc(false);
        let now = Instant::now();
        let opts = SendOptions::default();
        let (id, created) = a
            .append(1, Bytes::from(vec![9u8; 500]), &opts, copying(), now)
            .unwrap()
            .unwrap();
        assert!(created);
        assert_eq!(
            a.enqueue(2, Bytes::from_static(b"x"), &opts, now),
            Err(SctpError::StreamLocked(1))
        );

        assert_eq!(a.cancel_partial(1, id, Bytes::from(vec![9u8; 300]), true, true, now), 500);
        assert_eq!(a.buffered_amount(), 0);
        {
            let queues = a.queues();
            let q = queues.lock().unwrap();
            assert!(q.open_record.is_none());
            assert!(q.streams[1].queue.is_empty());
            assert_eq!(q.streams[1].next_ssn, 0);
        }
        a.enqueue(2, Bytes::from_static(b"x"), &opts, now).unwrap();
        // a second cancel finds nothing
        assert_eq!(a.cancel_partial(1, id, Bytes::new(), true, true, now), 0);
    }

    #[test]
    fn test_cancel_abandons_fragmented_message() {
        let (mut a, _) = assoc(true);
        let now = Instant::now();
        let (id, _) = a
            .append(0, Bytes::from(vec![4u8; 3000]), &SendOptions::default(), copying(), now)
            .unwrap()
            .unwrap();
        let mut sink = RecordingSink::new();
        a.output_round(SendReason::UserSend, &mut sink, false, now)
            .unwrap();
        assert_eq!(a.sent_queue().len(), 1);

        let freed = a.cancel_partial(0, id, Bytes::from(vec![4u8; 1000]), true, true, now);
        assert_eq!(freed, 3000);
        assert_eq!(a.buffered_amount(), 0);
        assert_eq!(a.sent_queue()[0].state, ChunkState::Abandoned);
        assert_eq!(&forward_tsns(&a)[0][..], &[0, 0, 0, 1, 0, 0, 0, 0]);
        let queues = a.queues();
        let q = queues.lock().unwrap();
        assert!(q.open_record.is_none());
        assert!(q.streams[0].queue.iter().all(|m| m.discard_rest));
    }

    #[test]
    fn test_cancel_finishes_message_without_partial_reliability() {
        let (mut a, _) = assoc(false);
        let now = Instant::now();
        let (id, _) = a
            .append(0, Bytes::from(vec![4u8; 3000]), &SendOptions::default(), copying(), now)
            .unwrap()
            .unwrap();
        let mut sink = RecordingSink::new();
        a.output_round(SendReason::UserSend, &mut sink, false, now)
            .unwrap();

        assert_eq!(a.cancel_partial(0, id, Bytes::from(vec![4u8; 1000]), true, true, now), 0);
        assert_eq!(a.buffered_amount(), 4000);
        let queues = a.queues();
        let q = queues.lock().unwrap();
        assert!(q.open_record.is_none());
        let msg = &q.streams[0].queue[0];
        assert!(msg.complete && !msg.copying);
        assert_eq!(msg.len(), 2548);
    }
}
