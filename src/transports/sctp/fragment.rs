//! Moving application messages from the stream queues into TSN-numbered
//! DATA chunks on the association send queue.

use super::association::{Association, lock};
use super::chunk::{
    ChunkState, DATA_CHUNK_HEADER_SIZE, DATA_FLAG_FIRST, DATA_FLAG_LAST,
    DATA_FLAG_NOT_FRAGMENTED, DATA_FLAG_UNORDERED, DataChunk, NetId, padded,
};
use crate::config::EngineConfig;
use std::sync::Arc;
use std::time::Instant;
use tracing::{trace, warn};

/// Chunk header bytes reserved out of every fill goal.
const FILL_SLOP: usize = DATA_CHUNK_HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MoveOutcome {
    Moved { book: usize, done: bool },
    /// Head message is pinned to another destination.
    Skip,
    /// Nothing can be cut within the budget right now.
    Blocked,
    /// An abandoned remainder was dropped.
    Discarded,
    Empty,
}

/// Payload bytes to cut from a message holding `len` bytes, given `space`
/// bytes of budget. Zero means wait.
pub(crate) fn take_size(
    len: usize,
    complete: bool,
    no_fragment: bool,
    space: usize,
    frag_point: usize,
    config: &EngineConfig,
) -> usize {
    let mandatory = config.send_buffer_ceiling < frag_point;
    let split_at = config.min_split_point.min(frag_point);

    if complete {
        if len <= space {
            return len;
        }
        if no_fragment {
            if space >= frag_point {
                warn!(
                    "message of {} bytes exceeds fragmentation point {} without fragment-ok",
                    len, frag_point
                );
                return len;
            }
            return 0;
        }
        if mandatory || space >= split_at {
            return space;
        }
        return 0;
    }

    // More data is coming; always keep a byte back for the final fragment.
    if len == 0 {
        return 0;
    }
    if mandatory {
        return space.min(len - 1);
    }
    if len <= space || len - space < config.min_residual {
        return 0;
    }
    if space >= split_at { space } else { 0 }
}

pub(crate) fn fragment_flags(some_taken: bool, finishes: bool, unordered: bool) -> u8 {
    let mut flags = match (some_taken, finishes) {
        (false, true) => DATA_FLAG_NOT_FRAGMENTED,
        (true, true) => DATA_FLAG_LAST,
        (false, false) => DATA_FLAG_FIRST,
        (true, false) => 0,
    };
    if unordered {
        flags |= DATA_FLAG_UNORDERED;
    }
    flags
}

impl Association {
    pub(crate) fn queued_to(&self, net: NetId) -> usize {
        self.send_queue
            .iter()
            .filter(|c| c.dest == net)
            .map(|c| c.book_size)
            .sum()
    }

    /// Cuts at most `budget` payload bytes off the head message of `sid` and
    /// appends the resulting chunk, addressed to `net`, to the send queue.
    pub(crate) fn move_to_outqueue(
        &mut self,
        net: NetId,
        sid: u16,
        budget: usize,
        _now: Instant,
    ) -> MoveOutcome {
        let frag_point = self.frag_point();
        let queues = Arc::clone(&self.queues);
        let mut q = lock(&queues);
        let q = &mut *q;

        let Some(msg) = q.streams[sid as usize].queue.front_mut() else {
            q.wheel.remove(&mut q.streams, sid);
            q.unlock(sid);
            return MoveOutcome::Empty;
        };

        if msg.discard_rest {
            let released = msg.data.len();
            let pinned = msg.dest;
            q.streams[sid as usize].queue.pop_front();
            q.pending_bytes = q.pending_bytes.saturating_sub(released);
            q.retire(released);
            q.unlock(sid);
            if q.streams[sid as usize].queue.is_empty() {
                q.wheel.remove(&mut q.streams, sid);
            }
            if let Some(pinned) = pinned {
                self.release_dest(pinned);
            }
            trace!("dropped abandoned remainder on stream {}", sid);
            return MoveOutcome::Discarded;
        }

        if let Some(pinned) = msg.dest {
            if pinned != net && self.destinations.is_live(pinned) {
                return MoveOutcome::Skip;
            }
        }

        let take = take_size(
            msg.data.len(),
            msg.complete,
            msg.no_fragment,
            budget,
            frag_point,
            &self.config,
        );
        if take == 0 {
            return MoveOutcome::Blocked;
        }

        let payload = msg.data.split_to(take).freeze();
        let finishes = msg.complete && msg.data.is_empty();
        let flags = fragment_flags(msg.some_taken, finishes, msg.unordered);
        msg.some_taken = true;
        let send_size = DATA_CHUNK_HEADER_SIZE + take;
        let chunk = DataChunk {
            tsn: self.sending_seq,
            sid,
            ssn: msg.ssn,
            ppid: msg.ppid,
            flags,
            payload,
            send_size,
            book_size: padded(send_size),
            dest: net,
            state: ChunkState::Unsent,
            snd_count: 0,
            sent_at: None,
            do_rtt: false,
            gap_acked: false,
            missing_reports: 0,
            fast_retransmit: false,
            window_probe: false,
            abandon: msg.abandon,
            msg_id: msg.msg_id,
        };
        self.sending_seq = self.sending_seq.wrapping_add(1);
        q.pending_bytes = q.pending_bytes.saturating_sub(take);

        let mut pinned = None;
        if finishes {
            if let Some(done) = q.streams[sid as usize].queue.pop_front() {
                pinned = done.dest;
            }
            q.unlock(sid);
            if q.streams[sid as usize].queue.is_empty() {
                q.wheel.remove(&mut q.streams, sid);
            }
        } else {
            q.locked_on_sending = Some(sid);
        }

        if let Some(pinned) = pinned {
            self.release_dest(pinned);
        }
        trace!(
            "TSN {} assigned: stream {} ssn {} flags {:#04x} len {} -> {:?}",
            chunk.tsn, chunk.sid, chunk.ssn, chunk.flags, take, net
        );
        let book = chunk.book_size;
        self.destinations.acquire(net);
        self.send_queue.push_back(chunk);
        MoveOutcome::Moved {
            book,
            done: finishes,
        }
    }

    /// Moves chunks for `net` until its share of the congestion and peer
    /// windows is queued, servicing streams round robin.
    pub(crate) fn fill_outqueue(&mut self, net: NetId, now: Instant) {
        if !self.usable_for_data(net) {
            return;
        }
        let Some(d) = self.destinations.get(net) else {
            return;
        };
        let frag_point = self.frag_point();
        let queued = self.queued_to(net);
        let usable = self
            .dest_order
            .iter()
            .filter(|n| self.usable_for_data(**n))
            .count()
            .max(1);
        let committed = d.flight_size + queued;
        let room = d.cwnd.saturating_sub(committed);
        let fair = ((self.peers_rwnd as usize + self.total_flight) / usable).saturating_sub(committed);
        let mut goal = room.min(fair);
        if self.total_flight == 0 && queued == 0 {
            // window probe
            goal = goal.max(room.min(frag_point + FILL_SLOP));
        }
        let mut cursor = d.cursor;
        let mut skips = 0;

        while goal > FILL_SLOP {
            let budget = ((goal - FILL_SLOP) & !3).min(frag_point);
            let (sid, locked, members) = {
                let q = lock(&self.queues);
                (
                    q.select_next_stream(cursor),
                    q.locked_on_sending.is_some(),
                    q.wheel.len(),
                )
            };
            let Some(sid) = sid else {
                break;
            };
            match self.move_to_outqueue(net, sid, budget, now) {
                MoveOutcome::Moved { book, .. } => {
                    goal = goal.saturating_sub(book);
                    cursor = Some(sid);
                    skips = 0;
                }
                MoveOutcome::Skip => {
                    skips += 1;
                    if locked || skips >= members {
                        break;
                    }
                    cursor = Some(sid);
                }
                MoveOutcome::Blocked => break,
                MoveOutcome::Discarded | MoveOutcome::Empty => {}
            }
        }

        if let Some(d) = self.destinations.get_mut(net) {
            d.cursor = cursor;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    #[test]
    fn test_take_size_complete_messages() {
        let c = config();
        assert_eq!(take_size(800, true, false, 1200, 1200, &c), 800);
        assert_eq!(take_size(5000, true, false, 1200, 1200, &c), 1200);
        // budget below the split point
        assert_eq!(take_size(5000, true, false, 400, 1200, &c), 0);
        assert_eq!(take_size(5000, true, true, 400, 1200, &c), 0);
    }

    #[test]
    fn test_take_size_incomplete_messages() {
        let c = config();
        // waits for more data instead of emitting it all
        assert_eq!(take_size(1000, false, false, 1452, 1452, &c), 0);
        // residual would be too small
        assert_eq!(take_size(2000, false, false, 1452, 1452, &c), 0);
        assert_eq!(take_size(4000, false, false, 1452, 1452, &c), 1452);

        let mandatory = EngineConfig {
            send_buffer_ceiling: 1000,
            ..config()
        };
        assert_eq!(take_size(1000, false, false, 1452, 1452, &mandatory), 999);
        assert_eq!(take_size(4000, false, false, 300, 1452, &mandatory), 300);
    }

    #[test]
    fn test_fragment_flags() {
        assert_eq!(fragment_flags(false, true, false), DATA_FLAG_NOT_FRAGMENTED);
        assert_eq!(fragment_flags(false, false, false), DATA_FLAG_FIRST);
        assert_eq!(fragment_flags(true, false, false), 0);
        assert_eq!(fragment_flags(true, true, true), DATA_FLAG_LAST | DATA_FLAG_UNORDERED);
    }
}
