use super::chunk::{AbandonRule, NetId};
use super::wheel::{RingLink, Wheel};
use crate::error::{SctpError, SctpResult};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Partial reliability requested for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrPolicy {
    #[default]
    Reliable,
    /// Abandon once the message has been queued this long.
    Ttl(Duration),
    /// Abandon after this many retransmissions.
    Rtx(u32),
    /// Abandon under buffer pressure from a message of equal or higher priority.
    Buf(u32),
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub ppid: u32,
    pub unordered: bool,
    pub pr_policy: PrPolicy,
    /// Ends the record in explicit end-of-record mode.
    pub eor: bool,
    pub destination: Option<NetId>,
    pub no_fragment: bool,
}

#[derive(Debug)]
pub struct PendingMessage {
    pub msg_id: u64,
    pub sid: u16,
    pub ssn: u16,
    pub ppid: u32,
    pub unordered: bool,
    pub no_fragment: bool,
    /// Bytes not yet moved into chunks.
    pub data: BytesMut,
    pub complete: bool,
    pub some_taken: bool,
    /// Abandoned mid-fragmentation; the rest is dropped on the next move.
    pub discard_rest: bool,
    /// A send is still copying the rest of this message in.
    pub copying: bool,
    pub abandon: AbandonRule,
    pub dest: Option<NetId>,
    pub queued_at: Instant,
}

impl PendingMessage {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// How one append relates to the stream's unfinished tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendMode {
    /// Closes the message.
    pub complete: bool,
    /// More pieces of the same send follow.
    pub copying: bool,
    /// Message an earlier piece of the same send created or extended.
    pub continues: Option<u64>,
}

impl AppendMode {
    /// A send that hands over all of its bytes at once.
    pub fn whole(complete: bool) -> Self {
        Self {
            complete,
            copying: false,
            continues: None,
        }
    }
}

#[derive(Debug)]
pub struct OutStream {
    pub sid: u16,
    pub next_ssn: u16,
    pub queue: VecDeque<PendingMessage>,
    pub(crate) link: RingLink,
}

impl OutStream {
    pub fn new(sid: u16) -> Self {
        Self {
            sid,
            next_ssn: 0,
            queue: VecDeque::new(),
            link: RingLink::default(),
        }
    }
}

/// Everything guarded by the send-queue lock: per stream message queues, the
/// wheel and the send buffer accounting.
#[derive(Debug)]
pub struct SendQueues {
    pub streams: Vec<OutStream>,
    pub wheel: Wheel,
    /// Stream whose message is partially moved; nothing else may interleave.
    pub locked_on_sending: Option<u16>,
    /// Stream holding an unfinished explicit-EOR record.
    pub open_record: Option<u16>,
    /// Payload bytes queued in streams, in the send queue and sent but unacked.
    pub total_output_queue_size: usize,
    /// Payload bytes still sitting in stream queues.
    pub pending_bytes: usize,
    next_msg_id: u64,
}

impl SendQueues {
    pub fn new(streams: u16) -> Self {
        Self {
            streams: (0..streams).map(OutStream::new).collect(),
            wheel: Wheel::default(),
            locked_on_sending: None,
            open_record: None,
            total_output_queue_size: 0,
            pending_bytes: 0,
            next_msg_id: 1,
        }
    }

    pub fn stream_count(&self) -> u16 {
        self.streams.len() as u16
    }

    pub fn check_stream(&self, sid: u16) -> SctpResult<()> {
        if sid as usize >= self.streams.len() {
            return Err(SctpError::InvalidStream {
                sid,
                streams: self.stream_count(),
            });
        }
        match self.open_record {
            Some(open) if open != sid => Err(SctpError::StreamLocked(open)),
            _ => Ok(()),
        }
    }

    /// Queues `data` on `sid`. An unfinished tail is extended when it is an
    /// open explicit-EOR record or the message this send is copying; a tail
    /// another send is still copying locks the stream. Returns the message id
    /// and whether a new message was created.
    pub fn append(
        &mut self,
        sid: u16,
        data: Bytes,
        opts: &SendOptions,
        mode: AppendMode,
        abandon: AbandonRule,
        now: Instant,
    ) -> SctpResult<(u64, bool)> {
        self.check_stream(sid)?;
        let len = data.len();
        let stream = &mut self.streams[sid as usize];

        let tail = stream
            .queue
            .back()
            .filter(|m| !m.complete)
            .map(|m| (m.msg_id, m.copying));
        let appended = match (tail, mode.continues) {
            (Some((id, true)), cont) if cont != Some(id) => {
                return Err(SctpError::StreamLocked(sid));
            }
            (Some((id, _)), cont) if cont.is_none_or(|c| c == id) => {
                if let Some(tail) = stream.queue.back_mut() {
                    tail.data.extend_from_slice(&data);
                    tail.complete = mode.complete;
                    tail.copying = mode.copying;
                }
                (id, false)
            }
            (_, Some(_)) => return Err(SctpError::MessageAbandoned),
            _ => {
                let ssn = if opts.unordered {
                    0
                } else {
                    let ssn = stream.next_ssn;
                    stream.next_ssn = stream.next_ssn.wrapping_add(1);
                    ssn
                };
                let msg_id = self.next_msg_id;
                self.next_msg_id += 1;
                stream.queue.push_back(PendingMessage {
                    msg_id,
                    sid,
                    ssn,
                    ppid: opts.ppid,
                    unordered: opts.unordered,
                    no_fragment: opts.no_fragment,
                    data: BytesMut::from(&data[..]),
                    complete: mode.complete,
                    some_taken: false,
                    discard_rest: false,
                    copying: mode.copying,
                    abandon,
                    dest: opts.destination,
                    queued_at: now,
                });
                (msg_id, true)
            }
        };

        self.open_record = if mode.complete { None } else { Some(sid) };
        self.total_output_queue_size += len;
        self.pending_bytes += len;
        self.wheel.insert(&mut self.streams, sid);
        Ok(appended)
    }

    /// Removes an unfinished message nothing has been fragmented from, as if
    /// it had never been queued. Returns it when it was found.
    pub fn withdraw(&mut self, sid: u16, msg_id: u64) -> Option<PendingMessage> {
        let stream = self.streams.get_mut(sid as usize)?;
        let pos = stream
            .queue
            .iter()
            .position(|m| m.msg_id == msg_id && !m.some_taken && !m.complete)?;
        let msg = stream.queue.remove(pos)?;
        if !msg.unordered && pos == stream.queue.len() && stream.next_ssn == msg.ssn.wrapping_add(1) {
            stream.next_ssn = msg.ssn;
        }
        let released = msg.len();
        self.pending_bytes = self.pending_bytes.saturating_sub(released);
        self.retire(released);
        if self.open_record == Some(sid) {
            self.open_record = None;
        }
        if self.streams[sid as usize].queue.is_empty() {
            self.wheel.remove(&mut self.streams, sid);
            self.unlock(sid);
        }
        Some(msg)
    }

    /// Stream to service next for a destination whose cursor is `cursor`.
    pub fn select_next_stream(&self, cursor: Option<u16>) -> Option<u16> {
        if let Some(locked) = self.locked_on_sending {
            return Some(locked);
        }
        self.wheel.next_after(&self.streams, cursor)
    }

    pub fn unlock(&mut self, sid: u16) {
        if self.locked_on_sending == Some(sid) {
            self.locked_on_sending = None;
        }
    }

    pub fn retire(&mut self, bytes: usize) {
        debug_assert!(self.total_output_queue_size >= bytes);
        self.total_output_queue_size = self.total_output_queue_size.saturating_sub(bytes);
    }

    /// Outgoing stream reset: sequence numbers restart at zero.
    pub fn reset_sequences(&mut self, sids: &[u16]) {
        if sids.is_empty() {
            self.streams.iter_mut().for_each(|s| s.next_ssn = 0);
            return;
        }
        for &sid in sids {
            if let Some(stream) = self.streams.get_mut(sid as usize) {
                stream.next_ssn = 0;
            }
        }
    }

    /// Drops every queued message and releases its bytes.
    pub fn clear(&mut self) -> Vec<PendingMessage> {
        let mut dropped = Vec::new();
        for sid in 0..self.streams.len() {
            self.wheel.remove(&mut self.streams, sid as u16);
            dropped.extend(self.streams[sid].queue.drain(..));
        }
        let released: usize = dropped.iter().map(|m| m.len()).sum();
        self.pending_bytes = self.pending_bytes.saturating_sub(released);
        self.retire(released);
        self.locked_on_sending = None;
        self.open_record = None;
        dropped
    }
}
