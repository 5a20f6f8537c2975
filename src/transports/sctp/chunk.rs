use super::arena::Handle;
use crate::error::{SctpError, SctpResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Instant;

pub type NetId = Handle;

// SCTP Constants
pub const SCTP_COMMON_HEADER_SIZE: usize = 12;
pub const CHUNK_HEADER_SIZE: usize = 4;
pub const DATA_CHUNK_HEADER_SIZE: usize = 16;
pub const IPV4_HEADER_SIZE: usize = 20;
pub const IPV6_HEADER_SIZE: usize = 40;
pub const SACK_FIXED_SIZE: usize = CHUNK_HEADER_SIZE + 12;
pub const NR_SACK_FIXED_SIZE: usize = CHUNK_HEADER_SIZE + 16;
/// Upper bound for a PACKET-DROPPED report body.
pub const MAX_DROPPED_REPORT: usize = 2048;

// Chunk Types
pub const CT_DATA: u8 = 0;
pub const CT_INIT: u8 = 1;
pub const CT_INIT_ACK: u8 = 2;
pub const CT_SACK: u8 = 3;
pub const CT_HEARTBEAT: u8 = 4;
pub const CT_HEARTBEAT_ACK: u8 = 5;
pub const CT_ABORT: u8 = 6;
pub const CT_SHUTDOWN: u8 = 7;
pub const CT_SHUTDOWN_ACK: u8 = 8;
pub const CT_ERROR: u8 = 9;
pub const CT_COOKIE_ECHO: u8 = 10;
pub const CT_COOKIE_ACK: u8 = 11;
pub const CT_ECN_ECHO: u8 = 12;
pub const CT_CWR: u8 = 13;
pub const CT_SHUTDOWN_COMPLETE: u8 = 14;
pub const CT_AUTH: u8 = 15;
pub const CT_NR_SACK: u8 = 0x10;
pub const CT_ASCONF_ACK: u8 = 0x80;
pub const CT_PACKET_DROPPED: u8 = 0x81;
pub const CT_RECONFIG: u8 = 130;
pub const CT_FORWARD_TSN: u8 = 192;
pub const CT_ASCONF: u8 = 0xC1;

// DATA chunk flags
pub const DATA_FLAG_LAST: u8 = 0x01;
pub const DATA_FLAG_FIRST: u8 = 0x02;
pub const DATA_FLAG_NOT_FRAGMENTED: u8 = DATA_FLAG_FIRST | DATA_FLAG_LAST;
pub const DATA_FLAG_UNORDERED: u8 = 0x04;

// Control chunk flags
pub const ABORT_FLAG_NO_TCB: u8 = 0x01;
pub const SHUTDOWN_COMPLETE_FLAG_NO_TCB: u8 = 0x01;
pub const PKTDROP_FLAG_BAD_CRC: u8 = 0x02;
pub const PKTDROP_FLAG_TRUNCATED: u8 = 0x04;

pub fn padding(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

pub fn padded(len: usize) -> usize {
    len + padding(len)
}

/// Serial number arithmetic, RFC 1982 style.
pub fn tsn_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

pub fn tsn_lte(a: u32, b: u32) -> bool {
    a == b || tsn_lt(a, b)
}

pub fn tsn_gt(a: u32, b: u32) -> bool {
    tsn_lt(b, a)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Unsent,
    Sent,
    Resend,
    /// PR-SCTP abandoned; reported to the peer through FORWARD-TSN.
    Abandoned,
}

/// When a chunk may be given up instead of delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonRule {
    Never,
    Deadline(Instant),
    Retransmits(u32),
    /// Lower value means more important.
    Priority(u32),
}

impl AbandonRule {
    pub fn is_reliable(&self) -> bool {
        matches!(self, AbandonRule::Never)
    }
}

#[derive(Debug, Clone)]
pub struct DataChunk {
    pub tsn: u32,
    pub sid: u16,
    pub ssn: u16,
    pub ppid: u32,
    pub flags: u8,
    pub payload: Bytes,
    /// Chunk length on the wire without padding.
    pub send_size: usize,
    /// Padded wire length, the unit of flight accounting.
    pub book_size: usize,
    pub dest: NetId,
    pub state: ChunkState,
    pub snd_count: u32,
    pub sent_at: Option<Instant>,
    pub do_rtt: bool,
    pub gap_acked: bool,
    pub missing_reports: u8,
    pub fast_retransmit: bool,
    pub window_probe: bool,
    pub abandon: AbandonRule,
    /// Groups the fragments of one application message.
    pub msg_id: u64,
}

impl DataChunk {
    pub fn unordered(&self) -> bool {
        self.flags & DATA_FLAG_UNORDERED != 0
    }

    pub fn is_last_fragment(&self) -> bool {
        self.flags & DATA_FLAG_LAST != 0
    }

    /// Counts toward flight size: sent and neither acked nor marked for resend.
    pub fn in_flight(&self) -> bool {
        self.state == ChunkState::Sent && !self.gap_acked
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(CT_DATA);
        buf.put_u8(self.flags);
        buf.put_u16(self.send_size as u16);
        buf.put_u32(self.tsn);
        buf.put_u16(self.sid);
        buf.put_u16(self.ssn);
        buf.put_u32(self.ppid);
        buf.put_slice(&self.payload);
        buf.put_bytes(0, padding(self.send_size));
    }
}

#[derive(Debug, Clone)]
pub struct ControlChunk {
    pub kind: u8,
    pub flags: u8,
    /// Chunk value without the 4 byte header.
    pub body: Bytes,
    pub dest: NetId,
    pub state: ChunkState,
    pub snd_count: u32,
    pub sent_at: Option<Instant>,
    /// Request sequence or serial this chunk answers to, when it has one.
    pub seq: Option<u32>,
}

impl ControlChunk {
    pub fn new(kind: u8, flags: u8, body: Bytes, dest: NetId) -> Self {
        Self {
            kind,
            flags,
            body,
            dest,
            state: ChunkState::Unsent,
            snd_count: 0,
            sent_at: None,
            seq: None,
        }
    }

    pub fn send_size(&self) -> usize {
        CHUNK_HEADER_SIZE + self.body.len()
    }

    pub fn book_size(&self) -> usize {
        padded(self.send_size())
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        encode_chunk(self.kind, self.flags, &self.body, buf);
    }

    /// Chunks that stay queued after transmission until answered.
    pub fn is_timed(&self) -> bool {
        matches!(
            self.kind,
            CT_COOKIE_ECHO | CT_ASCONF | CT_FORWARD_TSN | CT_ECN_ECHO
        ) || (self.kind == CT_RECONFIG && self.seq.is_some())
    }
}

pub fn encode_chunk(kind: u8, flags: u8, body: &[u8], buf: &mut BytesMut) {
    let len = CHUNK_HEADER_SIZE + body.len();
    buf.put_u8(kind);
    buf.put_u8(flags);
    buf.put_u16(len as u16);
    buf.put_slice(body);
    buf.put_bytes(0, padding(len));
}

/// A chunk as read back from a finished packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChunk {
    pub kind: u8,
    pub flags: u8,
    pub body: Bytes,
}

impl RawChunk {
    /// Splits the chunk section of a packet (everything after the common header).
    pub fn parse_all(mut buf: Bytes) -> SctpResult<Vec<RawChunk>> {
        let mut chunks = Vec::new();
        while buf.remaining() >= CHUNK_HEADER_SIZE {
            let kind = buf.get_u8();
            let flags = buf.get_u8();
            let len = buf.get_u16() as usize;
            if len < CHUNK_HEADER_SIZE || buf.remaining() < len - CHUNK_HEADER_SIZE {
                return Err(SctpError::MalformedChunk { kind, len });
            }
            let body = buf.split_to(len - CHUNK_HEADER_SIZE);
            let pad = padding(len).min(buf.remaining());
            buf.advance(pad);
            chunks.push(RawChunk { kind, flags, body });
        }
        Ok(chunks)
    }

    pub fn data(&self) -> Option<DataView> {
        if self.kind != CT_DATA || self.body.len() < 12 {
            return None;
        }
        let mut b = self.body.clone();
        Some(DataView {
            flags: self.flags,
            tsn: b.get_u32(),
            sid: b.get_u16(),
            ssn: b.get_u16(),
            ppid: b.get_u32(),
            payload: b,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DataView {
    pub flags: u8,
    pub tsn: u32,
    pub sid: u16,
    pub ssn: u16,
    pub ppid: u32,
    pub payload: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transports::sctp::arena::Arena;

    #[test]
    fn test_tsn_serial_compare_wraps() {
        assert!(tsn_lt(1, 2));
        assert!(tsn_lt(u32::MAX, 0));
        assert!(tsn_gt(3, u32::MAX - 2));
        assert!(tsn_lte(5, 5));
    }

    #[test]
    fn test_data_chunk_encoding_is_padded() {
        let mut arena = Arena::new();
        let net = arena.insert(());
        let chunk = DataChunk {
            tsn: 42,
            sid: 3,
            ssn: 9,
            ppid: 51,
            flags: DATA_FLAG_NOT_FRAGMENTED,
            payload: Bytes::from_static(b"hello"),
            send_size: DATA_CHUNK_HEADER_SIZE + 5,
            book_size: padded(DATA_CHUNK_HEADER_SIZE + 5),
            dest: net,
            state: ChunkState::Unsent,
            snd_count: 0,
            sent_at: None,
            do_rtt: false,
            gap_acked: false,
            missing_reports: 0,
            fast_retransmit: false,
            window_probe: false,
            abandon: AbandonRule::Never,
            msg_id: 1,
        };
        let mut buf = BytesMut::new();
        chunk.encode(&mut buf);
        assert_eq!(buf.len(), 24);
        assert_eq!(&buf[2..4], &21u16.to_be_bytes());

        let parsed = RawChunk::parse_all(buf.freeze()).unwrap();
        assert_eq!(parsed.len(), 1);
        let data = parsed[0].data().unwrap();
        assert_eq!(data.tsn, 42);
        assert_eq!(data.sid, 3);
        assert_eq!(data.ssn, 9);
        assert_eq!(&data.payload[..], b"hello");
    }

    #[test]
    fn test_truncated_chunk_is_malformed() {
        let mut buf = BytesMut::new();
        encode_chunk(CT_HEARTBEAT, 0, &[1, 2, 3, 4, 5, 6, 7, 8], &mut buf);
        let short = buf.freeze().slice(..8);
        assert_eq!(
            RawChunk::parse_all(short),
            Err(SctpError::MalformedChunk { kind: CT_HEARTBEAT, len: 12 })
        );

        // declared length shorter than the header itself
        let bogus = Bytes::from_static(&[CT_DATA, 0, 0, 2]);
        assert_eq!(
            RawChunk::parse_all(bogus),
            Err(SctpError::MalformedChunk { kind: CT_DATA, len: 2 })
        );
    }
}
