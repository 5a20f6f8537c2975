use super::chunk::SCTP_COMMON_HEADER_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use tokio::sync::mpsc;
use tracing::debug;

/// Result of handing one packet to the IP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Ok,
    NoMemory,
    HostUnreachable,
    /// Transient refusal; try again next round.
    Backpressure,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketOptions {
    /// Packet carries ASCONF; keep using the address-reconfiguration source.
    pub asconf: bool,
    /// Sent without a TCB (ABORT / SHUTDOWN-COMPLETE with the T bit).
    pub no_tcb: bool,
    pub data_chunks: usize,
    pub control_chunks: usize,
}

#[derive(Debug, Clone)]
pub struct OutgoingPacket {
    pub dest: SocketAddr,
    pub source: Option<IpAddr>,
    pub payload: Bytes,
    pub opts: PacketOptions,
}

/// The IP-layer collaborator. Gets finished SCTP packets and reports what
/// happened to them.
pub trait PacketSink: Send {
    fn send_packet(
        &mut self,
        dest: SocketAddr,
        source: Option<IpAddr>,
        payload: Bytes,
        opts: PacketOptions,
    ) -> SendStatus;
}

/// Writes the common header in front of `chunks` and fills in the CRC32c.
pub fn assemble(src_port: u16, dst_port: u16, vtag: u32, chunks: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(SCTP_COMMON_HEADER_SIZE + chunks.len());

    // Common Header
    buf.put_u16(src_port);
    buf.put_u16(dst_port);
    buf.put_u32(vtag);
    buf.put_u32(0); // Checksum placeholder
    buf.put_slice(chunks);

    let checksum = crc32c::crc32c(&buf);
    buf[8..12].copy_from_slice(&checksum.to_le_bytes());
    buf.freeze()
}

/// Checks the CRC32c of a finished packet without copying it.
pub fn verify_checksum(packet: &[u8]) -> bool {
    if packet.len() < SCTP_COMMON_HEADER_SIZE {
        return false;
    }
    let received = (&packet[8..12]).get_u32_le();
    let crc = crc32c::crc32c(&packet[..8]);
    let crc = crc32c::crc32c_append(crc, &[0u8; 4]);
    crc32c::crc32c_append(crc, &packet[12..]) == received
}

/// Forwards packets to a transport task over an unbounded channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<OutgoingPacket>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutgoingPacket>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PacketSink for ChannelSink {
    fn send_packet(
        &mut self,
        dest: SocketAddr,
        source: Option<IpAddr>,
        payload: Bytes,
        opts: PacketOptions,
    ) -> SendStatus {
        let packet = OutgoingPacket {
            dest,
            source,
            payload,
            opts,
        };
        if self.tx.send(packet).is_err() {
            debug!("Failed to send SCTP packet to transport: channel closed");
            return SendStatus::NoMemory;
        }
        SendStatus::Ok
    }
}

/// In-memory sink that keeps every accepted packet. Statuses can be scripted
/// per destination (sticky) or for the next few sends (one shot).
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub packets: Vec<OutgoingPacket>,
    pub per_dest: HashMap<SocketAddr, SendStatus>,
    pub next: VecDeque<SendStatus>,
    pub refused: usize,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_dest(&mut self, dest: SocketAddr, status: SendStatus) {
        self.per_dest.insert(dest, status);
    }

    pub fn packets_to(&self, dest: SocketAddr) -> impl Iterator<Item = &OutgoingPacket> {
        self.packets.iter().filter(move |p| p.dest == dest)
    }

    pub fn clear(&mut self) {
        self.packets.clear();
    }
}

impl PacketSink for RecordingSink {
    fn send_packet(
        &mut self,
        dest: SocketAddr,
        source: Option<IpAddr>,
        payload: Bytes,
        opts: PacketOptions,
    ) -> SendStatus {
        let status = self
            .next
            .pop_front()
            .or_else(|| self.per_dest.get(&dest).copied())
            .unwrap_or(SendStatus::Ok);
        if status != SendStatus::Ok {
            self.refused += 1;
            return status;
        }
        self.packets.push(OutgoingPacket {
            dest,
            source,
            payload,
            opts,
        });
        SendStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transports::sctp::chunk::{CT_COOKIE_ACK, RawChunk, encode_chunk};

    #[test]
    fn test_checksum_validation() {
        let mut chunks = BytesMut::new();
        encode_chunk(CT_COOKIE_ACK, 0, &[], &mut chunks);
        let packet = assemble(5000, 5001, 0xdead_beef, &chunks);

        assert_eq!(packet.len(), 16);
        assert_eq!(&packet[0..2], &5000u16.to_be_bytes());
        assert_eq!(&packet[4..8], &0xdead_beefu32.to_be_bytes());
        assert!(verify_checksum(&packet));

        let mut corrupt = packet.to_vec();
        corrupt[13] ^= 0xff;
        assert!(!verify_checksum(&corrupt));

        let parsed = RawChunk::parse_all(packet.slice(12..)).unwrap();
        assert_eq!(parsed[0].kind, CT_COOKIE_ACK);
    }

    #[tokio::test]
    async fn test_channel_sink_forwards_packets() {
        let (mut sink, mut rx) = ChannelSink::new();
        let dest: SocketAddr = "192.0.2.1:5000".parse().unwrap();
        let status = sink.send_packet(
            dest,
            None,
            Bytes::from_static(b"pkt"),
            PacketOptions::default(),
        );
        assert_eq!(status, SendStatus::Ok);
        let packet = rx.recv().await.unwrap();
        assert_eq!(packet.dest, dest);

        drop(rx);
        let status = sink.send_packet(dest, None, Bytes::new(), PacketOptions::default());
        assert_eq!(status, SendStatus::NoMemory);
    }

    #[test]
    fn test_recording_sink_scripted_failures() {
        let mut sink = RecordingSink::new();
        let a: SocketAddr = "192.0.2.1:5000".parse().unwrap();
        let b: SocketAddr = "192.0.2.2:5000".parse().unwrap();
        sink.fail_dest(a, SendStatus::HostUnreachable);
        sink.next.push_back(SendStatus::Backpressure);

        let opts = PacketOptions::default();
        assert_eq!(sink.send_packet(b, None, Bytes::new(), opts), SendStatus::Backpressure);
        assert_eq!(sink.send_packet(b, None, Bytes::new(), opts), SendStatus::Ok);
        assert_eq!(
            sink.send_packet(a, None, Bytes::new(), opts),
            SendStatus::HostUnreachable
        );
        assert_eq!(sink.packets.len(), 1);
        assert_eq!(sink.refused, 2);
    }
}
