pub mod sctp;
pub mod source;

use async_trait::async_trait;
use sctp::OutgoingPacket;
use source::LocalAddress;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Carries finished SCTP packets onto the wire.
#[async_trait]
pub trait PacketTransport: Send + Sync {
    async fn transmit(&self, packet: OutgoingPacket) -> anyhow::Result<()>;
}

/// SCTP over UDP encapsulation: every destination address is reached on
/// `remote_port`, regardless of the SCTP port carried inside.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    remote_port: u16,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>, remote_port: u16) -> Self {
        Self {
            socket,
            remote_port,
        }
    }

    pub async fn bind(local: SocketAddr, remote_port: u16) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        debug!("UDP encapsulation bound on {}", socket.local_addr()?);
        Ok(Self::new(Arc::new(socket), remote_port))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl PacketTransport for UdpTransport {
    async fn transmit(&self, packet: OutgoingPacket) -> anyhow::Result<()> {
        let target = SocketAddr::new(packet.dest.ip(), self.remote_port);
        let n = self.socket.send_to(&packet.payload, target).await?;
        trace!("sent {} byte SCTP packet to {}", n, target);
        Ok(())
    }
}

/// Drains a packet channel into `transport` until every sender is gone.
/// Returns the number of packets that went out.
pub async fn pump_packets(
    mut rx: mpsc::UnboundedReceiver<OutgoingPacket>,
    transport: Arc<dyn PacketTransport>,
) -> usize {
    let mut sent = 0;
    while let Some(packet) = rx.recv().await {
        let dest = packet.dest;
        match transport.transmit(packet).await {
            Ok(()) => sent += 1,
            Err(e) => warn!("dropping packet to {}: {}", dest, e),
        }
    }
    debug!("packet pump finished after {} packets", sent);
    sent
}

/// Every usable local address, ranked by `interface_priority`. Loopback
/// addresses are kept, at the bottom, so a wildcard binding can still talk
/// to a peer on the same host.
pub fn local_addresses() -> anyhow::Result<Vec<LocalAddress>> {
    use network_interface::{NetworkInterface, NetworkInterfaceConfig};
    let interfaces = NetworkInterface::show()?;
    let mut addrs = Vec::new();
    for interface in interfaces.iter() {
        for addr in &interface.addr {
            let ip = match addr {
                network_interface::Addr::V4(v4) => IpAddr::V4(v4.ip),
                network_interface::Addr::V6(v6) => IpAddr::V6(v6.ip),
            };
            let priority = interface_priority(&interface.name, &ip);
            addrs.push(LocalAddress {
                ip,
                interface: interface.name.clone(),
                priority,
            });
        }
    }
    if addrs.is_empty() {
        return Err(anyhow::anyhow!("No local addresses found"));
    }
    addrs.sort_by(|a, b| b.priority.cmp(&a.priority));
    for a in &addrs {
        trace!("local address {} on {} (score {})", a.ip, a.interface, a.priority);
    }
    Ok(addrs)
}

fn interface_priority(name: &str, ip: &IpAddr) -> i32 {
    if ip.is_loopback() {
        return -1000;
    }
    let mut score = 0;

    // physical first, tunnels and bridges last
    if name.starts_with("en") || name.starts_with("wlan") || name.starts_with("eth") {
        score += 100;
    } else if name.starts_with("utun")
        || name.starts_with("bridge")
        || name.starts_with("gif")
        || name.starts_with("stf")
        || name.starts_with("awdl")
        || name.starts_with("llw")
    {
        score -= 50;
    }

    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            if octets[0] == 169 && octets[1] == 254 {
                score -= 100;
            } else if v4.is_private() {
                score += 40;
            }
        }
        IpAddr::V6(v6) => {
            if v6.segments()[0] & 0xffc0 == 0xfe80 {
                score -= 100;
            }
            score -= 10;
        }
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transports::sctp::PacketOptions;
    use bytes::Bytes;

    #[test]
    fn test_interface_priority_ordering() {
        let eth: IpAddr = "192.168.1.20".parse().unwrap();
        let tun: IpAddr = "10.8.0.2".parse().unwrap();
        let ll: IpAddr = "169.254.9.9".parse().unwrap();
        let lo: IpAddr = "127.0.0.1".parse().unwrap();
        let v6: IpAddr = "2001:db8::5".parse().unwrap();
        assert!(interface_priority("eth0", &eth) > interface_priority("utun3", &tun));
        assert!(interface_priority("utun3", &tun) > interface_priority("eth1", &ll));
        assert!(interface_priority("eth0", &v6) < interface_priority("eth0", &eth));
        assert_eq!(interface_priority("lo", &lo), -1000);
    }

    #[tokio::test]
    async fn test_udp_transport_delivers() -> anyhow::Result<()> {
        let receiver = UdpSocket::bind("127.0.0.1:0").await?;
        let port = receiver.local_addr()?.port();
        let transport = UdpTransport::bind("127.0.0.1:0".parse()?, port).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump_packets(rx, Arc::new(transport)));
        tx.send(OutgoingPacket {
            // the SCTP port is irrelevant to the encapsulation
            dest: "127.0.0.1:5000".parse()?,
            source: None,
            payload: Bytes::from_static(b"sctp"),
            opts: PacketOptions::default(),
        })?;
        drop(tx);

        let mut buf = [0u8; 64];
        let (n, _) = receiver.recv_from(&mut buf).await?;
        assert_eq!(&buf[..n], b"sctp");
        assert_eq!(pump.await?, 1);
        Ok(())
    }
}
