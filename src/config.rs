use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables consumed by the transmission engine of one association.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum number of DATA chunks bundled into one packet.
    pub max_bundling: usize,
    /// Per-chunk retransmission ceiling. Exceeding it aborts the association.
    pub max_retransmits: u32,
    /// Consecutive errors before a destination is considered unreachable.
    pub path_max_retransmits: u32,
    /// Small-packet avoidance while data is in flight.
    pub nagle: bool,
    /// Abandon PR-SCTP eligible chunks when the send buffer is full.
    pub prsctp_drain: bool,
    /// Build NR-SACK instead of SACK when the peer supports it.
    pub nr_sack: bool,
    /// Packets per destination per output round.
    pub max_burst: usize,
    /// Bytes queued plus bytes in flight before application senders block.
    pub send_buffer_ceiling: usize,
    /// Large sends are copied in pieces of at least this many bytes.
    pub add_more_threshold: usize,
    /// Messages end only when the application says so.
    pub explicit_eor: bool,
    pub min_split_point: usize,
    pub min_residual: usize,
    /// Sender side silly window threshold.
    pub sws_sender: u32,
    /// Bookkeeping charged against the peer window for every chunk.
    pub peer_chunk_overhead: u32,
    pub rto_initial: Duration,
    pub rto_min: Duration,
    pub rto_max: Duration,
    /// Allow private source addresses for global destinations.
    pub nat_friendly: bool,
    pub default_mtu: usize,
    pub receive_buffer: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_bundling: 256,
            max_retransmits: 10,
            path_max_retransmits: 5,
            nagle: true,
            prsctp_drain: true,
            nr_sack: false,
            max_burst: 4,
            send_buffer_ceiling: 4 * 1024 * 1024,
            add_more_threshold: 1452,
            explicit_eor: false,
            min_split_point: 2904,
            min_residual: 1452,
            sws_sender: 1420,
            peer_chunk_overhead: 256,
            rto_initial: Duration::from_secs(1),
            rto_min: Duration::from_millis(200),
            rto_max: Duration::from_secs(60),
            nat_friendly: true,
            default_mtu: 1500,
            receive_buffer: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    inner: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_bundling(mut self, chunks: usize) -> Self {
        self.inner.max_bundling = chunks;
        self
    }

    pub fn max_retransmits(mut self, count: u32) -> Self {
        self.inner.max_retransmits = count;
        self
    }

    pub fn path_max_retransmits(mut self, count: u32) -> Self {
        self.inner.path_max_retransmits = count;
        self
    }

    pub fn nagle(mut self, enabled: bool) -> Self {
        self.inner.nagle = enabled;
        self
    }

    pub fn prsctp_drain(mut self, enabled: bool) -> Self {
        self.inner.prsctp_drain = enabled;
        self
    }

    pub fn nr_sack(mut self, enabled: bool) -> Self {
        self.inner.nr_sack = enabled;
        self
    }

    pub fn max_burst(mut self, packets: usize) -> Self {
        self.inner.max_burst = packets;
        self
    }

    pub fn send_buffer_ceiling(mut self, bytes: usize) -> Self {
        self.inner.send_buffer_ceiling = bytes;
        self
    }

    pub fn add_more_threshold(mut self, bytes: usize) -> Self {
        self.inner.add_more_threshold = bytes;
        self
    }

    pub fn explicit_eor(mut self, enabled: bool) -> Self {
        self.inner.explicit_eor = enabled;
        self
    }

    pub fn split_thresholds(mut self, min_split_point: usize, min_residual: usize) -> Self {
        self.inner.min_split_point = min_split_point;
        self.inner.min_residual = min_residual;
        self
    }

    pub fn sws_sender(mut self, bytes: u32) -> Self {
        self.inner.sws_sender = bytes;
        self
    }

    pub fn peer_chunk_overhead(mut self, bytes: u32) -> Self {
        self.inner.peer_chunk_overhead = bytes;
        self
    }

    pub fn rto(mut self, initial: Duration, min: Duration, max: Duration) -> Self {
        self.inner.rto_initial = initial;
        self.inner.rto_min = min;
        self.inner.rto_max = max;
        self
    }

    pub fn nat_friendly(mut self, enabled: bool) -> Self {
        self.inner.nat_friendly = enabled;
        self
    }

    pub fn default_mtu(mut self, mtu: usize) -> Self {
        self.inner.default_mtu = mtu;
        self
    }

    pub fn receive_buffer(mut self, bytes: u32) -> Self {
        self.inner.receive_buffer = bytes;
        self
    }

    pub fn build(self) -> EngineConfig {
        self.inner
    }
}

impl From<EngineConfigBuilder> for EngineConfig {
    fn from(builder: EngineConfigBuilder) -> Self {
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_bundling, 256);
        assert_eq!(config.max_retransmits, 10);
        assert_eq!(config.max_burst, 4);
        assert_eq!(config.add_more_threshold, 1452);
        assert_eq!(config.rto_initial, Duration::from_secs(1));
        assert_eq!(config.rto_min, Duration::from_millis(200));
        assert!(config.nagle);
        assert!(!config.nr_sack);
    }

    #[test]
    fn test_engine_config_builder() {
        let config = EngineConfigBuilder::new()
            .nagle(false)
            .max_burst(8)
            .split_thresholds(1000, 500)
            .build();
        assert!(!config.nagle);
        assert_eq!(config.max_burst, 8);
        assert_eq!(config.min_split_point, 1000);
        assert_eq!(config.min_residual, 500);
        // untouched fields keep their defaults
        assert_eq!(config.send_buffer_ceiling, 4 * 1024 * 1024);
    }

    #[test]
    fn test_engine_config_json() {
        let config: EngineConfig = EngineConfigBuilder::new().nr_sack(true).into();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
