use thiserror::Error;

pub type SctpResult<T> = Result<T, SctpError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SctpError {
    #[error("stream {sid} is not open (association has {streams} outbound streams)")]
    InvalidStream { sid: u16, streams: u16 },
    #[error("message of {len} bytes exceeds fragmentation point {limit}")]
    MessageTooLarge { len: usize, limit: usize },
    #[error("association is shutting down")]
    ShuttingDown,
    #[error("an incomplete record on stream {0} must be finished first")]
    StreamLocked(u16),
    #[error("send buffer full")]
    WouldBlock,
    #[error("association aborted")]
    Aborted,
    #[error("TSN {tsn} exceeded the retransmission limit")]
    RetransmitLimit { tsn: u32 },
    #[error("no buffer space available")]
    NoMemory,
    #[error("no local address with acceptable scope for {0}")]
    NoSourceAddress(std::net::IpAddr),
    #[error("unknown destination")]
    UnknownDestination,
    #[error("a stream reset request is already outstanding")]
    ResetInProgress,
    #[error("invalid stream reset request")]
    InvalidResetRequest,
    #[error("message was abandoned before it was fully queued")]
    MessageAbandoned,
    #[error("malformed chunk of type {kind} (length {len})")]
    MalformedChunk { kind: u8, len: usize },
}

impl SctpError {
    /// Errors after which the association is gone.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SctpError::Aborted | SctpError::RetransmitLimit { .. })
    }
}
