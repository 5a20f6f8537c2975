pub mod config;
pub mod error;
pub mod transports;

pub use config::{EngineConfig, EngineConfigBuilder};
pub use error::{SctpError, SctpResult};
pub use transports::sctp::{
    AckOutcome, AssocState, Association, AssociationParams, ChannelSink, NetId, OutgoingPacket,
    PacketOptions, PacketSink, PrPolicy, ReachState, RecordingSink, SctpAssociation, SendOptions,
    SendReason, SendStatus,
};
pub use transports::source::{Binding, LocalAddress, SourceSelector};
pub use transports::{PacketTransport, UdpTransport, local_addresses, pump_packets};
