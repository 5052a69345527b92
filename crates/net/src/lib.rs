pub mod protocol;
pub mod reliability;
pub mod session;
pub mod wire;

pub use protocol::{
    decode_tcp_header, decode_udp_datagram, encode_tcp_message, encode_udp_datagram, scramble,
    sequence_greater_than, AckBitField, FrameError, Message, MessageType, PacketSequence,
    ReliabilitySegment, ScrambleSecrets, TcpFrameHeader, UdpDatagram, ACK_BITFIELD_SIZE,
    DEFAULT_PORT, DEFAULT_SESSION_SIZE, DEFAULT_TICK_RATE, MAX_TCP_PAYLOAD_SIZE,
    MAX_UDP_DATAGRAM_SIZE, TCP_HEADER_SIZE,
};
pub use reliability::{
    AckObserver, AckSample, CongestionConfig, CongestionContext, CongestionObserver,
    ReliabilityContext, ReliabilityNotifiers, RoundTripContext, SendObserver,
};
pub use session::{
    ClientId, ReadyCheckOutcome, Session, SessionStartPlan, SyncPingOutcome, INVALID_SLOT,
    MAX_SYNC_PINGS,
};
pub use wire::{WireError, WireReader, WireWriter};
