use glam::Vec3;
use thiserror::Error;

use crate::wire::{WireError, WireReader, WireWriter};

pub const DEFAULT_PORT: u16 = 20000;
pub const DEFAULT_TICK_RATE: u32 = 60;
pub const DEFAULT_SESSION_SIZE: u16 = 2;

/// Hard cap on a single UDP datagram, checksum and framing included.
pub const MAX_UDP_DATAGRAM_SIZE: usize = 1024;
/// Hard cap on a TCP message payload. Anything larger is malformed and the
/// connection carrying it gets dropped.
pub const MAX_TCP_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

pub type PacketSequence = u16;
pub type AckBitField = u32;

/// Width of the ack window: one bit per recently seen sequence.
pub const ACK_BITFIELD_SIZE: u16 = AckBitField::BITS as u16;

const SEQUENCE_WRAP_THRESHOLD: u16 = u16::MAX / 2;

/// Wraparound-safe "s1 is newer than s2". Sequences must never be compared
/// with plain `<`/`>`: after the counter wraps, 0 is newer than `u16::MAX`.
#[inline]
pub fn sequence_greater_than(s1: PacketSequence, s2: PacketSequence) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    AcceptConnection = 0,
    DenyConnection,
    ServerPing,
    MessageAll,
    ServerMessage,
    ClientChat,
    ServerChat,
    KeepAlive,
    UdpInit,
    RequestUserCount,
    UpdateUserCount,
    UpdateSessionUserSlot,
    LeaveCurrentSession,
    UserLeftSession,
    RequestJoinSession,
    ApproveJoinSession,
    DenyJoinSession,
    CurrentSessionInit,
    StartSession,
    InitSyncPing,
    SessionReadyCheck,
    SessionReadyCheckConfirm,
    EnableReadyCheck,
    SendAllEntityLocation,
    UpdateEntityLocation,
    SendAllEntityPhysics,
    UpdateEntityPhysics,
    SignalAll,
    ReceiveSignal,
}

impl MessageType {
    pub fn from_u32(raw: u32) -> Option<Self> {
        use MessageType::*;
        Some(match raw {
            0 => AcceptConnection,
            1 => DenyConnection,
            2 => ServerPing,
            3 => MessageAll,
            4 => ServerMessage,
            5 => ClientChat,
            6 => ServerChat,
            7 => KeepAlive,
            8 => UdpInit,
            9 => RequestUserCount,
            10 => UpdateUserCount,
            11 => UpdateSessionUserSlot,
            12 => LeaveCurrentSession,
            13 => UserLeftSession,
            14 => RequestJoinSession,
            15 => ApproveJoinSession,
            16 => DenyJoinSession,
            17 => CurrentSessionInit,
            18 => StartSession,
            19 => InitSyncPing,
            20 => SessionReadyCheck,
            21 => SessionReadyCheckConfirm,
            22 => EnableReadyCheck,
            23 => SendAllEntityLocation,
            24 => UpdateEntityLocation,
            25 => SendAllEntityPhysics,
            26 => UpdateEntityPhysics,
            27 => SignalAll,
            28 => ReceiveSignal,
            _ => return None,
        })
    }
}

/// Application message: a type tag plus a payload built up LIFO. Fields are
/// appended little-endian and popped from the end, which lets a relay append
/// the sender's ID without parsing what the payload already holds. A failed
/// pop returns `None` and the caller is expected to drop the whole message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            payload: Vec::new(),
        }
    }

    pub fn push_u16(&mut self, value: u16) {
        self.payload.extend_from_slice(&value.to_le_bytes());
    }

    pub fn push_u32(&mut self, value: u32) {
        self.payload.extend_from_slice(&value.to_le_bytes());
    }

    pub fn push_u64(&mut self, value: u64) {
        self.payload.extend_from_slice(&value.to_le_bytes());
    }

    pub fn push_f32(&mut self, value: f32) {
        self.push_u32(value.to_bits());
    }

    /// Appends raw bytes followed by their length, so the receiver can pop
    /// the length first and then take exactly that many bytes.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.payload.extend_from_slice(bytes);
        self.push_u64(bytes.len() as u64);
    }

    pub fn push_vec3(&mut self, v: Vec3) {
        self.push_f32(v.x);
        self.push_f32(v.y);
        self.push_f32(v.z);
    }

    fn pop_tail(&mut self, len: usize) -> Option<Vec<u8>> {
        let start = self.payload.len().checked_sub(len)?;
        Some(self.payload.split_off(start))
    }

    pub fn pop_u16(&mut self) -> Option<u16> {
        let bytes = self.pop_tail(2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn pop_u32(&mut self) -> Option<u32> {
        let bytes = self.pop_tail(4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn pop_u64(&mut self) -> Option<u64> {
        let bytes = self.pop_tail(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes);
        Some(u64::from_le_bytes(raw))
    }

    pub fn pop_f32(&mut self) -> Option<f32> {
        Some(f32::from_bits(self.pop_u32()?))
    }

    pub fn pop_bytes(&mut self) -> Option<Vec<u8>> {
        let len = self.pop_u64()? as usize;
        self.pop_tail(len)
    }

    pub fn pop_vec3(&mut self) -> Option<Vec3> {
        let z = self.pop_f32()?;
        let y = self.pop_f32()?;
        let x = self.pop_f32()?;
        Some(Vec3::new(x, y, z))
    }
}

/// Reliability fields carried at a fixed offset in every UDP datagram:
/// `[sequence: u16][ack: u16][ack bitfield: u32]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReliabilitySegment {
    pub sequence: PacketSequence,
    pub ack: PacketSequence,
    pub ack_bitfield: AckBitField,
}

impl ReliabilitySegment {
    pub const WIRE_SIZE: usize = 8;

    pub fn write(&self, writer: &mut WireWriter) {
        writer.write_u16(self.sequence);
        writer.write_u16(self.ack);
        writer.write_u32(self.ack_bitfield);
    }

    pub fn read(reader: &mut WireReader) -> Result<Self, WireError> {
        Ok(Self {
            sequence: reader.read_u16()?,
            ack: reader.read_u16()?,
            ack_bitfield: reader.read_u32()?,
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },
    #[error("payload of {len} bytes exceeds the {max} byte cap")]
    PayloadTooLarge { len: u64, max: u64 },
    #[error("unknown message type {0}")]
    UnknownMessageType(u32),
}

/// TCP message header: `[message id: u32][payload len: u64]`.
pub const TCP_HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, Copy)]
pub struct TcpFrameHeader {
    pub raw_type: u32,
    pub payload_len: u64,
}

impl TcpFrameHeader {
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u32(self.raw_type)
    }
}

pub fn encode_tcp_message(message: &Message) -> Vec<u8> {
    let mut w = WireWriter::with_capacity(TCP_HEADER_SIZE + message.payload.len());
    w.write_u32(message.message_type as u32);
    w.write_u64(message.payload.len() as u64);
    w.write_bytes(&message.payload);
    w.into_vec()
}

/// Parses the fixed-size TCP header and enforces the payload cap, so a
/// malicious length can never drive the read loop to allocate 2^64 bytes.
pub fn decode_tcp_header(buf: &[u8]) -> Result<TcpFrameHeader, FrameError> {
    let mut r = WireReader::new(buf);
    let raw_type = r.read_u32()?;
    let payload_len = r.read_u64()?;
    r.finish()?;
    if payload_len > MAX_TCP_PAYLOAD_SIZE as u64 {
        return Err(FrameError::PayloadTooLarge {
            len: payload_len,
            max: MAX_TCP_PAYLOAD_SIZE as u64,
        });
    }
    Ok(TcpFrameHeader {
        raw_type,
        payload_len,
    })
}

/// One decoded UDP datagram. The message type stays raw until
/// [`UdpDatagram::into_message`] maps it: the reliability segment of a
/// datagram with an unrecognized type is still valid ack data.
#[derive(Debug, Clone)]
pub struct UdpDatagram {
    pub raw_type: u32,
    pub segment: ReliabilitySegment,
    pub payload: Vec<u8>,
}

impl UdpDatagram {
    pub fn into_message(self) -> Result<Message, FrameError> {
        match MessageType::from_u32(self.raw_type) {
            Some(message_type) => Ok(Message {
                message_type,
                payload: self.payload,
            }),
            None => Err(FrameError::UnknownMessageType(self.raw_type)),
        }
    }
}

/// Frames a datagram as `[crc32c][message id][payload len][segment][payload]`.
/// The checksum covers every byte after itself.
pub fn encode_udp_datagram(
    message: &Message,
    segment: ReliabilitySegment,
) -> Result<Vec<u8>, FrameError> {
    let mut w = WireWriter::with_capacity(
        4 + TCP_HEADER_SIZE + ReliabilitySegment::WIRE_SIZE + message.payload.len(),
    );
    w.write_u32(0);
    w.write_u32(message.message_type as u32);
    w.write_u64(message.payload.len() as u64);
    segment.write(&mut w);
    w.write_bytes(&message.payload);
    if w.len() > MAX_UDP_DATAGRAM_SIZE {
        return Err(FrameError::PayloadTooLarge {
            len: w.len() as u64,
            max: MAX_UDP_DATAGRAM_SIZE as u64,
        });
    }
    let checksum = crc32c::crc32c(&w.as_slice()[4..]);
    w.patch_u32(0, checksum);
    Ok(w.into_vec())
}

pub fn decode_udp_datagram(buf: &[u8]) -> Result<UdpDatagram, FrameError> {
    if buf.len() > MAX_UDP_DATAGRAM_SIZE {
        return Err(FrameError::PayloadTooLarge {
            len: buf.len() as u64,
            max: MAX_UDP_DATAGRAM_SIZE as u64,
        });
    }
    let mut r = WireReader::new(buf);
    let expected = r.read_u32()?;
    let computed = crc32c::crc32c(&buf[4..]);
    if expected != computed {
        return Err(FrameError::ChecksumMismatch { expected, computed });
    }
    let raw_type = r.read_u32()?;
    let payload_len = r.read_u64()?;
    let segment = ReliabilitySegment::read(&mut r)?;
    let payload = r.read_bytes(payload_len as usize)?.to_vec();
    r.finish()?;
    Ok(UdpDatagram {
        raw_type,
        segment,
        payload,
    })
}

/// The anti-bot handshake transform, shared by both ends and parameterized
/// so deployments can vary the secrets. Defends against naive non-engine
/// clients, not a capable adversary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrambleSecrets {
    pub one: u64,
    pub two: u64,
    pub three: u64,
    pub four: u64,
}

impl Default for ScrambleSecrets {
    fn default() -> Self {
        Self {
            one: 1,
            two: 2,
            three: 3,
            four: 4,
        }
    }
}

pub fn scramble(input: u64, secrets: &ScrambleSecrets) -> u64 {
    let mut out = input ^ secrets.one;
    out = ((out & secrets.two) >> 4) | ((out & secrets.three) << 4);
    out ^ secrets.four
}
