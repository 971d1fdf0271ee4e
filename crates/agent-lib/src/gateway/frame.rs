//! Length-prefixed frame codec for the gateway channel
//!
//! Wire layout, all integers big-endian:
//!
//! ```text
//! +--------------+---------+----------+---------+---------+
//! | len (4 bytes)| seq (8) | kind (2) | flags(1)| payload |
//! +--------------+---------+----------+---------+---------+
//! ```
//!
//! `len` covers everything after the prefix. The length is validated
//! before any allocation; frames above [`MAX_FRAME_SIZE`] are a protocol
//! error, not a large read.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Frame header past the length prefix: seq + kind + flags.
const HEADER_LEN: usize = 8 + 2 + 1;

/// Length-prefix width.
const PREFIX_LEN: usize = 4;

/// Upper bound for a single frame.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Response bit: the frame answers the request carrying the same seq.
pub const FLAG_RESPONSE: u8 = 0b0000_0001;

/// Packet kinds carried over the gateway channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketKind {
    Auth = 1,
    AuthOk = 2,
    AuthReject = 3,
    Metrics = 4,
    Events = 5,
    RawResources = 6,
    Decision = 7,
    DecisionResult = 8,
    Restart = 9,
    Log = 10,
    Bye = 11,
}

impl PacketKind {
    pub fn from_wire(kind: u16) -> Option<Self> {
        match kind {
            1 => Some(PacketKind::Auth),
            2 => Some(PacketKind::AuthOk),
            3 => Some(PacketKind::AuthReject),
            4 => Some(PacketKind::Metrics),
            5 => Some(PacketKind::Events),
            6 => Some(PacketKind::RawResources),
            7 => Some(PacketKind::Decision),
            8 => Some(PacketKind::DecisionResult),
            9 => Some(PacketKind::Restart),
            10 => Some(PacketKind::Log),
            11 => Some(PacketKind::Bye),
            _ => None,
        }
    }
}

/// One decoded frame. The kind is kept raw so unknown kinds can be logged
/// and dropped instead of failing the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u64,
    pub kind: u16,
    pub flags: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(seq: u64, kind: PacketKind, payload: impl Into<Bytes>) -> Self {
        Self {
            seq,
            kind: kind as u16,
            flags: 0,
            payload: payload.into(),
        }
    }

    pub fn response(seq: u64, kind: PacketKind, payload: impl Into<Bytes>) -> Self {
        Self {
            seq,
            kind: kind as u16,
            flags: FLAG_RESPONSE,
            payload: payload.into(),
        }
    }

    pub fn packet_kind(&self) -> Option<PacketKind> {
        PacketKind::from_wire(self.kind)
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {length} bytes exceeds the {max} byte limit")]
    TooLarge { length: usize, max: usize },
    #[error("frame of {length} bytes is shorter than the {HEADER_LEN} byte header")]
    TooShort { length: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Codec used with [`tokio_util::codec::Framed`] over the gateway stream.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < PREFIX_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge {
                length,
                max: MAX_FRAME_SIZE,
            });
        }
        if length < HEADER_LEN {
            return Err(FrameError::TooShort { length });
        }

        if src.len() < PREFIX_LEN + length {
            src.reserve(PREFIX_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(PREFIX_LEN);
        let seq = src.get_u64();
        let kind = src.get_u16();
        let flags = src.get_u8();
        let payload = src.split_to(length - HEADER_LEN).freeze();

        Ok(Some(Frame {
            seq,
            kind,
            flags,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let length = HEADER_LEN + frame.payload.len();
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge {
                length,
                max: MAX_FRAME_SIZE,
            });
        }

        dst.reserve(PREFIX_LEN + length);
        dst.put_u32(length as u32);
        dst.put_u64(frame.seq);
        dst.put_u16(frame.kind);
        dst.put_u8(frame.flags);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}
