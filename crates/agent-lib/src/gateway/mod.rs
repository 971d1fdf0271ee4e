//! Gateway transport
//!
//! This module provides:
//! - A length-prefixed frame codec with seq/kind/flags headers
//! - Typed payloads for every packet kind
//! - A reconnecting session with request/response, server push and a
//!   bounded outbound queue

mod frame;
mod packets;
mod session;

pub use frame::{Frame, FrameCodec, FrameError, PacketKind, FLAG_RESPONSE, MAX_FRAME_SIZE};
pub use packets::{
    decode, encode, ContainerResources, DecisionStatus, PacketAuth, PacketAuthOk,
    PacketAuthReject, PacketBye, PacketDecision, PacketDecisionResult, PacketLog, PacketMetrics,
    PacketRawResources, PacketRestart, RequestLimit, TotalResources, WireMetric,
    PROTOCOL_MAJOR_VERSION, PROTOCOL_MINOR_VERSION,
};
pub use session::{
    PacketHandler, Reply, Session, SessionConfig, SessionEnd, SessionError, SessionState,
};
