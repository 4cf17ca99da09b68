//! Error types for rollnet.
//!
//! Errors are structured enums rather than strings: hot paths construct them
//! without allocating, and callers can match on the specific case. Fatal
//! classification is a property of where an error surfaces, not of the type:
//! the session runner decides whether an error closes the session, drops a
//! peer, or is merely logged (see the propagation policy in the crate docs).

use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::control::ConnectResult;
use crate::{Frame, PlayerId};

/// Why a transport operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum TransportErrorKind {
    /// Failed to bind the UDP socket to the requested port.
    BindFailed {
        /// The port that failed to bind.
        port: u16,
    },
    /// The peer table is full; no slot for another connection.
    PeerTableFull {
        /// The configured maximum number of peers.
        max_peers: usize,
    },
    /// The handle does not refer to a live peer.
    UnknownPeer,
    /// A send was attempted before the peer finished its handshake.
    NotConnected,
}

impl Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BindFailed { port } => write!(f, "failed to bind UDP socket to port {port}"),
            Self::PeerTableFull { max_peers } => {
                write!(f, "peer table full ({max_peers} peers)")
            },
            Self::UnknownPeer => write!(f, "unknown peer handle"),
            Self::NotConnected => write!(f, "peer is not connected"),
        }
    }
}

/// Why an incoming control packet was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum MalformedControlKind {
    /// The packet is shorter than the 4-byte message header.
    TruncatedHeader {
        /// Actual packet length.
        len: usize,
    },
    /// The declared size is smaller than the fixed portion of the typed body.
    TruncatedBody {
        /// The message type field.
        msg_type: u16,
        /// The declared total size.
        declared: usize,
        /// The minimum size the type requires.
        required: usize,
    },
    /// The declared size disagrees with the bytes actually received.
    SizeMismatch {
        /// The declared total size.
        declared: usize,
        /// The actual packet length.
        actual: usize,
    },
    /// The message type field is not a recognized control message.
    UnknownType {
        /// The raw type field.
        raw: u16,
    },
    /// A Reset declared more snapshot bytes than the packet carries.
    OversizedStateData {
        /// Declared snapshot byte count.
        declared: u32,
        /// Bytes actually available after the fixed portion.
        available: usize,
    },
    /// An enum field carried a value outside its range.
    BadFieldValue {
        /// Name of the offending field.
        field: &'static str,
        /// The raw value received.
        raw: u32,
    },
}

impl Display for MalformedControlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TruncatedHeader { len } => {
                write!(f, "packet of {len} bytes is shorter than the message header")
            },
            Self::TruncatedBody {
                msg_type,
                declared,
                required,
            } => {
                write!(
                    f,
                    "message type {msg_type} declares {declared} bytes but requires at least {required}"
                )
            },
            Self::SizeMismatch { declared, actual } => {
                write!(f, "declared size {declared} does not match packet length {actual}")
            },
            Self::UnknownType { raw } => write!(f, "unknown control message type {raw}"),
            Self::OversizedStateData {
                declared,
                available,
            } => {
                write!(
                    f,
                    "reset declares {declared} snapshot bytes but only {available} are present"
                )
            },
            Self::BadFieldValue { field, raw } => {
                write!(f, "field '{field}' carries out-of-range value {raw}")
            },
        }
    }
}

/// Why an API request was invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum InvalidRequestKind {
    /// The player id does not refer to the local player.
    NotLocalPlayer {
        /// The offending id.
        player: PlayerId,
    },
    /// The player id is outside the session's player count.
    InvalidPlayerId {
        /// The offending id.
        player: PlayerId,
        /// The session's player count.
        num_players: usize,
    },
    /// The player id is already occupied.
    PlayerIdInUse {
        /// The offending id.
        player: PlayerId,
    },
    /// Number of players must be between 1 and [`MAX_PLAYERS`](crate::MAX_PLAYERS).
    BadPlayerCount {
        /// The requested count.
        requested: usize,
    },
    /// The rollback window is outside the supported range.
    BadRollbackWindow {
        /// The requested window.
        requested: usize,
    },
    /// The frame delay exceeds what the input queue can absorb.
    FrameDelayTooLarge {
        /// The requested delay.
        delay: usize,
        /// The maximum supported delay.
        max_delay: usize,
    },
    /// The operation is not valid in the current state.
    WrongState {
        /// Name of the state the session or engine was in.
        state: &'static str,
    },
    /// Local input for the current frame was not provided before advancing.
    MissingLocalInput {
        /// The frame that was about to advance.
        frame: Frame,
    },
}

impl Display for InvalidRequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotLocalPlayer { player } => {
                write!(f, "player {player} is not the local player")
            },
            Self::InvalidPlayerId {
                player,
                num_players,
            } => {
                write!(f, "invalid player id {player} (session has {num_players} players)")
            },
            Self::PlayerIdInUse { player } => write!(f, "player id {player} is already in use"),
            Self::BadPlayerCount { requested } => {
                write!(f, "invalid player count {requested}")
            },
            Self::BadRollbackWindow { requested } => {
                write!(f, "invalid rollback window {requested}")
            },
            Self::FrameDelayTooLarge { delay, max_delay } => {
                write!(f, "frame delay {delay} exceeds maximum {max_delay}")
            },
            Self::WrongState { state } => {
                write!(f, "operation is not valid in state '{state}'")
            },
            Self::MissingLocalInput { frame } => {
                write!(f, "missing local input for frame {frame}")
            },
        }
    }
}

/// All errors this crate can return.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum NetplayError {
    /// A transport operation failed.
    Transport {
        /// The specific transport failure.
        kind: TransportErrorKind,
    },
    /// The host did not answer within the connect window.
    ConnectTimeout,
    /// The host answered but refused admission.
    ConnectRejected {
        /// The result code from the host.
        reason: ConnectResult,
    },
    /// Serializing the machine state failed.
    SnapshotSave,
    /// Restoring the machine from a snapshot failed (including a corrupt or
    /// undecompressable Reset payload).
    SnapshotLoad,
    /// An incoming control packet failed validation.
    MalformedControl {
        /// Why the packet was rejected.
        kind: MalformedControlKind,
    },
    /// The prediction window is exhausted; the local simulation must wait for
    /// remote inputs before accepting more local input.
    PredictionThreshold,
    /// The rollback engine has not finished synchronizing with all peers.
    NotSynchronized,
    /// An API call carried invalid parameters.
    InvalidRequest {
        /// Why the request was invalid.
        kind: InvalidRequestKind,
    },
    /// A peer was dropped from the session.
    PeerDropped {
        /// The dropped player.
        player: PlayerId,
    },
    /// The session was closed.
    SessionClosed {
        /// Human-readable close reason.
        reason: &'static str,
    },
    /// Encoding or decoding an internal wire message failed.
    Codec {
        /// Which message family failed.
        context: &'static str,
    },
}

impl Display for NetplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport { kind } => write!(f, "transport error: {kind}"),
            Self::ConnectTimeout => write!(f, "timed out connecting to server"),
            Self::ConnectRejected { reason } => {
                write!(f, "connection rejected by server: {reason}")
            },
            Self::SnapshotSave => write!(f, "failed to save machine state"),
            Self::SnapshotLoad => write!(f, "failed to load machine state"),
            Self::MalformedControl { kind } => write!(f, "malformed control packet: {kind}"),
            Self::PredictionThreshold => {
                write!(f, "prediction window exhausted, waiting for remote input")
            },
            Self::NotSynchronized => write!(f, "session is not yet synchronized with all peers"),
            Self::InvalidRequest { kind } => write!(f, "invalid request: {kind}"),
            Self::PeerDropped { player } => write!(f, "player {player} was dropped"),
            Self::SessionClosed { reason } => write!(f, "session closed: {reason}"),
            Self::Codec { context } => write!(f, "wire codec failure in {context}"),
        }
    }
}

impl Error for NetplayError {}

impl From<TransportErrorKind> for NetplayError {
    fn from(kind: TransportErrorKind) -> Self {
        Self::Transport { kind }
    }
}

impl From<MalformedControlKind> for NetplayError {
    fn from(kind: MalformedControlKind) -> Self {
        Self::MalformedControl { kind }
    }
}

impl From<InvalidRequestKind> for NetplayError {
    fn from(kind: InvalidRequestKind) -> Self {
        Self::InvalidRequest { kind }
    }
}
