//! Gameplay-channel wire messages.
//!
//! These ride the unreliable channel and are bincode-coded through
//! [`crate::codec`]. Loss and reordering are expected: inputs are sent
//! redundantly (every unacked input repeats in each message) and everything
//! else is periodic, so any individual datagram is disposable.

use serde::{Deserialize, Serialize};

use crate::{Frame, NetplayInput};

/// What one peer believes about one player's connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ConnectStatus {
    pub disconnected: bool,
    /// The most recent frame of input this peer holds for the player.
    pub last_frame: Frame,
}

impl Default for ConnectStatus {
    fn default() -> Self {
        Self {
            disconnected: false,
            last_frame: Frame::NULL,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct SyncRequest {
    pub random: u32, // echo this back so stale replies are recognizable
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct SyncReply {
    pub random: u32,
}

/// All inputs the sender has not yet seen acknowledged, oldest first.
/// `inputs[i]` belongs to frame `start_frame + i`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct InputMessage {
    pub peer_connect_status: Vec<ConnectStatus>,
    pub start_frame: Frame,
    /// The most recent remote input frame the sender has received, piggybacked
    /// as an acknowledgement.
    pub ack_frame: Frame,
    pub inputs: Vec<NetplayInput>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct InputAck {
    pub ack_frame: Frame,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct QualityReport {
    /// How many frames ahead of the sender the receiver is estimated to be.
    pub frame_advantage: i16,
    /// Sender's clock in microseconds, echoed back in the reply.
    pub ping: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct QualityReply {
    pub pong: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ChecksumReport {
    pub frame: Frame,
    pub checksum: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum GameplayBody {
    SyncRequest(SyncRequest),
    SyncReply(SyncReply),
    Input(InputMessage),
    InputAck(InputAck),
    QualityReport(QualityReport),
    QualityReply(QualityReply),
    ChecksumReport(ChecksumReport),
    KeepAlive,
}

/// One gameplay datagram. `magic` identifies the sending endpoint instance so
/// packets from a stale session are filtered out after a resync.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct GameplayMessage {
    pub magic: u16,
    pub body: GameplayBody,
}
