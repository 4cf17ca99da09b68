//! # rollnet
//!
//! rollnet is the netplay subsystem of a deterministic emulator. It lets a
//! small fixed number of peers run the same emulated machine in lockstep,
//! using rollback-based input prediction: local inputs apply the instant they
//! are pressed, and history is rewound and replayed when authoritative remote
//! inputs arrive late or out of order.
//!
//! The crate is built from three tightly coupled pieces:
//!
//! - a [session state machine](session::NetplaySession) governing peer
//!   discovery, host-authoritative resynchronization, and teardown over an
//!   unreliable datagram transport,
//! - a [rollback engine](rollback::RollbackSession) maintaining a ring of
//!   per-frame snapshots and input predictions, and
//! - an adaptive [frame pacer](session::FramePacer) that keeps the peers'
//!   simulation clocks aligned.
//!
//! The emulated machine itself, controller sampling, and the GUI host are
//! collaborators behind the traits in [`machine`] and [`input`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use error::{
    InvalidRequestKind, MalformedControlKind, NetplayError, TransportErrorKind,
};
pub use input::{InputProvider, NetplayInput, BUTTON_THRESHOLD};
pub use machine::{HostInterface, Machine, SettingsOverlay};
pub use rollback::{
    AdvanceFlags, DatagramSink, NetworkStats, PlayerKind, RollbackConfig, RollbackEvent,
    RollbackHandler, RollbackSession, Snapshot, SnapshotPool,
};
pub use session::{FramePacer, NetplaySession, SessionOptions};
pub use transport::{Channel, PeerHandle, Transport, TransportEvent};

pub mod codec;
pub mod control;
pub mod error;
pub mod input;
pub mod machine;
pub mod rollback;
pub mod session;
pub mod transport;

// #############
// # CONSTANTS #
// #############

/// Internally, -1 represents no frame / invalid frame.
pub const NULL_FRAME: i32 = -1;

/// Maximum number of players in a session. The host always occupies
/// player id 0; joiners are assigned the lowest free id.
pub const MAX_PLAYERS: usize = 4;

/// Maximum number of frames the rollback engine will speculate past the last
/// confirmed frame before refusing further local input.
pub const MAX_ROLLBACK_FRAMES: usize = 8;

/// Number of logical transport channels (control + gameplay).
pub const NUM_CHANNELS: usize = 2;

/// Byte length of the NUL-padded nickname field on the wire.
pub const NICKNAME_LEN: usize = 128;

/// Byte length of the NUL-padded session password field on the wire.
pub const PASSWORD_LEN: usize = 128;

/// Number of digital controller bindings sampled per frame.
pub const NUM_BINDINGS: usize = 16;

/// Default local input delay, in frames.
pub const DEFAULT_LOCAL_DELAY: usize = 1;

/// Size of one desync checksum window into the machine snapshot.
pub const CHECKSUM_WINDOW: usize = 16 * 1024;

/// Number of checksum windows cycled through as frames advance.
pub const NUM_CHECKSUM_GROUPS: usize = 4;

/// A frame is a single step of emulated machine execution.
///
/// Frames are the fundamental unit of time in rollback networking: they start
/// at 0 and increment sequentially. The special value [`Frame::NULL`] (-1)
/// represents "no frame".
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Frame(i32);

impl Frame {
    /// The null frame constant, representing "no frame".
    pub const NULL: Frame = Frame(NULL_FRAME);

    /// Creates a new `Frame` from an `i32` value without validation.
    #[inline]
    #[must_use]
    pub const fn new(frame: i32) -> Self {
        Frame(frame)
    }

    /// Returns the underlying `i32` value.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns `true` if this frame is the null frame.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Returns `true` if this frame is valid (non-negative).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_FRAME")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::ops::Add<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn add(self, rhs: i32) -> Self::Output {
        Frame(self.0 + rhs)
    }
}

impl std::ops::AddAssign<i32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: i32) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn sub(self, rhs: i32) -> Self::Output {
        Frame(self.0 - rhs)
    }
}

impl std::ops::Sub<Frame> for Frame {
    type Output = i32;

    #[inline]
    fn sub(self, rhs: Frame) -> Self::Output {
        self.0 - rhs.0
    }
}

impl From<i32> for Frame {
    #[inline]
    fn from(value: i32) -> Self {
        Frame(value)
    }
}

impl PartialEq<i32> for Frame {
    #[inline]
    fn eq(&self, other: &i32) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<i32> for Frame {
    #[inline]
    fn partial_cmp(&self, other: &i32) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

/// Identifies one player slot in a session.
///
/// Player ids are assigned by the host and stable for the lifetime of a
/// session. The host is always player 0.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PlayerId(usize);

impl PlayerId {
    /// The host's player id.
    pub const HOST: PlayerId = PlayerId(0);

    /// Creates a new `PlayerId`. Values are validated against
    /// [`MAX_PLAYERS`] at the session boundary, not here.
    #[inline]
    #[must_use]
    pub const fn new(id: usize) -> Self {
        PlayerId(id)
    }

    /// Returns the underlying index.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns `true` if this id denotes the host.
    #[inline]
    #[must_use]
    pub const fn is_host(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for PlayerId {
    #[inline]
    fn from(value: usize) -> Self {
        PlayerId(value)
    }
}

// #############
// #   ENUMS   #
// #############

/// The lifecycle state of a [`NetplaySession`]. Transitions happen only
/// inside the session runner; every other component reports upward by
/// return value or event.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No session exists.
    Inactive,
    /// Transport is being bound and collaborators configured.
    Initializing,
    /// A joiner is dialing the host and waiting for admission.
    Connecting,
    /// Peers are exchanging a machine snapshot and reconnecting the mesh.
    Resetting,
    /// The rollback loop is live.
    Running,
    /// The session is draining connections before returning to `Inactive`.
    ClosingSession,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Inactive => "Inactive",
            SessionState::Initializing => "Initializing",
            SessionState::Connecting => "Connecting",
            SessionState::Resetting => "Resetting",
            SessionState::Running => "Running",
            SessionState::ClosingSession => "ClosingSession",
        };
        write!(f, "{name}")
    }
}

/// Provenance of an input handed to the machine for one frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InputStatus {
    /// The input was received from its player.
    Confirmed,
    /// The input is a prediction; it may be corrected by a later rollback.
    Predicted,
    /// The player is disconnected at this frame; the input is a blank.
    Disconnected,
}
