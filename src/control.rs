//! Typed control-channel messages and their binary wire format.
//!
//! Every control message starts with a little-endian `{u16 type, u16 size}`
//! header. `size` counts the fixed portion of the message including the
//! header; for every type except `Reset` the fixed portion is the complete
//! message (for `ChatMessage` the trailing UTF-8 text is included in `size`).
//! A `Reset` declares `size == RESET_FIXED_SIZE` and carries
//! `state_data_size` snapshot bytes after the fixed portion, since the snapshot
//! can exceed what a `u16` can express, so its length lives in the body.
//!
//! Validation is strict and happens entirely in [`ControlMessage::decode`]:
//! a packet that is truncated, oversized, inconsistent with its declared
//! size, or carrying out-of-range enum values is rejected before any field
//! reaches session logic. The session runner logs and discards rejected
//! non-Reset packets; a rejected Reset is fatal to the joiner (it cannot
//! trust its machine state without one).

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::MalformedControlKind;
use crate::{MAX_PLAYERS, NICKNAME_LEN, PASSWORD_LEN};

/// Byte length of the `{u16 type, u16 size}` message header.
pub const HEADER_SIZE: usize = 4;

/// One roster slot on the wire: `s16 controller_port, u8[128] nickname,
/// u32 host, u16 port`.
pub const PLAYER_ENTRY_SIZE: usize = 2 + NICKNAME_LEN + 4 + 2;

/// Fixed portion of a Reset: header, cookie, state_data_size, num_players,
/// and `MAX_PLAYERS` roster entries.
pub const RESET_FIXED_SIZE: usize = HEADER_SIZE + 4 + 4 + 2 + MAX_PLAYERS * PLAYER_ENTRY_SIZE;

/// Chat text is clamped to this many bytes before encoding.
pub const MAX_CHAT_LEN: usize = 512;

/// The `mode` field value for an ordinary player connection. Anything else
/// is refused by the host's admission policy.
pub const CONNECT_MODE_PLAYER: u8 = 0;

const TYPE_CONNECT_REQUEST: u16 = 0;
const TYPE_CONNECT_RESPONSE: u16 = 1;
const TYPE_RESET: u16 = 2;
const TYPE_RESET_COMPLETE: u16 = 3;
const TYPE_RESUME_SESSION: u16 = 4;
const TYPE_PLAYER_JOINED: u16 = 5;
const TYPE_DROP_PLAYER: u16 = 6;
const TYPE_RESET_REQUEST: u16 = 7;
const TYPE_CLOSE_SESSION: u16 = 8;
const TYPE_CHAT_MESSAGE: u16 = 9;

/// Host's verdict on a connection request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConnectResult {
    /// Admitted; the response carries the assigned player id.
    Success,
    /// Every player slot is occupied.
    ServerFull,
    /// The requested player id is taken.
    PlayerIdInUse,
    /// The session is not accepting this kind of connection.
    SessionClosed,
}

impl ConnectResult {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Success),
            1 => Some(Self::ServerFull),
            2 => Some(Self::PlayerIdInUse),
            3 => Some(Self::SessionClosed),
            _ => None,
        }
    }

    fn as_raw(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::ServerFull => 1,
            Self::PlayerIdInUse => 2,
            Self::SessionClosed => 3,
        }
    }
}

impl std::fmt::Display for ConnectResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Success => "success",
            Self::ServerFull => "server is full",
            Self::PlayerIdInUse => "player id is in use",
            Self::SessionClosed => "session is closed",
        };
        write!(f, "{text}")
    }
}

/// Why the host removed a player from the roster.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// The player's connection was lost.
    ConnectionLost,
    /// The player failed to acknowledge a resync in time.
    ResyncTimeout,
}

impl DropReason {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::ConnectionLost),
            1 => Some(Self::ResyncTimeout),
            _ => None,
        }
    }

    fn as_raw(self) -> u8 {
        match self {
            Self::ConnectionLost => 0,
            Self::ResyncTimeout => 1,
        }
    }
}

/// Why a joiner is asking the host for a resync.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ResetRequestReason {
    /// A non-host neighbour's connection was lost.
    ConnectionLost,
}

impl ResetRequestReason {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::ConnectionLost),
            _ => None,
        }
    }

    fn as_raw(self) -> u8 {
        match self {
            Self::ConnectionLost => 0,
        }
    }
}

/// Why a session is closing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The host shut the session down.
    HostShutdown,
    /// A peer terminated its participation.
    Terminated,
}

impl CloseReason {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::HostShutdown),
            1 => Some(Self::Terminated),
            _ => None,
        }
    }

    fn as_raw(self) -> u8 {
        match self {
            Self::HostShutdown => 0,
            Self::Terminated => 1,
        }
    }
}

/// One occupied roster slot carried by a Reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    /// Controller port the player drives.
    pub controller_port: i16,
    /// Player nickname (at most [`NICKNAME_LEN`] bytes on the wire).
    pub nickname: String,
    /// Address the player's transport listens on.
    pub addr: SocketAddrV4,
}

/// The resync payload: cookie, authoritative roster, and a compressed
/// machine snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetMessage {
    /// Monotonically increasing reset identifier.
    pub cookie: u32,
    /// Number of occupied roster slots.
    pub num_players: u16,
    /// `MAX_PLAYERS` slots; `None` where `controller_port` is -1 on the wire.
    pub players: Vec<Option<RosterEntry>>,
    /// lz4 size-prepended compressed machine snapshot.
    pub state_data: Vec<u8>,
}

/// A typed control-channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Joiner asks the host for admission.
    ConnectRequest {
        /// Connection mode; only [`CONNECT_MODE_PLAYER`] is admitted.
        mode: u8,
        /// Requested player id, or -1 for "any".
        requested_player_id: i16,
        /// Joiner's nickname.
        nickname: String,
        /// Session password. Carried but not enforced.
        password: String,
    },
    /// Host answers an admission request.
    ConnectResponse {
        /// The verdict.
        result: ConnectResult,
        /// Assigned player id on success, -1 otherwise.
        player_id: i16,
    },
    /// Host redistributes the authoritative roster and machine snapshot.
    Reset(ResetMessage),
    /// Joiner acknowledges a Reset once its mesh is connected.
    ResetComplete {
        /// Echo of the Reset's cookie.
        cookie: u32,
    },
    /// Host releases all peers into the Running state.
    ResumeSession,
    /// Host announces a newly admitted player to the pre-existing peers.
    PlayerJoined {
        /// The new player's id.
        player_id: i16,
    },
    /// Host removes a player from the roster.
    DropPlayer {
        /// Why the player was removed.
        reason: DropReason,
        /// The removed player's id.
        player_id: i16,
    },
    /// A joiner asks the host to resync after losing a neighbour.
    ResetRequest {
        /// Why the resync is needed.
        reason: ResetRequestReason,
        /// The player whose loss triggered the request.
        causing_player_id: i16,
    },
    /// Any peer announces session teardown.
    CloseSession {
        /// Why the session is closing.
        reason: CloseReason,
    },
    /// Free-form chat, relayed to every peer.
    Chat {
        /// UTF-8 text.
        text: String,
    },
}

impl ControlMessage {
    /// Serializes the message into its wire form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + 16);
        // header is patched once the body size is known
        put_u16(&mut out, 0);
        put_u16(&mut out, 0);
        let msg_type = match self {
            Self::ConnectRequest {
                mode,
                requested_player_id,
                nickname,
                password,
            } => {
                out.push(*mode);
                put_i16(&mut out, *requested_player_id);
                put_padded(&mut out, nickname, NICKNAME_LEN);
                put_padded(&mut out, password, PASSWORD_LEN);
                TYPE_CONNECT_REQUEST
            },
            Self::ConnectResponse { result, player_id } => {
                out.push(result.as_raw());
                put_i16(&mut out, *player_id);
                TYPE_CONNECT_RESPONSE
            },
            Self::Reset(reset) => {
                put_u32(&mut out, reset.cookie);
                put_u32(&mut out, reset.state_data.len() as u32);
                put_u16(&mut out, reset.num_players);
                for slot in 0..MAX_PLAYERS {
                    match reset.players.get(slot).and_then(Option::as_ref) {
                        Some(entry) => {
                            put_i16(&mut out, entry.controller_port);
                            put_padded(&mut out, &entry.nickname, NICKNAME_LEN);
                            put_u32(&mut out, u32::from(*entry.addr.ip()));
                            put_u16(&mut out, entry.addr.port());
                        },
                        None => {
                            put_i16(&mut out, -1);
                            out.resize(out.len() + NICKNAME_LEN + 4 + 2, 0);
                        },
                    }
                }
                out.extend_from_slice(&reset.state_data);
                TYPE_RESET
            },
            Self::ResetComplete { cookie } => {
                put_u32(&mut out, *cookie);
                TYPE_RESET_COMPLETE
            },
            Self::ResumeSession => TYPE_RESUME_SESSION,
            Self::PlayerJoined { player_id } => {
                put_i16(&mut out, *player_id);
                TYPE_PLAYER_JOINED
            },
            Self::DropPlayer { reason, player_id } => {
                out.push(reason.as_raw());
                put_i16(&mut out, *player_id);
                TYPE_DROP_PLAYER
            },
            Self::ResetRequest {
                reason,
                causing_player_id,
            } => {
                out.push(reason.as_raw());
                put_i16(&mut out, *causing_player_id);
                TYPE_RESET_REQUEST
            },
            Self::CloseSession { reason } => {
                out.push(reason.as_raw());
                TYPE_CLOSE_SESSION
            },
            Self::Chat { text } => {
                let clamped = clamp_utf8(text, MAX_CHAT_LEN);
                out.extend_from_slice(clamped.as_bytes());
                TYPE_CHAT_MESSAGE
            },
        };
        let declared = match self {
            // the snapshot trails outside the declared fixed portion
            Self::Reset(_) => RESET_FIXED_SIZE,
            _ => out.len(),
        } as u16;
        out[0..2].copy_from_slice(&msg_type.to_le_bytes());
        out[2..4].copy_from_slice(&declared.to_le_bytes());
        out
    }

    /// Parses and validates one control packet.
    pub fn decode(bytes: &[u8]) -> Result<Self, MalformedControlKind> {
        if bytes.len() < HEADER_SIZE {
            return Err(MalformedControlKind::TruncatedHeader { len: bytes.len() });
        }
        let mut pos = 0;
        let msg_type = get_u16(bytes, &mut pos);
        let declared = get_u16(bytes, &mut pos) as usize;

        let required = match msg_type {
            TYPE_CONNECT_REQUEST => HEADER_SIZE + 1 + 2 + NICKNAME_LEN + PASSWORD_LEN,
            TYPE_CONNECT_RESPONSE => HEADER_SIZE + 3,
            TYPE_RESET => RESET_FIXED_SIZE,
            TYPE_RESET_COMPLETE => HEADER_SIZE + 4,
            TYPE_RESUME_SESSION => HEADER_SIZE,
            TYPE_PLAYER_JOINED => HEADER_SIZE + 2,
            TYPE_DROP_PLAYER => HEADER_SIZE + 3,
            TYPE_RESET_REQUEST => HEADER_SIZE + 3,
            TYPE_CLOSE_SESSION => HEADER_SIZE + 1,
            TYPE_CHAT_MESSAGE => HEADER_SIZE,
            raw => return Err(MalformedControlKind::UnknownType { raw }),
        };
        if declared < required {
            return Err(MalformedControlKind::TruncatedBody {
                msg_type,
                declared,
                required,
            });
        }
        if bytes.len() < declared {
            return Err(MalformedControlKind::SizeMismatch {
                declared,
                actual: bytes.len(),
            });
        }
        // every type except Reset is exactly its declared size
        if msg_type != TYPE_RESET && bytes.len() != declared {
            return Err(MalformedControlKind::SizeMismatch {
                declared,
                actual: bytes.len(),
            });
        }

        match msg_type {
            TYPE_CONNECT_REQUEST => {
                let mode = get_u8(bytes, &mut pos);
                let requested_player_id = get_i16(bytes, &mut pos);
                let nickname = get_padded(bytes, &mut pos, NICKNAME_LEN);
                let password = get_padded(bytes, &mut pos, PASSWORD_LEN);
                Ok(Self::ConnectRequest {
                    mode,
                    requested_player_id,
                    nickname,
                    password,
                })
            },
            TYPE_CONNECT_RESPONSE => {
                let raw = get_u8(bytes, &mut pos);
                let result = ConnectResult::from_raw(raw).ok_or(
                    MalformedControlKind::BadFieldValue {
                        field: "result",
                        raw: raw as u32,
                    },
                )?;
                let player_id = get_i16(bytes, &mut pos);
                Ok(Self::ConnectResponse { result, player_id })
            },
            TYPE_RESET => {
                if declared != RESET_FIXED_SIZE {
                    return Err(MalformedControlKind::SizeMismatch {
                        declared,
                        actual: bytes.len(),
                    });
                }
                let cookie = get_u32(bytes, &mut pos);
                let state_data_size = get_u32(bytes, &mut pos);
                let num_players = get_u16(bytes, &mut pos);
                let mut players = Vec::with_capacity(MAX_PLAYERS);
                for _ in 0..MAX_PLAYERS {
                    let controller_port = get_i16(bytes, &mut pos);
                    let nickname = get_padded(bytes, &mut pos, NICKNAME_LEN);
                    let host = get_u32(bytes, &mut pos);
                    let port = get_u16(bytes, &mut pos);
                    if controller_port < 0 {
                        players.push(None);
                    } else {
                        players.push(Some(RosterEntry {
                            controller_port,
                            nickname,
                            addr: SocketAddrV4::new(Ipv4Addr::from(host), port),
                        }));
                    }
                }
                let available = bytes.len() - RESET_FIXED_SIZE;
                if state_data_size as usize > available {
                    return Err(MalformedControlKind::OversizedStateData {
                        declared: state_data_size,
                        available,
                    });
                }
                if (state_data_size as usize) < available {
                    return Err(MalformedControlKind::SizeMismatch {
                        declared: RESET_FIXED_SIZE + state_data_size as usize,
                        actual: bytes.len(),
                    });
                }
                let state_data = bytes[RESET_FIXED_SIZE..].to_vec();
                Ok(Self::Reset(ResetMessage {
                    cookie,
                    num_players,
                    players,
                    state_data,
                }))
            },
            TYPE_RESET_COMPLETE => Ok(Self::ResetComplete {
                cookie: get_u32(bytes, &mut pos),
            }),
            TYPE_RESUME_SESSION => Ok(Self::ResumeSession),
            TYPE_PLAYER_JOINED => Ok(Self::PlayerJoined {
                player_id: get_i16(bytes, &mut pos),
            }),
            TYPE_DROP_PLAYER => {
                let raw = get_u8(bytes, &mut pos);
                let reason =
                    DropReason::from_raw(raw).ok_or(MalformedControlKind::BadFieldValue {
                        field: "reason",
                        raw: raw as u32,
                    })?;
                Ok(Self::DropPlayer {
                    reason,
                    player_id: get_i16(bytes, &mut pos),
                })
            },
            TYPE_RESET_REQUEST => {
                let raw = get_u8(bytes, &mut pos);
                let reason = ResetRequestReason::from_raw(raw).ok_or(
                    MalformedControlKind::BadFieldValue {
                        field: "reason",
                        raw: raw as u32,
                    },
                )?;
                Ok(Self::ResetRequest {
                    reason,
                    causing_player_id: get_i16(bytes, &mut pos),
                })
            },
            TYPE_CLOSE_SESSION => {
                let raw = get_u8(bytes, &mut pos);
                let reason =
                    CloseReason::from_raw(raw).ok_or(MalformedControlKind::BadFieldValue {
                        field: "reason",
                        raw: raw as u32,
                    })?;
                Ok(Self::CloseSession { reason })
            },
            TYPE_CHAT_MESSAGE => {
                let text = String::from_utf8_lossy(&bytes[HEADER_SIZE..declared]).into_owned();
                Ok(Self::Chat { text })
            },
            raw => Err(MalformedControlKind::UnknownType { raw }),
        }
    }
}

/// Whether a decode failure concerns a Reset message. A malformed Reset is
/// fatal to a joiner (it cannot trust its machine state without one), while
/// any other malformed control packet is merely logged and discarded.
#[must_use]
pub fn malformed_concerns_reset(kind: &MalformedControlKind) -> bool {
    match kind {
        MalformedControlKind::OversizedStateData { .. } => true,
        MalformedControlKind::TruncatedBody { msg_type, .. } => *msg_type == TYPE_RESET,
        _ => false,
    }
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_i16(out: &mut Vec<u8>, value: i16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Writes a NUL-padded fixed-width string field, truncating on a UTF-8
/// boundary if necessary.
fn put_padded(out: &mut Vec<u8>, text: &str, width: usize) {
    let clamped = clamp_utf8(text, width);
    out.extend_from_slice(clamped.as_bytes());
    out.resize(out.len() + (width - clamped.len()), 0);
}

fn get_u8(bytes: &[u8], pos: &mut usize) -> u8 {
    let value = bytes.get(*pos).copied().unwrap_or(0);
    *pos += 1;
    value
}

fn get_u16(bytes: &[u8], pos: &mut usize) -> u16 {
    let value = bytes
        .get(*pos..*pos + 2)
        .map(|s| u16::from_le_bytes([s[0], s[1]]))
        .unwrap_or(0);
    *pos += 2;
    value
}

fn get_i16(bytes: &[u8], pos: &mut usize) -> i16 {
    get_u16(bytes, pos) as i16
}

fn get_u32(bytes: &[u8], pos: &mut usize) -> u32 {
    let value = bytes
        .get(*pos..*pos + 4)
        .map(|s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
        .unwrap_or(0);
    *pos += 4;
    value
}

/// Reads a NUL-padded fixed-width string field.
fn get_padded(bytes: &[u8], pos: &mut usize, width: usize) -> String {
    let field = bytes.get(*pos..*pos + width).unwrap_or(&[]);
    *pos += width;
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Truncates to at most `max` bytes without splitting a UTF-8 sequence.
fn clamp_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(msg: &ControlMessage) -> ControlMessage {
        ControlMessage::decode(&msg.encode()).unwrap()
    }

    fn sample_reset(state_len: usize) -> ControlMessage {
        let mut players = vec![None; MAX_PLAYERS];
        players[0] = Some(RosterEntry {
            controller_port: 0,
            nickname: "host".to_owned(),
            addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 37000),
        });
        players[1] = Some(RosterEntry {
            controller_port: 1,
            nickname: "joiner".to_owned(),
            addr: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 37001),
        });
        ControlMessage::Reset(ResetMessage {
            cookie: 1,
            num_players: 2,
            players,
            state_data: (0..state_len).map(|i| (i % 256) as u8).collect(),
        })
    }

    #[test]
    fn connect_request_roundtrip() {
        let msg = ControlMessage::ConnectRequest {
            mode: CONNECT_MODE_PLAYER,
            requested_player_id: -1,
            nickname: "player one".to_owned(),
            password: String::new(),
        };
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn connect_request_has_fixed_wire_size() {
        let msg = ControlMessage::ConnectRequest {
            mode: CONNECT_MODE_PLAYER,
            requested_player_id: 2,
            nickname: "n".to_owned(),
            password: "p".to_owned(),
        };
        assert_eq!(
            msg.encode().len(),
            HEADER_SIZE + 1 + 2 + NICKNAME_LEN + PASSWORD_LEN
        );
    }

    #[test]
    fn reset_roundtrip_preserves_roster_and_state() {
        let msg = sample_reset(100_000);
        match (roundtrip(&msg), msg) {
            (ControlMessage::Reset(a), ControlMessage::Reset(b)) => {
                assert_eq!(a.cookie, b.cookie);
                assert_eq!(a.num_players, b.num_players);
                assert_eq!(a.players, b.players);
                assert_eq!(a.state_data, b.state_data);
            },
            _ => panic!("expected reset"),
        }
    }

    #[test]
    fn reset_header_declares_fixed_portion_only() {
        let bytes = sample_reset(5000).encode();
        let declared = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
        assert_eq!(declared, RESET_FIXED_SIZE);
        assert_eq!(bytes.len(), RESET_FIXED_SIZE + 5000);
    }

    #[test]
    fn reset_with_overdeclared_state_is_rejected() {
        let mut bytes = sample_reset(64).encode();
        // inflate state_data_size past the bytes actually present
        bytes[4..8].copy_from_slice(&1_000_000u32.to_le_bytes());
        match ControlMessage::decode(&bytes) {
            Err(MalformedControlKind::OversizedStateData {
                declared,
                available,
            }) => {
                assert_eq!(declared, 1_000_000);
                assert_eq!(available, 64);
            },
            other => panic!("expected OversizedStateData, got {other:?}"),
        }
    }

    #[test]
    fn truncated_header_is_rejected() {
        assert!(matches!(
            ControlMessage::decode(&[1, 0]),
            Err(MalformedControlKind::TruncatedHeader { len: 2 })
        ));
    }

    #[test]
    fn declared_size_below_fixed_portion_is_rejected() {
        // a ConnectRequest claiming to be header-only
        let mut bytes = vec![0u8; HEADER_SIZE];
        bytes[0..2].copy_from_slice(&0u16.to_le_bytes());
        bytes[2..4].copy_from_slice(&(HEADER_SIZE as u16).to_le_bytes());
        assert!(matches!(
            ControlMessage::decode(&bytes),
            Err(MalformedControlKind::TruncatedBody { .. })
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut bytes = vec![0u8; HEADER_SIZE];
        bytes[0..2].copy_from_slice(&999u16.to_le_bytes());
        bytes[2..4].copy_from_slice(&(HEADER_SIZE as u16).to_le_bytes());
        assert!(matches!(
            ControlMessage::decode(&bytes),
            Err(MalformedControlKind::UnknownType { raw: 999 })
        ));
    }

    #[test]
    fn out_of_range_enum_field_is_rejected() {
        let msg = ControlMessage::CloseSession {
            reason: CloseReason::HostShutdown,
        };
        let mut bytes = msg.encode();
        bytes[HEADER_SIZE] = 77;
        assert!(matches!(
            ControlMessage::decode(&bytes),
            Err(MalformedControlKind::BadFieldValue { field: "reason", .. })
        ));
    }

    #[test]
    fn nickname_longer_than_field_is_truncated() {
        let long = "x".repeat(NICKNAME_LEN + 50);
        let msg = ControlMessage::ConnectRequest {
            mode: CONNECT_MODE_PLAYER,
            requested_player_id: -1,
            nickname: long,
            password: String::new(),
        };
        match roundtrip(&msg) {
            ControlMessage::ConnectRequest { nickname, .. } => {
                assert_eq!(nickname.len(), NICKNAME_LEN);
            },
            _ => panic!("expected connect request"),
        }
    }

    #[test]
    fn chat_size_counts_trailing_text() {
        let msg = ControlMessage::Chat {
            text: "hello there".to_owned(),
        };
        let bytes = msg.encode();
        let declared = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
        assert_eq!(declared, bytes.len());
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn empty_body_messages_roundtrip() {
        assert_eq!(
            roundtrip(&ControlMessage::ResumeSession),
            ControlMessage::ResumeSession
        );
        let msg = ControlMessage::ResetComplete { cookie: 42 };
        assert_eq!(roundtrip(&msg), msg);
    }

    proptest! {
        #[test]
        fn random_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..600)) {
            let _ = ControlMessage::decode(&bytes);
        }

        #[test]
        fn simple_messages_roundtrip(
            player_id in -1i16..4,
            cookie in any::<u32>(),
            text in "[a-zA-Z0-9 ]{0,64}",
        ) {
            let messages = [
                ControlMessage::PlayerJoined { player_id },
                ControlMessage::ResetComplete { cookie },
                ControlMessage::DropPlayer {
                    reason: DropReason::ConnectionLost,
                    player_id,
                },
                ControlMessage::ResetRequest {
                    reason: ResetRequestReason::ConnectionLost,
                    causing_player_id: player_id,
                },
                ControlMessage::Chat { text },
            ];
            for msg in messages {
                prop_assert_eq!(ControlMessage::decode(&msg.encode()).unwrap(), msg);
            }
        }
    }
}
