//! The datagram transport: one non-blocking UDP socket carrying two logical
//! channels to a small set of peers.
//!
//! - [`Channel::Control`] is reliable and ordered: messages are fragmented,
//!   acknowledged, retransmitted, and delivered in send order. Session
//!   management and chat ride here, including multi-megabyte machine
//!   snapshots during resync.
//! - [`Channel::Gameplay`] is unreliable, fire-and-forget datagrams for the
//!   rollback engine's wire protocol, which tolerates loss and reordering by
//!   design.
//!
//! Everything is single-threaded: [`Transport::poll`] reads the socket,
//! drives per-peer timers (handshake resends, retransmits, keepalives,
//! silence timeouts), and sleeps in 2 ms slices until an event arrives or
//! the caller's deadline passes. There is no background task.

mod reliable;

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use web_time::{Duration, Instant};

use crate::error::TransportErrorKind;
use crate::{codec, NetplayError};

use reliable::ReliableChannel;

/// Reassembled control messages larger than this are rejected outright.
pub const MAX_CONTROL_MESSAGE: usize = 64 * 1024 * 1024;

const RECV_BUFFER_SIZE: usize = 2048;
const SYN_RESEND_INTERVAL: Duration = Duration::from_millis(250);
const SYN_RESEND_COUNT: u32 = 20;
const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);
const PEER_TIMEOUT: Duration = Duration::from_secs(10);
const FIN_RESEND_INTERVAL: Duration = Duration::from_millis(300);
const FIN_RESEND_COUNT: u32 = 3;
const POLL_SLICE: Duration = Duration::from_millis(2);

/// One of the two logical channels multiplexed over the socket.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Reliable, ordered. Session management and chat.
    Control,
    /// Unreliable, sequencing left to the payload protocol. Rollback input
    /// exchange.
    Gameplay,
}

/// Opaque handle to a transport peer slot. Handles are stable while the peer
/// is live and may be reused after [`Transport::reset`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerHandle(usize);

impl PeerHandle {
    /// Creates a handle from a raw slot index. Only useful for wiring custom
    /// [`DatagramSink`](crate::rollback::DatagramSink) implementations in
    /// tests and harnesses.
    #[must_use]
    pub const fn new(raw: usize) -> Self {
        PeerHandle(raw)
    }

    /// Returns the raw slot index.
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Connection lifecycle and delivery events returned by [`Transport::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The peer completed its handshake.
    Connected(PeerHandle),
    /// The peer disconnected, timed out, or failed to connect.
    Disconnected(PeerHandle),
    /// A message arrived on `channel`.
    Received {
        /// The originating peer.
        peer: PeerHandle,
        /// The channel the message arrived on.
        channel: Channel,
        /// The complete (reassembled, for control) message payload.
        bytes: Vec<u8>,
    },
}

/// Everything that goes on the wire is one of these envelopes, bincode-coded
/// with fixed-width integers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum Envelope {
    /// Connection request carrying the dialer's nonce.
    Syn { nonce: u32 },
    /// Connection accept echoing the dialer's nonce.
    SynAck { nonce: u32, ack: u32 },
    /// Unreliable gameplay datagram.
    Datagram { payload: Vec<u8> },
    /// One fragment of a reliable control message.
    Fragment {
        seq: u32,
        index: u16,
        count: u16,
        payload: Vec<u8>,
    },
    /// Acknowledges one fragment.
    FragmentAck { seq: u32, index: u16 },
    /// Keeps an idle connection alive.
    KeepAlive,
    /// Graceful teardown request.
    Fin,
    /// Acknowledges a `Fin`.
    FinAck,
}

#[derive(Debug)]
enum PeerPhase {
    Dialing {
        nonce: u32,
        next_resend: Instant,
        resends_left: u32,
    },
    Connected,
    Closing {
        next_resend: Instant,
        resends_left: u32,
    },
}

#[derive(Debug)]
struct PeerState {
    addr: SocketAddr,
    phase: PeerPhase,
    reliable: ReliableChannel,
    last_recv: Instant,
    last_send: Instant,
}

impl PeerState {
    fn new(addr: SocketAddr, phase: PeerPhase, now: Instant) -> Self {
        Self {
            addr,
            phase,
            reliable: ReliableChannel::new(now),
            last_recv: now,
            last_send: now,
        }
    }

    fn is_connected(&self) -> bool {
        matches!(self.phase, PeerPhase::Connected)
    }
}

/// The two-channel UDP endpoint. See the module docs for the model.
#[derive(Debug)]
pub struct Transport {
    socket: UdpSocket,
    max_peers: usize,
    peers: Vec<Option<PeerState>>,
    events: VecDeque<TransportEvent>,
    recv_buffer: [u8; RECV_BUFFER_SIZE],
}

impl Transport {
    /// Binds `0.0.0.0:local_port` in non-blocking mode and prepares a peer
    /// table of `max_peers` slots.
    pub fn start(local_port: u16, max_peers: usize) -> Result<Self, NetplayError> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), local_port);
        let socket = UdpSocket::bind(addr).map_err(|e| {
            warn!(port = local_port, error = %e, "UDP bind failed");
            NetplayError::from(TransportErrorKind::BindFailed { port: local_port })
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|_| NetplayError::from(TransportErrorKind::BindFailed { port: local_port }))?;
        let mut peers = Vec::with_capacity(max_peers);
        peers.resize_with(max_peers, || None);
        Ok(Self {
            socket,
            max_peers,
            peers,
            events: VecDeque::new(),
            recv_buffer: [0; RECV_BUFFER_SIZE],
        })
    }

    /// The local socket address (useful when bound to port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    /// Initiates an outgoing connection. Returns immediately; a
    /// [`TransportEvent::Connected`] (or `Disconnected` on handshake
    /// exhaustion) follows from [`poll`](Self::poll).
    ///
    /// Dialing an address that already occupies a slot returns that slot.
    pub fn dial(&mut self, addr: SocketAddr) -> Result<PeerHandle, NetplayError> {
        if let Some(existing) = self.find_peer(addr) {
            return Ok(existing);
        }
        let now = Instant::now();
        let slot = self
            .peers
            .iter()
            .position(Option::is_none)
            .ok_or(TransportErrorKind::PeerTableFull {
                max_peers: self.max_peers,
            })?;
        let nonce = connect_nonce(&addr);
        let phase = PeerPhase::Dialing {
            nonce,
            next_resend: now + SYN_RESEND_INTERVAL,
            resends_left: SYN_RESEND_COUNT,
        };
        let mut peer = PeerState::new(addr, phase, now);
        Self::transmit(&self.socket, addr, &Envelope::Syn { nonce });
        peer.last_send = now;
        self.peers[slot] = Some(peer);
        debug!(%addr, slot, "dialing peer");
        Ok(PeerHandle(slot))
    }

    /// Returns the handle of the peer at `addr`, if one is live.
    pub fn find_peer(&self, addr: SocketAddr) -> Option<PeerHandle> {
        self.peers
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|p| p.addr == addr))
            .map(PeerHandle)
    }

    /// Returns the remote address of a live peer.
    pub fn peer_addr(&self, peer: PeerHandle) -> Option<SocketAddr> {
        self.peer(peer).map(|p| p.addr)
    }

    /// Returns `true` once the peer's handshake is complete.
    pub fn is_connected(&self, peer: PeerHandle) -> bool {
        self.peer(peer).is_some_and(PeerState::is_connected)
    }

    /// Number of peers in any live phase (dialing, connected, or closing).
    pub fn num_live_peers(&self) -> usize {
        self.peers.iter().flatten().count()
    }

    /// Handles of every fully connected peer.
    pub fn connected_peers(&self) -> Vec<PeerHandle> {
        self.peers
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.as_ref().is_some_and(PeerState::is_connected))
            .map(|(index, _)| PeerHandle(index))
            .collect()
    }

    /// Sends `bytes` to `peer` on `channel`. Control messages are queued into
    /// the reliable channel; gameplay datagrams go straight to the socket.
    pub fn send(
        &mut self,
        peer: PeerHandle,
        channel: Channel,
        bytes: &[u8],
    ) -> Result<(), NetplayError> {
        let socket = &self.socket;
        let state = self
            .peers
            .get_mut(peer.0)
            .and_then(Option::as_mut)
            .ok_or(TransportErrorKind::UnknownPeer)?;
        if !state.is_connected() {
            return Err(TransportErrorKind::NotConnected.into());
        }
        let now = Instant::now();
        match channel {
            Channel::Gameplay => {
                let env = Envelope::Datagram {
                    payload: bytes.to_vec(),
                };
                Self::transmit(socket, state.addr, &env);
            },
            Channel::Control => {
                state.reliable.enqueue(bytes);
                for env in state.reliable.take_transmits(now, true) {
                    Self::transmit(socket, state.addr, &env);
                }
            },
        }
        state.last_send = now;
        Ok(())
    }

    /// Sends `bytes` on `channel` to every connected peer.
    pub fn broadcast(&mut self, channel: Channel, bytes: &[u8]) {
        let handles: Vec<PeerHandle> = self
            .peers
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.as_ref().is_some_and(PeerState::is_connected))
            .map(|(i, _)| PeerHandle(i))
            .collect();
        for handle in handles {
            // best effort; a send failure on one peer must not stop the rest
            let _ = self.send(handle, channel, bytes);
        }
    }

    /// Tears down the connection to `peer`. A graceful disconnect sends a
    /// FIN (retried a few times) and lets the slot drain; a hard disconnect
    /// drops all state immediately without notifying the remote.
    pub fn disconnect(&mut self, peer: PeerHandle, graceful: bool) {
        let Some(state) = self.peers.get_mut(peer.0).and_then(Option::as_mut) else {
            return;
        };
        if graceful && state.is_connected() {
            let now = Instant::now();
            Self::transmit(&self.socket, state.addr, &Envelope::Fin);
            state.phase = PeerPhase::Closing {
                next_resend: now + FIN_RESEND_INTERVAL,
                resends_left: FIN_RESEND_COUNT,
            };
            debug!(%peer, "graceful disconnect initiated");
        } else {
            debug!(%peer, "hard disconnect");
            self.peers[peer.0] = None;
        }
    }

    /// Clears a peer slot so its address can be redialed from scratch.
    pub fn reset(&mut self, peer: PeerHandle) {
        if let Some(slot) = self.peers.get_mut(peer.0) {
            *slot = None;
        }
    }

    /// Abandons every slot still mid-handshake. Used on teardown, where an
    /// unanswered dial would otherwise hold the endpoint open.
    pub fn drop_pending_peers(&mut self) {
        for slot in &mut self.peers {
            if slot
                .as_ref()
                .is_some_and(|p| matches!(p.phase, PeerPhase::Dialing { .. }))
            {
                *slot = None;
            }
        }
    }

    /// Pumps the socket and timers until an event is available or `deadline`
    /// passes. Sleeps in 2 ms slices so retransmits and keepalives keep
    /// flowing while the caller throttles.
    pub fn poll(&mut self, deadline: Instant) -> Option<TransportEvent> {
        loop {
            self.pump();
            if let Some(event) = self.events.pop_front() {
                return Some(event);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let remaining = deadline.saturating_duration_since(now);
            std::thread::sleep(remaining.min(POLL_SLICE));
        }
    }

    /// Reads every pending datagram and drives per-peer timers once. Never
    /// blocks.
    pub fn pump(&mut self) {
        self.read_socket();
        self.drive_timers();
    }

    fn read_socket(&mut self) {
        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((len, src)) => {
                    let Some(bytes) = self.recv_buffer.get(..len) else {
                        continue;
                    };
                    match codec::decode::<Envelope>(bytes, "transport envelope") {
                        Ok(envelope) => self.handle_envelope(src, envelope),
                        Err(_) => {
                            trace!(%src, len, "discarding undecodable datagram");
                        },
                    }
                },
                // no more pending datagrams
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return,
                // ICMP unreachable surfaces as ConnectionReset on some platforms
                Err(ref err) if err.kind() == ErrorKind::ConnectionReset => continue,
                Err(err) => {
                    warn!(error = %err, "socket receive error");
                    return;
                },
            }
        }
    }

    fn handle_envelope(&mut self, src: SocketAddr, envelope: Envelope) {
        let now = Instant::now();
        let known = self.find_peer(src);
        match envelope {
            Envelope::Syn { nonce } => self.handle_syn(src, nonce, known, now),
            Envelope::SynAck { nonce: _, ack } => {
                let Some(handle) = known else { return };
                let Some(state) = self.peer_mut(handle) else {
                    return;
                };
                state.last_recv = now;
                if let PeerPhase::Dialing { nonce, .. } = state.phase {
                    if nonce != ack {
                        trace!(%src, "stale SynAck ignored");
                        return;
                    }
                    state.phase = PeerPhase::Connected;
                    // confirm promptly so the remote's timers see traffic
                    Self::transmit(&self.socket, src, &Envelope::KeepAlive);
                    debug!(%src, %handle, "outbound connection established");
                    self.events.push_back(TransportEvent::Connected(handle));
                }
            },
            Envelope::Datagram { payload } => {
                if let Some(handle) = known {
                    if let Some(state) = self.peer_mut(handle) {
                        state.last_recv = now;
                        if state.is_connected() {
                            self.events.push_back(TransportEvent::Received {
                                peer: handle,
                                channel: Channel::Gameplay,
                                bytes: payload,
                            });
                        }
                    }
                }
            },
            Envelope::Fragment {
                seq,
                index,
                count,
                payload,
            } => {
                let Some(handle) = known else { return };
                let socket = &self.socket;
                let Some(state) = self.peers.get_mut(handle.0).and_then(Option::as_mut) else {
                    return;
                };
                state.last_recv = now;
                let mut acks = Vec::new();
                let mut completed = Vec::new();
                state
                    .reliable
                    .on_fragment(seq, index, count, payload, &mut acks, &mut completed);
                for ack in &acks {
                    Self::transmit(socket, state.addr, ack);
                }
                state.last_send = now;
                for bytes in completed {
                    self.events.push_back(TransportEvent::Received {
                        peer: handle,
                        channel: Channel::Control,
                        bytes,
                    });
                }
            },
            Envelope::FragmentAck { seq, index } => {
                if let Some(handle) = known {
                    if let Some(state) = self.peer_mut(handle) {
                        state.last_recv = now;
                        state.reliable.on_ack(seq, index);
                    }
                }
            },
            Envelope::KeepAlive => {
                if let Some(handle) = known {
                    if let Some(state) = self.peer_mut(handle) {
                        state.last_recv = now;
                    }
                }
            },
            Envelope::Fin => {
                Self::transmit(&self.socket, src, &Envelope::FinAck);
                if let Some(handle) = known {
                    debug!(%src, %handle, "peer closed connection");
                    self.peers[handle.0] = None;
                    self.events.push_back(TransportEvent::Disconnected(handle));
                }
            },
            Envelope::FinAck => {
                if let Some(handle) = known {
                    let closing = self
                        .peer(handle)
                        .is_some_and(|p| matches!(p.phase, PeerPhase::Closing { .. }));
                    if closing {
                        self.peers[handle.0] = None;
                    }
                }
            },
        }
    }

    fn handle_syn(&mut self, src: SocketAddr, nonce: u32, known: Option<PeerHandle>, now: Instant) {
        match known {
            Some(handle) => {
                let Some(state) = self.peers.get_mut(handle.0).and_then(Option::as_mut) else {
                    return;
                };
                state.last_recv = now;
                match state.phase {
                    // simultaneous dial: both sides sent a Syn; accept theirs
                    PeerPhase::Dialing { nonce: ours, .. } => {
                        Self::transmit(
                            &self.socket,
                            src,
                            &Envelope::SynAck {
                                nonce: ours,
                                ack: nonce,
                            },
                        );
                        state.phase = PeerPhase::Connected;
                        state.last_send = now;
                        debug!(%src, "simultaneous dial resolved");
                        self.events.push_back(TransportEvent::Connected(handle));
                    },
                    // duplicate Syn from a retransmit: re-accept
                    PeerPhase::Connected => {
                        Self::transmit(
                            &self.socket,
                            src,
                            &Envelope::SynAck {
                                nonce: 0,
                                ack: nonce,
                            },
                        );
                        state.last_send = now;
                    },
                    PeerPhase::Closing { .. } => {},
                }
            },
            None => {
                let Some(slot) = self.peers.iter().position(Option::is_none) else {
                    debug!(%src, "rejecting inbound connection, peer table full");
                    return;
                };
                let mut peer = PeerState::new(src, PeerPhase::Connected, now);
                Self::transmit(
                    &self.socket,
                    src,
                    &Envelope::SynAck {
                        nonce: connect_nonce(&src),
                        ack: nonce,
                    },
                );
                peer.last_send = now;
                self.peers[slot] = Some(peer);
                debug!(%src, slot, "accepted inbound connection");
                self.events.push_back(TransportEvent::Connected(PeerHandle(slot)));
            },
        }
    }

    fn drive_timers(&mut self) {
        let now = Instant::now();
        let socket = &self.socket;
        for index in 0..self.peers.len() {
            let Some(state) = self.peers[index].as_mut() else {
                continue;
            };
            let mut drop_slot = false;
            let mut disconnected_event = false;
            match &mut state.phase {
                PeerPhase::Dialing {
                    nonce,
                    next_resend,
                    resends_left,
                } => {
                    if now >= *next_resend {
                        if *resends_left == 0 {
                            debug!(addr = %state.addr, "dial exhausted, giving up");
                            drop_slot = true;
                            disconnected_event = true;
                        } else {
                            Self::transmit(socket, state.addr, &Envelope::Syn { nonce: *nonce });
                            *next_resend = now + SYN_RESEND_INTERVAL;
                            *resends_left -= 1;
                            state.last_send = now;
                        }
                    }
                },
                PeerPhase::Connected => {
                    if now.saturating_duration_since(state.last_recv) >= PEER_TIMEOUT {
                        debug!(addr = %state.addr, "peer timed out");
                        drop_slot = true;
                        disconnected_event = true;
                    } else {
                        for env in state.reliable.take_transmits(now, false) {
                            Self::transmit(socket, state.addr, &env);
                            state.last_send = now;
                        }
                        if now.saturating_duration_since(state.last_send) >= KEEPALIVE_INTERVAL {
                            Self::transmit(socket, state.addr, &Envelope::KeepAlive);
                            state.last_send = now;
                        }
                    }
                },
                PeerPhase::Closing {
                    next_resend,
                    resends_left,
                } => {
                    if now >= *next_resend {
                        if *resends_left == 0 {
                            drop_slot = true;
                        } else {
                            Self::transmit(socket, state.addr, &Envelope::Fin);
                            *next_resend = now + FIN_RESEND_INTERVAL;
                            *resends_left -= 1;
                            state.last_send = now;
                        }
                    }
                },
            }
            if drop_slot {
                self.peers[index] = None;
                if disconnected_event {
                    self.events
                        .push_back(TransportEvent::Disconnected(PeerHandle(index)));
                }
            }
        }
    }

    fn peer(&self, handle: PeerHandle) -> Option<&PeerState> {
        self.peers.get(handle.0).and_then(Option::as_ref)
    }

    fn peer_mut(&mut self, handle: PeerHandle) -> Option<&mut PeerState> {
        self.peers.get_mut(handle.0).and_then(Option::as_mut)
    }

    /// Fire-and-forget datagram send. UDP drops are expected behavior; a
    /// failed send is logged and forgotten.
    fn transmit(socket: &UdpSocket, addr: SocketAddr, envelope: &Envelope) {
        let Ok(bytes) = codec::encode(envelope, "transport envelope") else {
            return;
        };
        if let Err(e) = socket.send_to(&bytes, addr) {
            trace!(%addr, error = %e, "datagram send failed");
        }
    }
}

impl crate::rollback::DatagramSink for Transport {
    fn send_datagram(&mut self, peer: PeerHandle, bytes: &[u8]) {
        let _ = self.send(peer, Channel::Gameplay, bytes);
    }
}

/// Derives a connection nonce from per-process hasher randomness and the
/// destination address. This only disambiguates stale handshakes; it is not
/// a security boundary.
fn connect_nonce(addr: &SocketAddr) -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hash, Hasher};

    let mut hasher = RandomState::new().build_hasher();
    addr.hash(&mut hasher);
    let bits = hasher.finish();
    (bits ^ (bits >> 32)) as u32
}
