//! The session runner: the outer loop that owns everything.
//!
//! A [`NetplaySession`] ties the pieces together. It owns the transport, the
//! host-authoritative roster, the rollback engine, the snapshot pool, and
//! the frame pacer, and it is the *only* component allowed to change the
//! top-level [`SessionState`]. Everything below it reports upward by return
//! value or event.
//!
//! The whole session runs on one thread. Each pass of
//! [`execute`](NetplaySession::execute) dispatches on the current state:
//! connecting retries the host dial, resetting drives the cookie handshake,
//! running executes one rollback-paced frame, and closing drains the
//! transport. Waiting never happens anywhere except the transport's
//! deadline poll and the pacer's 2 ms sleep slices, so control and gameplay
//! traffic keeps flowing while the simulation throttles.

mod pacer;
mod roster;

pub use pacer::FramePacer;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use tracing::{debug, info, trace, warn};
use web_time::{Duration, Instant};

use crate::control::{
    self, CloseReason, ConnectResult, ControlMessage, DropReason, ResetMessage,
    ResetRequestReason, RosterEntry, CONNECT_MODE_PLAYER,
};
use crate::error::TransportErrorKind;
use crate::input::{sample_local_input, InputProvider};
use crate::machine::{HostInterface, Machine, SettingsOverlay};
use crate::rollback::{
    AdvanceFlags, PlayerKind, RollbackConfig, RollbackEvent, RollbackHandler, RollbackSession,
    Snapshot, SnapshotPool,
};
use crate::transport::{Channel, PeerHandle, Transport, TransportEvent};
use crate::{
    Frame, InputStatus, NetplayError, NetplayInput, PlayerId, SessionState, CHECKSUM_WINDOW,
    DEFAULT_LOCAL_DELAY, MAX_PLAYERS, MAX_ROLLBACK_FRAMES, NUM_CHECKSUM_GROUPS,
};

use roster::{PeerSlot, ResetBitset, Roster};

/// Wall-clock budget for connecting to the host, and for the host's side of
/// a resync.
pub const MAX_CONNECT_TIME: Duration = Duration::from_secs(15);

/// Redials attempted within [`MAX_CONNECT_TIME`] before giving up.
pub const MAX_CONNECT_RETRIES: u32 = 4;

/// Drain budget for a closing session before state goes Inactive regardless.
pub const MAX_CLOSE_TIME: Duration = Duration::from_secs(3);

/// Poll slice used by the non-running states.
const IDLE_POLL_SLICE: Duration = Duration::from_millis(10);

/// Frames between perf-counter log lines.
const PERF_LOG_INTERVAL: u64 = 600;

/// Session parameters. [`SessionOptions::default`] matches the shipping
/// configuration; tests shrink the timeouts.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Local player's nickname.
    pub nickname: String,
    /// UDP port to bind (0 for ephemeral).
    pub local_port: u16,
    /// Session password. Carried on the wire; not enforced.
    pub password: String,
    /// Maximum players the host admits (capped at [`MAX_PLAYERS`]).
    pub max_players: usize,
    /// Local input delay in frames.
    pub local_delay: usize,
    /// Connect budget; defaults to [`MAX_CONNECT_TIME`].
    pub connect_timeout: Duration,
    /// Redial attempts within the connect budget.
    pub connect_retries: u32,
    /// Close drain budget; defaults to [`MAX_CLOSE_TIME`].
    pub close_timeout: Duration,
    /// Desync checksum interval in confirmed frames (0 disables).
    pub checksum_interval: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            nickname: "Player".to_owned(),
            local_port: 0,
            password: String::new(),
            max_players: MAX_PLAYERS,
            local_delay: DEFAULT_LOCAL_DELAY,
            connect_timeout: MAX_CONNECT_TIME,
            connect_retries: MAX_CONNECT_RETRIES,
            close_timeout: MAX_CLOSE_TIME,
            checksum_interval: 30,
        }
    }
}

/// 32-bit FNV-1a over a 16 KiB window of the snapshot, seeded with the frame
/// number. The window slides through [`NUM_CHECKSUM_GROUPS`] positions as
/// frames advance so that, over time, the whole head of the snapshot gets
/// compared across peers without hashing megabytes every frame. Windows past
/// the end of a short snapshot clamp to its tail.
#[must_use]
pub fn state_checksum(frame: Frame, data: &[u8]) -> u32 {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;

    let group = frame.as_i32().max(0) as usize % NUM_CHECKSUM_GROUPS;
    let start = (group * CHECKSUM_WINDOW).min(data.len());
    let end = (start + CHECKSUM_WINDOW).min(data.len());

    let mut hash = FNV_OFFSET;
    for byte in frame.as_i32().to_le_bytes() {
        hash = (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME);
    }
    for &byte in &data[start..end] {
        hash = (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME);
    }
    hash
}

#[derive(Debug, Default)]
struct PerfCounters {
    frames: u64,
    rollbacks: u64,
    replayed_frames: u64,
    last_logged: u64,
}

impl PerfCounters {
    fn maybe_log(&mut self) {
        if self.frames >= self.last_logged + PERF_LOG_INTERVAL {
            debug!(
                frames = self.frames,
                rollbacks = self.rollbacks,
                replayed_frames = self.replayed_frames,
                "netplay perf"
            );
            self.last_logged = self.frames;
        }
    }
}

/// The borrowed view of the session the rollback engine calls back into.
/// Splitting the borrows out of the session struct lets the engine hold
/// `&mut self` while its callbacks drive the machine and pool.
struct RunnerHandler<'a, M> {
    machine: &'a mut M,
    pool: &'a mut SnapshotPool,
    muted: &'a mut bool,
    ports: &'a [usize],
    events: &'a mut Vec<RollbackEvent>,
    counters: &'a mut PerfCounters,
}

impl<M: Machine> RollbackHandler for RunnerHandler<'_, M> {
    fn save_frame(&mut self, frame: Frame) -> Result<Snapshot, NetplayError> {
        let mut data = self.pool.acquire();
        self.machine.save_state(&mut data)?;
        let checksum = state_checksum(frame, &data);
        Ok(Snapshot {
            frame,
            data,
            checksum,
        })
    }

    fn load_frame(
        &mut self,
        snapshot: &Snapshot,
        rollback_depth: usize,
    ) -> Result<(), NetplayError> {
        trace!(frame = %snapshot.frame, rollback_depth, "restoring snapshot");
        self.machine.load_state(&snapshot.data)?;
        // replayed frames must not be audible
        if !*self.muted {
            self.machine.set_audio_muted(true);
            *self.muted = true;
        }
        self.counters.rollbacks += 1;
        Ok(())
    }

    fn advance_frame(&mut self, inputs: &[(NetplayInput, InputStatus)], flags: AdvanceFlags) {
        for (index, (input, _)) in inputs.iter().enumerate() {
            let port = self.ports.get(index).copied().unwrap_or(index);
            self.machine.set_pad(port, *input);
        }
        self.machine.run_frame();
        if flags.rollback {
            self.counters.replayed_frames += 1;
        } else {
            if *self.muted {
                self.machine.set_audio_muted(false);
                *self.muted = false;
            }
            self.counters.frames += 1;
        }
    }

    fn free_buffer(&mut self, snapshot: Snapshot) {
        self.pool.release(snapshot.data);
    }

    fn on_event(&mut self, event: RollbackEvent) {
        self.events.push(event);
    }
}

/// One netplay session, created by [`create_session`] or [`join_session`]
/// and driven by [`execute`] until it returns to
/// [`SessionState::Inactive`].
///
/// [`create_session`]: NetplaySession::create_session
/// [`join_session`]: NetplaySession::join_session
/// [`execute`]: NetplaySession::execute
pub struct NetplaySession<M, H, I> {
    machine: M,
    host: H,
    input: I,
    options: SessionOptions,

    state: SessionState,
    transport: Option<Transport>,
    roster: Roster,
    /// `MAX_PLAYERS` is the not-yet-assigned sentinel for a joiner that has
    /// not received its ConnectResponse; it can never collide with a real
    /// id and it is never zero, so `is_host` stays truthful throughout.
    local_player_id: PlayerId,

    reset_cookie: u32,
    reset_players: ResetBitset,
    reset_complete_sent: bool,
    resetting_since: Instant,

    host_addr: Option<SocketAddr>,
    host_peer: Option<PeerHandle>,
    connect_started: Instant,
    next_dial_time: Instant,
    dials_attempted: u32,

    rollback: Option<RollbackSession>,
    roster_id_by_engine: Vec<PlayerId>,
    port_map: Vec<usize>,
    local_engine_player: PlayerId,
    pool: SnapshotPool,
    pacer: FramePacer,
    audio_muted: bool,
    counters: PerfCounters,

    close_deadline: Option<Instant>,
    fatal_error: Option<NetplayError>,
}

impl<M: Machine, H: HostInterface, I: InputProvider> NetplaySession<M, H, I> {
    /// Creates and hosts a session. On success the session is already
    /// [`SessionState::Running`] with one player.
    pub fn create_session(
        machine: M,
        host: H,
        input: I,
        options: SessionOptions,
    ) -> Result<Self, NetplayError> {
        let mut session = Self::new_inactive(machine, host, input, options);
        if let Err(error) = session.start_host() {
            session.host.set_settings_layer(None);
            return Err(error);
        }
        Ok(session)
    }

    /// Creates a session joining the host at `host_addr`. The connect
    /// handshake runs inside [`execute`](Self::execute).
    pub fn join_session(
        machine: M,
        host: H,
        input: I,
        host_addr: SocketAddr,
        options: SessionOptions,
    ) -> Result<Self, NetplayError> {
        let mut session = Self::new_inactive(machine, host, input, options);
        if let Err(error) = session.start_joiner(host_addr) {
            session.host.set_settings_layer(None);
            return Err(error);
        }
        Ok(session)
    }

    fn new_inactive(machine: M, host: H, input: I, options: SessionOptions) -> Self {
        let now = Instant::now();
        let pacer = FramePacer::new(machine.nominal_frame_rate());
        Self {
            machine,
            host,
            input,
            options,
            state: SessionState::Inactive,
            transport: None,
            roster: Roster::new(),
            local_player_id: PlayerId::new(MAX_PLAYERS),
            reset_cookie: 0,
            reset_players: ResetBitset::default(),
            reset_complete_sent: false,
            resetting_since: now,
            host_addr: None,
            host_peer: None,
            connect_started: now,
            next_dial_time: now,
            dials_attempted: 0,
            rollback: None,
            roster_id_by_engine: Vec::new(),
            port_map: Vec::new(),
            local_engine_player: PlayerId::HOST,
            pool: SnapshotPool::new(),
            pacer,
            audio_muted: false,
            counters: PerfCounters::default(),
            close_deadline: None,
            fatal_error: None,
        }
    }

    fn start_host(&mut self) -> Result<(), NetplayError> {
        info!(port = self.options.local_port, "creating netplay session");
        self.state = SessionState::Initializing;
        self.host
            .set_settings_layer(Some(SettingsOverlay::for_session()));
        let transport = Transport::start(self.options.local_port, MAX_PLAYERS)?;
        let local_addr = transport.local_addr().unwrap_or_else(|| {
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), self.options.local_port)
        });
        self.transport = Some(transport);
        self.local_player_id = PlayerId::HOST;
        self.roster.occupy(
            PlayerId::HOST,
            PeerSlot {
                nickname: self.options.nickname.clone(),
                addr: local_addr,
                peer: None,
            },
        );
        self.reset_players = ResetBitset::only(PlayerId::HOST);
        self.start_rollback_from_roster()?;
        self.state = SessionState::Running;
        self.host_message("Session created, waiting for players.");
        Ok(())
    }

    fn start_joiner(&mut self, host_addr: SocketAddr) -> Result<(), NetplayError> {
        info!(%host_addr, "joining netplay session");
        self.state = SessionState::Initializing;
        self.host
            .set_settings_layer(Some(SettingsOverlay::for_session()));
        let mut transport = Transport::start(self.options.local_port, MAX_PLAYERS)?;
        self.host_peer = Some(transport.dial(host_addr)?);
        self.host_addr = Some(host_addr);
        self.transport = Some(transport);
        self.dials_attempted = 1;
        self.connect_started = Instant::now();
        self.next_dial_time = self.connect_started + self.dial_interval();
        self.state = SessionState::Connecting;
        self.host
            .display_loading_screen("Connecting to server...", None);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Public API
    // ------------------------------------------------------------------

    /// Runs the outer loop until the session returns to
    /// [`SessionState::Inactive`]. Returns the fatal error if the session
    /// ended because of one.
    pub fn execute(&mut self) -> Result<(), NetplayError> {
        while self.state != SessionState::Inactive {
            self.step();
        }
        match self.fatal_error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Runs one iteration of the outer loop. [`execute`](Self::execute) is
    /// a loop around this; tests drive sessions step by step.
    pub fn step(&mut self) {
        match self.state {
            SessionState::Inactive | SessionState::Initializing => {},
            SessionState::Connecting => self.step_connecting(),
            SessionState::Resetting => self.step_resetting(),
            SessionState::Running => self.step_running(),
            SessionState::ClosingSession => self.step_closing(),
        }
        self.host.pump_messages();
    }

    /// Sends a chat line to every peer and echoes it locally.
    pub fn send_chat_message(&mut self, text: &str) {
        if !self.is_active() || text.is_empty() {
            return;
        }
        let message = ControlMessage::Chat {
            text: text.to_owned(),
        };
        self.broadcast_control(&message);
        let line = format!("{}: {}", self.options.nickname, text);
        self.host_message(&line);
    }

    /// `true` while a session exists in any state.
    pub fn is_active(&self) -> bool {
        self.state != SessionState::Inactive
    }

    /// `true` if the local peer is the host (player 0).
    pub fn is_host(&self) -> bool {
        self.local_player_id.is_host()
    }

    /// The current top-level state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of players in the roster.
    pub fn num_players(&self) -> usize {
        self.roster.num_players()
    }

    /// The local player's id. Meaningless before a joiner is admitted.
    pub fn local_player_id(&self) -> PlayerId {
        self.local_player_id
    }

    /// The transport's local socket address (useful when bound to port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref().and_then(Transport::local_addr)
    }

    /// Estimated round trip time to the first remote peer.
    pub fn ping(&self) -> Duration {
        let Some(rollback) = self.rollback.as_ref() else {
            return Duration::ZERO;
        };
        for rank in 0..self.roster_id_by_engine.len() {
            let engine_player = PlayerId::new(rank);
            if engine_player == self.local_engine_player {
                continue;
            }
            if let Ok(stats) = rollback.network_stats(engine_player) {
                return stats.ping;
            }
        }
        Duration::ZERO
    }

    // ------------------------------------------------------------------
    // State steps
    // ------------------------------------------------------------------

    fn dial_interval(&self) -> Duration {
        self.options.connect_timeout / (self.options.connect_retries + 1)
    }

    fn step_connecting(&mut self) {
        let now = Instant::now();
        if now.saturating_duration_since(self.connect_started) >= self.options.connect_timeout {
            self.fail_session("Connection failed", NetplayError::ConnectTimeout);
            return;
        }
        if now >= self.next_dial_time && self.dials_attempted <= self.options.connect_retries {
            if let (Some(transport), Some(addr)) = (self.transport.as_mut(), self.host_addr) {
                if let Some(peer) = self.host_peer.take() {
                    transport.reset(peer);
                }
                debug!(attempt = self.dials_attempted + 1, "redialing host");
                self.host_peer = transport.dial(addr).ok();
                self.dials_attempted += 1;
            }
            self.next_dial_time = now + self.dial_interval();
        }
        let deadline = (now + IDLE_POLL_SLICE).min(self.next_dial_time);
        self.poll_and_dispatch(deadline);
    }

    fn step_resetting(&mut self) {
        let now = Instant::now();
        if self.is_host() {
            if now.saturating_duration_since(self.resetting_since) >= self.options.connect_timeout
            {
                warn!("resync timed out, dropping unresponsive peers");
                let laggards: Vec<PlayerId> = self
                    .roster
                    .occupied_ids()
                    .filter(|&id| !self.reset_players.contains(id))
                    .collect();
                for id in laggards {
                    if let Some(slot) = self.roster.clear(id) {
                        self.host_message(&format!("{} timed out.", slot.nickname));
                        self.broadcast_control(&ControlMessage::DropPlayer {
                            reason: DropReason::ResyncTimeout,
                            player_id: id.as_usize() as i16,
                        });
                        if let (Some(transport), Some(peer)) = (self.transport.as_mut(), slot.peer)
                        {
                            transport.disconnect(peer, false);
                        }
                    }
                }
                self.begin_reset();
                return;
            }
            self.check_reset_complete();
        } else {
            if now.saturating_duration_since(self.resetting_since)
                >= self.options.connect_timeout * 2
            {
                self.fail_session(
                    "Session synchronization timed out",
                    NetplayError::ConnectTimeout,
                );
                return;
            }
            self.check_joiner_mesh();
        }
        self.poll_and_dispatch(Instant::now() + IDLE_POLL_SLICE);
    }

    fn step_running(&mut self) {
        // throttle: advance the frame deadline, then keep draining the
        // transport until it passes so the wire never starves
        let current = self
            .rollback
            .as_ref()
            .map_or(Frame::new(0), RollbackSession::current_frame);
        self.pacer.tick(current);
        let skipped = self.pacer.advance_deadline();
        let deadline = if skipped {
            Instant::now()
        } else {
            self.pacer.deadline()
        };
        self.poll_and_dispatch(deadline);
        if self.state != SessionState::Running {
            return;
        }

        let local_input = sample_local_input(&mut self.input);
        let mut events: Vec<RollbackEvent> = Vec::new();
        let outcome: Result<(), NetplayError> = {
            let Some(rollback) = self.rollback.as_mut() else {
                return;
            };
            let local_player = self.local_engine_player;
            let mut handler = RunnerHandler {
                machine: &mut self.machine,
                pool: &mut self.pool,
                muted: &mut self.audio_muted,
                ports: &self.port_map,
                events: &mut events,
                counters: &mut self.counters,
            };
            rollback.idle(&mut handler).and_then(|()| {
                match rollback.add_local_input(local_player, local_input) {
                    Ok(()) => rollback.advance_frame(&mut handler),
                    // window exhausted or engine still synchronizing:
                    // skip this frame and keep polling
                    Err(NetplayError::PredictionThreshold)
                    | Err(NetplayError::NotSynchronized) => Ok(()),
                    Err(error) => Err(error),
                }
            })
        };
        if let Err(error) = outcome {
            warn!(%error, "frame execution failed");
            self.host.report_error(
                "Netplay Error",
                "The netplay session encountered a fatal error and will close.",
            );
            self.fatal_error = Some(error);
            self.enter_closing(CloseReason::Terminated, true);
            return;
        }

        self.process_rollback_events(events);
        if self.state != SessionState::Running {
            return;
        }

        if let (Some(rollback), Some(transport)) =
            (self.rollback.as_mut(), self.transport.as_mut())
        {
            rollback.network_idle(transport);
        }
        self.host.present_frame();
        self.counters.maybe_log();
    }

    fn step_closing(&mut self) {
        let now = Instant::now();
        let deadline = self.close_deadline.unwrap_or(now);
        let all_gone = self
            .transport
            .as_ref()
            .map_or(true, |t| t.num_live_peers() == 0);
        if all_gone || now >= deadline {
            self.teardown();
            return;
        }
        self.poll_and_dispatch((now + IDLE_POLL_SLICE).min(deadline));
    }

    // ------------------------------------------------------------------
    // Transport dispatch
    // ------------------------------------------------------------------

    fn poll_and_dispatch(&mut self, deadline: Instant) {
        loop {
            let event = match self.transport.as_mut() {
                Some(transport) => transport.poll(deadline),
                None => return,
            };
            match event {
                Some(event) => self.handle_transport_event(event),
                None => return,
            }
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Received {
                peer,
                channel: Channel::Gameplay,
                bytes,
            } => {
                if let Some(rollback) = self.rollback.as_mut() {
                    rollback.handle_packet(peer, &bytes);
                }
            },
            TransportEvent::Received {
                peer,
                channel: Channel::Control,
                bytes,
            } => self.handle_control_bytes(peer, &bytes),
            TransportEvent::Connected(peer) => self.handle_peer_connected(peer),
            TransportEvent::Disconnected(peer) => self.handle_peer_disconnected(peer),
        }
    }

    fn handle_peer_connected(&mut self, peer: PeerHandle) {
        match self.state {
            SessionState::Connecting if Some(peer) == self.host_peer => {
                debug!("connected to host, requesting admission");
                let message = ControlMessage::ConnectRequest {
                    mode: CONNECT_MODE_PLAYER,
                    requested_player_id: -1,
                    nickname: self.options.nickname.clone(),
                    password: self.options.password.clone(),
                };
                self.send_control(peer, &message);
                self.host
                    .display_loading_screen("Waiting for server response...", None);
            },
            SessionState::Resetting | SessionState::Running => {
                // bind the mesh connection to its roster slot
                let addr = self.transport.as_ref().and_then(|t| t.peer_addr(peer));
                if let Some(addr) = addr {
                    if let Some(id) = self.roster.player_by_addr(addr) {
                        if id != self.local_player_id {
                            if let Some(slot) = self.roster.get_mut(id) {
                                slot.peer = Some(peer);
                            }
                        }
                    }
                }
            },
            _ => {},
        }
    }

    fn handle_peer_disconnected(&mut self, peer: PeerHandle) {
        match self.state {
            SessionState::Connecting => {
                // dial failed; the redial timer in step_connecting retries
                if Some(peer) == self.host_peer {
                    self.host_peer = None;
                }
            },
            SessionState::Resetting | SessionState::Running => {
                if Some(peer) == self.host_peer && !self.is_host() {
                    self.fail_session(
                        "Lost connection to host",
                        NetplayError::PeerDropped {
                            player: PlayerId::HOST,
                        },
                    );
                    return;
                }
                let Some(id) = self.roster.player_by_peer(peer) else {
                    return;
                };
                if let Some(slot) = self.roster.get_mut(id) {
                    slot.peer = None;
                }
                self.peer_lost(id);
            },
            _ => {},
        }
    }

    // ------------------------------------------------------------------
    // Control protocol
    // ------------------------------------------------------------------

    fn handle_control_bytes(&mut self, peer: PeerHandle, bytes: &[u8]) {
        match ControlMessage::decode(bytes) {
            Ok(message) => self.handle_control_message(peer, message),
            Err(kind) => {
                if control::malformed_concerns_reset(&kind) && !self.is_host() {
                    warn!(?kind, "malformed reset, closing session");
                    self.host.report_error(
                        "Netplay Error",
                        "Received an invalid session state from the host.",
                    );
                    self.fatal_error = Some(kind.into());
                    self.enter_closing(CloseReason::Terminated, true);
                } else {
                    warn!(%peer, ?kind, "discarding malformed control packet");
                }
            },
        }
    }

    fn handle_control_message(&mut self, peer: PeerHandle, message: ControlMessage) {
        match message {
            ControlMessage::ConnectRequest {
                mode,
                requested_player_id,
                nickname,
                password,
            } => self.handle_connect_request(peer, mode, requested_player_id, nickname, &password),
            ControlMessage::ConnectResponse { result, player_id } => {
                self.handle_connect_response(peer, result, player_id)
            },
            ControlMessage::Reset(reset) => self.process_reset(reset),
            ControlMessage::ResetComplete { cookie } => self.handle_reset_complete(peer, cookie),
            ControlMessage::ResumeSession => self.handle_resume(),
            ControlMessage::PlayerJoined { player_id } => {
                if !self.is_host() && player_id >= 0 {
                    // the roster-bearing reset precedes this on the ordered
                    // channel, so the nickname is already known
                    let name = self
                        .roster
                        .get(PlayerId::new(player_id as usize))
                        .map(|slot| slot.nickname.clone());
                    match name {
                        Some(name) => {
                            self.host_message(&format!("{name} joined the session."))
                        },
                        None => debug!(player_id, "player joined notification"),
                    }
                }
            },
            ControlMessage::DropPlayer { reason, player_id } => {
                self.handle_drop_player(reason, player_id)
            },
            ControlMessage::ResetRequest {
                reason,
                causing_player_id,
            } => self.handle_reset_request(peer, reason, causing_player_id),
            ControlMessage::CloseSession { reason } => {
                info!(?reason, "received session close");
                self.host_message(match reason {
                    CloseReason::HostShutdown => "The host closed the session.",
                    CloseReason::Terminated => "The session was terminated.",
                });
                self.enter_closing(reason, false);
            },
            ControlMessage::Chat { text } => {
                let who = self
                    .roster
                    .player_by_peer(peer)
                    .and_then(|id| self.roster.get(id))
                    .map_or_else(|| "?".to_owned(), |slot| slot.nickname.clone());
                self.host_message(&format!("{who}: {text}"));
            },
        }
    }

    fn handle_connect_request(
        &mut self,
        peer: PeerHandle,
        mode: u8,
        requested_player_id: i16,
        nickname: String,
        password: &str,
    ) {
        if !self.is_host() {
            warn!("ignoring connect request, not hosting");
            return;
        }
        if mode != CONNECT_MODE_PLAYER {
            self.send_control(
                peer,
                &ControlMessage::ConnectResponse {
                    result: ConnectResult::SessionClosed,
                    player_id: -1,
                },
            );
            return;
        }
        // the password travels on the wire but is not enforced
        if !self.options.password.is_empty() && password != self.options.password {
            debug!("session password mismatch (not enforced)");
        }
        if self.roster.num_players() >= self.options.max_players.min(MAX_PLAYERS) {
            self.send_control(
                peer,
                &ControlMessage::ConnectResponse {
                    result: ConnectResult::ServerFull,
                    player_id: -1,
                },
            );
            return;
        }
        let assigned = if requested_player_id >= 0 {
            let requested = PlayerId::new(requested_player_id as usize);
            if requested_player_id as usize >= MAX_PLAYERS {
                self.roster.lowest_free_id()
            } else if self.roster.get(requested).is_some() {
                self.send_control(
                    peer,
                    &ControlMessage::ConnectResponse {
                        result: ConnectResult::PlayerIdInUse,
                        player_id: -1,
                    },
                );
                return;
            } else {
                Some(requested)
            }
        } else {
            self.roster.lowest_free_id()
        };
        let Some(id) = assigned else {
            self.send_control(
                peer,
                &ControlMessage::ConnectResponse {
                    result: ConnectResult::ServerFull,
                    player_id: -1,
                },
            );
            return;
        };
        let Some(addr) = self.transport.as_ref().and_then(|t| t.peer_addr(peer)) else {
            return;
        };

        info!(%id, %nickname, %addr, "admitting player");
        self.roster.occupy(
            id,
            PeerSlot {
                nickname: nickname.clone(),
                addr,
                peer: Some(peer),
            },
        );
        self.send_control(
            peer,
            &ControlMessage::ConnectResponse {
                result: ConnectResult::Success,
                player_id: id.as_usize() as i16,
            },
        );
        self.host_message(&format!("{nickname} joined the session."));
        self.begin_reset();
        // pre-existing peers learn about the newcomer after the reset that
        // includes it; the newcomer learns the roster from the reset itself
        let joined = ControlMessage::PlayerJoined {
            player_id: id.as_usize() as i16,
        };
        let recipients: Vec<PeerHandle> = self
            .roster
            .occupied_ids()
            .filter(|&other| other != id && other != self.local_player_id)
            .filter_map(|other| self.roster.get(other).and_then(|slot| slot.peer))
            .collect();
        for recipient in recipients {
            self.send_control(recipient, &joined);
        }
    }

    fn handle_connect_response(
        &mut self,
        peer: PeerHandle,
        result: ConnectResult,
        player_id: i16,
    ) {
        if self.state != SessionState::Connecting || Some(peer) != self.host_peer {
            warn!("unexpected connect response discarded");
            return;
        }
        match result {
            ConnectResult::Success
                if player_id > 0 && (player_id as usize) < MAX_PLAYERS =>
            {
                info!(player_id, "admitted to session");
                self.local_player_id = PlayerId::new(player_id as usize);
                self.reset_complete_sent = false;
                self.resetting_since = Instant::now();
                self.state = SessionState::Resetting;
                self.host
                    .display_loading_screen("Waiting for session state...", None);
            },
            ConnectResult::Success => {
                self.fail_session(
                    "Connection failed",
                    NetplayError::ConnectRejected {
                        reason: ConnectResult::SessionClosed,
                    },
                );
            },
            reason => {
                self.fail_session(
                    "Connection rejected",
                    NetplayError::ConnectRejected { reason },
                );
            },
        }
    }

    /// Host side of a resync: serialize, reload, broadcast, and wait for
    /// acknowledgements.
    fn begin_reset(&mut self) {
        if !self.is_host() {
            return;
        }
        self.reset_cookie += 1;
        debug!(cookie = self.reset_cookie, "beginning resync");

        let mut buffer = self.pool.acquire();
        if let Err(error) = self.machine.save_state(&mut buffer) {
            self.pool.release(buffer);
            warn!(%error, "machine snapshot save failed");
            self.host
                .report_error("Netplay Error", "Failed to serialize the machine state.");
            self.fatal_error = Some(error);
            self.enter_closing(CloseReason::Terminated, true);
            return;
        }
        // reload locally so every peer resumes from the identical state
        if let Err(error) = self.machine.load_state(&buffer) {
            self.pool.release(buffer);
            warn!(%error, "local snapshot reload failed");
            self.host
                .report_error("Netplay Error", "Failed to reload the machine state.");
            self.fatal_error = Some(error);
            self.enter_closing(CloseReason::Terminated, true);
            return;
        }
        let state_data = compress_prepend_size(&buffer);
        self.pool.release(buffer);

        self.destroy_rollback();

        let message = ControlMessage::Reset(ResetMessage {
            cookie: self.reset_cookie,
            num_players: self.roster.num_players() as u16,
            players: self.roster_entries(),
            state_data,
        });
        self.broadcast_control(&message);

        self.reset_players = ResetBitset::only(PlayerId::HOST);
        self.resetting_since = Instant::now();
        self.state = SessionState::Resetting;
        self.host
            .display_loading_screen("Waiting for players to synchronize...", None);
        // a host alone in the session resumes immediately
        self.check_reset_complete();
    }

    fn roster_entries(&self) -> Vec<Option<RosterEntry>> {
        (0..MAX_PLAYERS)
            .map(|index| {
                self.roster.get(PlayerId::new(index)).map(|slot| RosterEntry {
                    controller_port: index as i16,
                    nickname: slot.nickname.clone(),
                    addr: match slot.addr {
                        SocketAddr::V4(v4) => v4,
                        SocketAddr::V6(v6) => {
                            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, v6.port())
                        },
                    },
                })
            })
            .collect()
    }

    /// Joiner side of a resync: adopt the roster, rebuild the mesh, load
    /// the snapshot, and acknowledge once every required peer is connected.
    fn process_reset(&mut self, reset: ResetMessage) {
        if self.is_host() {
            warn!("host received a reset, discarding");
            return;
        }
        if !matches!(
            self.state,
            SessionState::Resetting | SessionState::Running
        ) {
            warn!(state = %self.state, "reset in unexpected state discarded");
            return;
        }
        debug!(cookie = reset.cookie, num_players = reset.num_players, "processing resync");
        self.host
            .display_loading_screen("Loading session state...", None);
        self.destroy_rollback();

        let state_bytes = match decompress_size_prepended(&reset.state_data) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(%error, "reset snapshot failed to decompress");
                self.host
                    .report_error("Netplay Error", "The session state could not be read.");
                self.fatal_error = Some(NetplayError::SnapshotLoad);
                self.enter_closing(CloseReason::Terminated, true);
                return;
            },
        };

        // adopt the authoritative roster, preserving matching connections
        let old_slots = self.roster.take_all();
        let mut kept_peers: Vec<PeerHandle> = Vec::new();
        for (index, entry) in reset.players.iter().enumerate() {
            let Some(entry) = entry else { continue };
            let id = PlayerId::new(index);
            let addr = SocketAddr::V4(entry.addr);
            let peer = if id == self.local_player_id {
                None
            } else if id == PlayerId::HOST {
                // the admission connection to the host is always kept
                self.host_peer
            } else if let Some((_, old)) = old_slots
                .iter()
                .find(|(old_id, old)| *old_id == id && old.addr == addr && old.peer.is_some())
            {
                old.peer
            } else if let Some(existing) =
                self.transport.as_ref().and_then(|t| t.find_peer(addr))
            {
                Some(existing)
            } else if id < self.local_player_id {
                // lower-numbered peers listen; higher-numbered peers dial
                self.transport.as_mut().and_then(|t| t.dial(addr).ok())
            } else {
                None
            };
            if let Some(peer) = peer {
                kept_peers.push(peer);
            }
            self.roster.occupy(
                id,
                PeerSlot {
                    nickname: entry.nickname.clone(),
                    addr,
                    peer,
                },
            );
        }
        // drop connections to peers that left the roster
        for (_, old) in old_slots {
            if let Some(peer) = old.peer {
                if !kept_peers.contains(&peer) && Some(peer) != self.host_peer {
                    if let Some(transport) = self.transport.as_mut() {
                        transport.disconnect(peer, false);
                    }
                }
            }
        }

        if let Err(error) = self.machine.load_state(&state_bytes) {
            warn!(%error, "reset snapshot failed to load");
            self.host
                .report_error("Netplay Error", "The session state could not be loaded.");
            self.fatal_error = Some(error);
            self.enter_closing(CloseReason::Terminated, true);
            return;
        }

        self.reset_cookie = reset.cookie;
        self.reset_complete_sent = false;
        self.resetting_since = Instant::now();
        self.state = SessionState::Resetting;
        self.host
            .display_loading_screen("Synchronizing with players...", None);
        self.check_joiner_mesh();
    }

    fn handle_reset_complete(&mut self, peer: PeerHandle, cookie: u32) {
        if !self.is_host() {
            return;
        }
        if cookie != self.reset_cookie {
            debug!(cookie, expected = self.reset_cookie, "stale reset-complete discarded");
            return;
        }
        let Some(id) = self.roster.player_by_peer(peer) else {
            return;
        };
        if self.reset_players.contains(id) {
            debug!(%id, "duplicate reset-complete discarded");
            return;
        }
        debug!(%id, cookie, "peer acknowledged resync");
        self.reset_players.set(id);
        self.check_reset_complete();
    }

    fn check_reset_complete(&mut self) {
        if !self.is_host() || self.state != SessionState::Resetting {
            return;
        }
        if !self.reset_players.covers(&self.roster) {
            return;
        }
        debug!(cookie = self.reset_cookie, "all peers acknowledged resync");
        self.broadcast_control(&ControlMessage::ResumeSession);
        match self.start_rollback_from_roster() {
            Ok(()) => {
                self.state = SessionState::Running;
                self.host_message("Session resumed.");
            },
            Err(error) => {
                warn!(%error, "failed to restart rollback session");
                self.host
                    .report_error("Netplay Error", "Failed to restart the session.");
                self.fatal_error = Some(error);
                self.enter_closing(CloseReason::Terminated, true);
            },
        }
    }

    fn check_joiner_mesh(&mut self) {
        if self.is_host() || self.state != SessionState::Resetting || self.reset_complete_sent {
            return;
        }
        // nothing to acknowledge until the roster-bearing reset has arrived
        if self.roster.num_players() == 0 {
            return;
        }
        let ids: Vec<PlayerId> = self.roster.occupied_ids().collect();
        let mut all_connected = true;
        for id in ids {
            if id == self.local_player_id {
                continue;
            }
            let Some(transport) = self.transport.as_ref() else {
                return;
            };
            let found = self
                .roster
                .get(id)
                .and_then(|slot| slot.peer.or_else(|| transport.find_peer(slot.addr)));
            let connected = found.is_some_and(|peer| transport.is_connected(peer));
            if let Some(slot) = self.roster.get_mut(id) {
                slot.peer = found;
            }
            if !connected {
                all_connected = false;
            }
        }
        if all_connected {
            debug!(cookie = self.reset_cookie, "mesh connected, acknowledging resync");
            self.reset_complete_sent = true;
            self.send_to_host(&ControlMessage::ResetComplete {
                cookie: self.reset_cookie,
            });
        }
    }

    fn handle_resume(&mut self) {
        if self.is_host() || self.state != SessionState::Resetting {
            warn!("unexpected resume discarded");
            return;
        }
        match self.start_rollback_from_roster() {
            Ok(()) => {
                self.state = SessionState::Running;
                self.host_message("Session resumed.");
            },
            Err(error) => {
                warn!(%error, "failed to start rollback session");
                self.host
                    .report_error("Netplay Error", "Failed to start the session.");
                self.fatal_error = Some(error);
                self.enter_closing(CloseReason::Terminated, true);
            },
        }
    }

    fn handle_drop_player(&mut self, reason: DropReason, player_id: i16) {
        if self.is_host() || player_id < 0 {
            return;
        }
        let id = PlayerId::new(player_id as usize);
        if id == self.local_player_id {
            self.host_message("You were removed from the session.");
            self.enter_closing(CloseReason::Terminated, false);
            return;
        }
        debug!(%id, ?reason, "player dropped by host");
        if let Some(slot) = self.roster.clear(id) {
            self.host_message(&format!("{} left the session.", slot.nickname));
            if let (Some(transport), Some(peer)) = (self.transport.as_mut(), slot.peer) {
                transport.disconnect(peer, false);
            }
        }
        // the host's reset with the shrunk roster follows
    }

    fn handle_reset_request(
        &mut self,
        peer: PeerHandle,
        reason: ResetRequestReason,
        causing_player_id: i16,
    ) {
        if !self.is_host() || causing_player_id < 0 {
            return;
        }
        let requester = self.roster.player_by_peer(peer);
        info!(?requester, ?reason, causing_player_id, "reset requested");
        self.drop_player(
            PlayerId::new(causing_player_id as usize),
            DropReason::ConnectionLost,
        );
    }

    // ------------------------------------------------------------------
    // Peer loss and teardown
    // ------------------------------------------------------------------

    fn peer_lost(&mut self, player: PlayerId) {
        info!(%player, "peer connection lost");
        if self.is_host() {
            self.drop_player(player, DropReason::ConnectionLost);
        } else if player == PlayerId::HOST {
            self.fail_session(
                "Lost connection to host",
                NetplayError::PeerDropped { player },
            );
        } else if self.state == SessionState::Running {
            // tell the host; it will drop the peer and resync everyone
            self.send_to_host(&ControlMessage::ResetRequest {
                reason: ResetRequestReason::ConnectionLost,
                causing_player_id: player.as_usize() as i16,
            });
        }
    }

    fn drop_player(&mut self, player: PlayerId, reason: DropReason) {
        if !self.is_host() || player == PlayerId::HOST {
            return;
        }
        let Some(slot) = self.roster.clear(player) else {
            // already dropped; a second report must not trigger another reset
            return;
        };
        info!(%player, ?reason, "dropping player");
        self.host_message(&format!("{} left the session.", slot.nickname));
        if let (Some(transport), Some(peer)) = (self.transport.as_mut(), slot.peer) {
            transport.disconnect(peer, false);
        }
        self.broadcast_control(&ControlMessage::DropPlayer {
            reason,
            player_id: player.as_usize() as i16,
        });
        self.begin_reset();
    }

    fn fail_session(&mut self, message: &str, error: NetplayError) {
        warn!(%error, "session failed: {message}");
        self.host.report_error("Netplay Error", message);
        self.fatal_error = Some(error);
        self.enter_closing(CloseReason::Terminated, true);
    }

    fn enter_closing(&mut self, reason: CloseReason, notify_peers: bool) {
        if matches!(
            self.state,
            SessionState::ClosingSession | SessionState::Inactive
        ) {
            return;
        }
        info!(?reason, "closing session");
        self.destroy_rollback();
        if let Some(transport) = self.transport.as_mut() {
            if notify_peers {
                transport.broadcast(
                    Channel::Control,
                    &ControlMessage::CloseSession { reason }.encode(),
                );
            }
            for peer in transport.connected_peers() {
                transport.disconnect(peer, true);
            }
            transport.drop_pending_peers();
        }
        self.close_deadline = Some(Instant::now() + self.options.close_timeout);
        self.state = SessionState::ClosingSession;
    }

    fn teardown(&mut self) {
        debug!("netplay session torn down");
        self.destroy_rollback();
        self.transport = None;
        let _ = self.roster.take_all();
        self.host.set_settings_layer(None);
        self.state = SessionState::Inactive;
    }

    // ------------------------------------------------------------------
    // Rollback wiring
    // ------------------------------------------------------------------

    /// Builds a fresh engine from the roster. Engine player indices are the
    /// dense rank of the roster ids (the roster can be sparse after drops);
    /// the port map carries each rank's original controller port.
    fn start_rollback_from_roster(&mut self) -> Result<(), NetplayError> {
        let occupied: Vec<PlayerId> = self.roster.occupied_ids().collect();
        let num_players = occupied.len();
        let config = RollbackConfig {
            num_players,
            max_rollback_frames: MAX_ROLLBACK_FRAMES,
            input_delay: self.options.local_delay,
            fps: self.machine.nominal_frame_rate().round() as usize,
            checksum_interval: self.options.checksum_interval,
        };
        let mut rollback = RollbackSession::new(config)?;
        let mut roster_id_by_engine = Vec::with_capacity(num_players);
        let mut port_map = Vec::with_capacity(num_players);
        let mut local_engine_player = PlayerId::HOST;
        for (rank, &id) in occupied.iter().enumerate() {
            let engine_player = PlayerId::new(rank);
            roster_id_by_engine.push(id);
            port_map.push(id.as_usize());
            if id == self.local_player_id {
                local_engine_player = engine_player;
                rollback.add_player(PlayerKind::Local, engine_player)?;
            } else {
                let peer = self
                    .roster
                    .get(id)
                    .and_then(|slot| slot.peer)
                    .ok_or(NetplayError::Transport {
                        kind: TransportErrorKind::NotConnected,
                    })?;
                rollback.add_player(PlayerKind::Remote(peer), engine_player)?;
            }
        }
        rollback.start()?;
        self.rollback = Some(rollback);
        self.roster_id_by_engine = roster_id_by_engine;
        self.port_map = port_map;
        self.local_engine_player = local_engine_player;
        self.pacer.reset();
        Ok(())
    }

    fn destroy_rollback(&mut self) {
        if let Some(mut rollback) = self.rollback.take() {
            let mut events = Vec::new();
            let mut handler = RunnerHandler {
                machine: &mut self.machine,
                pool: &mut self.pool,
                muted: &mut self.audio_muted,
                ports: &self.port_map,
                events: &mut events,
                counters: &mut self.counters,
            };
            rollback.shutdown(&mut handler);
        }
        if self.audio_muted {
            self.machine.set_audio_muted(false);
            self.audio_muted = false;
        }
    }

    fn roster_id_of_engine(&self, engine_player: PlayerId) -> PlayerId {
        self.roster_id_by_engine
            .get(engine_player.as_usize())
            .copied()
            .unwrap_or(engine_player)
    }

    fn process_rollback_events(&mut self, events: Vec<RollbackEvent>) {
        for event in events {
            match event {
                RollbackEvent::TimeSync {
                    frames_ahead,
                    interval,
                } => {
                    let current = self
                        .rollback
                        .as_ref()
                        .map_or(Frame::new(0), RollbackSession::current_frame);
                    self.pacer.on_time_sync(current, frames_ahead, interval);
                    self.host_message(&format!(
                        "Adjusting speed: {frames_ahead:+.1} frames of drift."
                    ));
                },
                RollbackEvent::Desync {
                    frame,
                    ours,
                    theirs,
                    player,
                } => {
                    let id = self.roster_id_of_engine(player);
                    self.host_message(&format!(
                        "Desync detected at frame {frame} against player {id} \
                         (local {ours:08x}, remote {theirs:08x})."
                    ));
                },
                RollbackEvent::DisconnectedFromPeer { player } => {
                    let id = self.roster_id_of_engine(player);
                    if let Some(slot) = self.roster.get_mut(id) {
                        slot.peer = None;
                    }
                    self.peer_lost(id);
                    if self.state != SessionState::Running {
                        return;
                    }
                },
                RollbackEvent::SynchronizingWithPeer {
                    player,
                    count,
                    total,
                } => {
                    debug!(%player, count, total, "synchronizing with peer");
                    let progress = (count * 100 / total.max(1)) as i32;
                    self.host.display_loading_screen(
                        "Synchronizing with players...",
                        Some(progress),
                    );
                },
                RollbackEvent::ConnectedToPeer { player } => {
                    debug!(%player, "connected to peer");
                },
                RollbackEvent::SynchronizedWithPeer { player } => {
                    debug!(%player, "synchronized with peer");
                },
                RollbackEvent::Running => {
                    debug!("rollback session running");
                    self.pacer.reset();
                },
            }
        }
    }

    // ------------------------------------------------------------------
    // Send helpers
    // ------------------------------------------------------------------

    fn send_control(&mut self, peer: PeerHandle, message: &ControlMessage) {
        if let Some(transport) = self.transport.as_mut() {
            if let Err(error) = transport.send(peer, Channel::Control, &message.encode()) {
                warn!(%peer, %error, "control send failed");
            }
        }
    }

    fn broadcast_control(&mut self, message: &ControlMessage) {
        if let Some(transport) = self.transport.as_mut() {
            transport.broadcast(Channel::Control, &message.encode());
        }
    }

    fn send_to_host(&mut self, message: &ControlMessage) {
        if let Some(peer) = self.host_peer {
            self.send_control(peer, message);
        }
    }

    fn host_message(&mut self, text: &str) {
        info!("netplay: {text}");
        self.host.on_netplay_message(text);
    }
}

#[cfg(test)]
mod checksum_tests {
    use super::*;

    #[test]
    fn checksum_is_seeded_by_frame() {
        let data = vec![0u8; 1024];
        // identical data, different frames in the same window group
        let a = state_checksum(Frame::new(0), &data);
        let b = state_checksum(Frame::new(NUM_CHECKSUM_GROUPS as i32), &data);
        assert_ne!(a, b);
    }

    #[test]
    fn checksum_window_slides_with_frame_group() {
        let mut data = vec![0u8; CHECKSUM_WINDOW * NUM_CHECKSUM_GROUPS];
        data[CHECKSUM_WINDOW] = 0xAA; // inside group 1's window only

        let base = vec![0u8; CHECKSUM_WINDOW * NUM_CHECKSUM_GROUPS];
        // group 0 does not see the difference
        assert_eq!(
            state_checksum(Frame::new(0), &data),
            state_checksum(Frame::new(0), &base)
        );
        // group 1 does
        assert_ne!(
            state_checksum(Frame::new(1), &data),
            state_checksum(Frame::new(1), &base)
        );
    }

    #[test]
    fn short_snapshots_clamp_to_tail() {
        let data = vec![7u8; 100];
        // every group degenerates to an empty or clamped window; must not panic
        for frame in 0..8 {
            let _ = state_checksum(Frame::new(frame), &data);
        }
    }

    #[test]
    fn checksum_is_deterministic() {
        let data: Vec<u8> = (0..60_000).map(|i| (i % 251) as u8).collect();
        assert_eq!(
            state_checksum(Frame::new(42), &data),
            state_checksum(Frame::new(42), &data)
        );
    }
}
