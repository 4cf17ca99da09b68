//! The rollback engine: predict, advance, correct.
//!
//! A [`RollbackSession`] owns one input queue per player, a bounded ring of
//! machine snapshots, and one gameplay-protocol endpoint per remote peer.
//! Each frame the session runner feeds it the local input and asks it to
//! advance; the engine speculates with predicted remote inputs, and when an
//! authoritative input disagrees with a prediction it rewinds the machine to
//! the offending frame and replays forward with corrected inputs.
//!
//! The engine never touches the emulated machine directly. Saving, loading,
//! advancing, buffer recycling, and event delivery all go through the
//! [`RollbackHandler`] callbacks implemented by the session runner, and all
//! outgoing datagrams go through a [`DatagramSink`]. This keeps the engine
//! testable against a scripted machine and independent of the transport.

mod input_queue;
mod messages;
mod protocol;
mod sync_layer;
mod time_sync;

pub use sync_layer::{Snapshot, SnapshotPool};

use smallvec::SmallVec;
use tracing::{debug, trace, warn};
use web_time::{Duration, Instant};

use crate::error::InvalidRequestKind;
use crate::input::PlayerInput;
use crate::transport::PeerHandle;
use crate::{
    codec, Frame, InputStatus, NetplayError, NetplayInput, PlayerId, DEFAULT_LOCAL_DELAY,
    MAX_PLAYERS, MAX_ROLLBACK_FRAMES,
};

use input_queue::MAX_FRAME_DELAY;
use messages::{ConnectStatus, GameplayMessage};
use protocol::{PeerProtocol, ProtocolEvent};
use sync_layer::SyncLayer;

/// Frames between timesync drift checks; also the recovery interval handed
/// to the frame pacer.
pub const TIME_SYNC_CHECK_INTERVAL: u32 = 240;

/// Engine configuration, validated by [`RollbackSession::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackConfig {
    /// Number of players, local included.
    pub num_players: usize,
    /// Speculation window: how many frames past the last confirmed frame
    /// the engine may run before refusing local input.
    pub max_rollback_frames: usize,
    /// Frame delay applied to the local player's inputs.
    pub input_delay: usize,
    /// Simulation frame rate, for converting ping into frames.
    pub fps: usize,
    /// Send a state checksum every this many confirmed frames; 0 disables
    /// desync detection.
    pub checksum_interval: u32,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            num_players: 2,
            max_rollback_frames: MAX_ROLLBACK_FRAMES,
            input_delay: DEFAULT_LOCAL_DELAY,
            fps: 60,
            checksum_interval: 30,
        }
    }
}

impl RollbackConfig {
    fn validate(&self) -> Result<(), NetplayError> {
        if self.num_players == 0 || self.num_players > MAX_PLAYERS {
            return Err(InvalidRequestKind::BadPlayerCount {
                requested: self.num_players,
            }
            .into());
        }
        if self.max_rollback_frames == 0 || self.max_rollback_frames > 16 {
            return Err(InvalidRequestKind::BadRollbackWindow {
                requested: self.max_rollback_frames,
            }
            .into());
        }
        if self.input_delay > MAX_FRAME_DELAY {
            return Err(InvalidRequestKind::FrameDelayTooLarge {
                delay: self.input_delay,
                max_delay: MAX_FRAME_DELAY,
            }
            .into());
        }
        Ok(())
    }
}

/// Whether a player slot is driven locally or by a remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerKind {
    /// Input comes from the local input provider.
    Local,
    /// Input arrives from this transport peer.
    Remote(PeerHandle),
}

/// Extra context for the advance callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvanceFlags {
    /// `true` while replaying frames during a rollback. The session runner
    /// mutes audio for the duration.
    pub rollback: bool,
}

/// Events the engine raises through [`RollbackHandler::on_event`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RollbackEvent {
    /// First traffic came back from a remote peer's endpoint.
    ConnectedToPeer {
        /// The peer's player id.
        player: PlayerId,
    },
    /// A remote peer's endpoint made synchronization progress.
    SynchronizingWithPeer {
        /// The peer's player id.
        player: PlayerId,
        /// Completed roundtrips.
        count: u32,
        /// Required roundtrips.
        total: u32,
    },
    /// A remote peer's endpoint finished synchronizing.
    SynchronizedWithPeer {
        /// The peer's player id.
        player: PlayerId,
    },
    /// Every endpoint is synchronized; the engine accepts input now.
    Running,
    /// The local clock has drifted from the peers'; the frame pacer should
    /// correct by `frames_ahead` over the next `interval` frames.
    TimeSync {
        /// Averaged frames ahead of the slowest peer (negative = behind).
        frames_ahead: f32,
        /// Frames until the next drift check.
        interval: u32,
    },
    /// Peers disagree about the machine state at a confirmed frame.
    Desync {
        /// The frame whose checksums diverged.
        frame: Frame,
        /// Our checksum.
        ours: u32,
        /// The remote's checksum.
        theirs: u32,
        /// The disagreeing peer.
        player: PlayerId,
    },
    /// A remote peer's endpoint went silent past the disconnect timeout.
    DisconnectedFromPeer {
        /// The peer's player id.
        player: PlayerId,
    },
}

/// The callback surface the session runner provides: snapshot save/load,
/// machine advance, buffer recycling, and event delivery.
pub trait RollbackHandler {
    /// Serializes the machine for `frame` into an owned [`Snapshot`],
    /// typically drawing its buffer from a [`SnapshotPool`].
    fn save_frame(&mut self, frame: Frame) -> Result<Snapshot, NetplayError>;

    /// Restores the machine from `snapshot`. `rollback_depth` is how many
    /// frames are about to be replayed.
    fn load_frame(&mut self, snapshot: &Snapshot, rollback_depth: usize)
        -> Result<(), NetplayError>;

    /// Advances the machine one frame with `inputs[player]` per player.
    fn advance_frame(&mut self, inputs: &[(NetplayInput, InputStatus)], flags: AdvanceFlags);

    /// Takes back ownership of an evicted snapshot's buffer.
    fn free_buffer(&mut self, snapshot: Snapshot);

    /// Receives engine events.
    fn on_event(&mut self, event: RollbackEvent);
}

/// Destination for outgoing gameplay datagrams. Implemented by the
/// transport; tests substitute an in-memory shuttle.
pub trait DatagramSink {
    /// Sends one unreliable datagram to `peer`.
    fn send_datagram(&mut self, peer: PeerHandle, bytes: &[u8]);
}

/// Connection quality numbers for one remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkStats {
    /// Estimated round trip time.
    pub ping: Duration,
    /// Inputs sent but not yet acknowledged.
    pub send_queue_len: usize,
    /// Estimated frames we are ahead of this peer.
    pub local_frame_advantage: i32,
    /// The peer's estimate of how far ahead of us they are.
    pub remote_frame_advantage: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Synchronizing,
    Running,
}

/// See the module docs.
#[derive(Debug)]
pub struct RollbackSession {
    config: RollbackConfig,
    state: EngineState,
    started: bool,
    running_notified: bool,
    sync_layer: SyncLayer,
    local_player: Option<PlayerId>,
    registered: Vec<bool>,
    endpoints: Vec<Option<PeerProtocol>>,
    local_connect_status: Vec<ConnectStatus>,
    pending_local_input: Option<NetplayInput>,
    disconnect_frame: Frame,
    next_time_sync_frame: Frame,
    frames_ahead: f32,
    last_sent_checksum_frame: Frame,
}

impl RollbackSession {
    /// Creates a session for `config.num_players` players. Players must be
    /// registered with [`add_player`](Self::add_player) and the session
    /// started with [`start`](Self::start) before frames can advance.
    pub fn new(config: RollbackConfig) -> Result<Self, NetplayError> {
        config.validate()?;
        let mut endpoints = Vec::with_capacity(config.num_players);
        endpoints.resize_with(config.num_players, || None);
        Ok(Self {
            config,
            state: EngineState::Synchronizing,
            started: false,
            running_notified: false,
            sync_layer: SyncLayer::new(config.num_players, config.max_rollback_frames),
            local_player: None,
            registered: vec![false; config.num_players],
            endpoints,
            local_connect_status: vec![ConnectStatus::default(); config.num_players],
            pending_local_input: None,
            disconnect_frame: Frame::NULL,
            next_time_sync_frame: Frame::new(TIME_SYNC_CHECK_INTERVAL as i32),
            frames_ahead: 0.0,
            last_sent_checksum_frame: Frame::NULL,
        })
    }

    /// Registers one player slot.
    pub fn add_player(&mut self, kind: PlayerKind, player: PlayerId) -> Result<(), NetplayError> {
        let index = player.as_usize();
        if index >= self.config.num_players {
            return Err(InvalidRequestKind::InvalidPlayerId {
                player,
                num_players: self.config.num_players,
            }
            .into());
        }
        if self.registered[index] {
            return Err(InvalidRequestKind::PlayerIdInUse { player }.into());
        }
        match kind {
            PlayerKind::Local => {
                if self.local_player.is_some() {
                    return Err(InvalidRequestKind::PlayerIdInUse { player }.into());
                }
                self.local_player = Some(player);
            },
            PlayerKind::Remote(peer) => {
                self.endpoints[index] = Some(PeerProtocol::new(
                    peer,
                    player,
                    self.config.num_players,
                    self.config.fps,
                ));
            },
        }
        self.registered[index] = true;
        Ok(())
    }

    /// Changes the local player's frame delay.
    pub fn set_frame_delay(&mut self, player: PlayerId, delay: usize) -> Result<(), NetplayError> {
        if self.local_player != Some(player) {
            return Err(InvalidRequestKind::NotLocalPlayer { player }.into());
        }
        if delay > MAX_FRAME_DELAY {
            return Err(InvalidRequestKind::FrameDelayTooLarge {
                delay,
                max_delay: MAX_FRAME_DELAY,
            }
            .into());
        }
        self.sync_layer.set_frame_delay(player.as_usize(), delay);
        Ok(())
    }

    /// Finishes registration and begins synchronizing with remote peers. A
    /// session with no remote peers runs immediately.
    pub fn start(&mut self) -> Result<(), NetplayError> {
        let registered = self.registered.iter().filter(|&&r| r).count();
        if registered != self.config.num_players {
            return Err(InvalidRequestKind::BadPlayerCount {
                requested: registered,
            }
            .into());
        }
        if let Some(local) = self.local_player {
            self.sync_layer
                .set_frame_delay(local.as_usize(), self.config.input_delay);
        }
        self.started = true;
        if self.endpoints.iter().all(Option::is_none) {
            self.state = EngineState::Running;
        }
        debug!(
            num_players = self.config.num_players,
            state = ?self.state,
            "rollback session started"
        );
        Ok(())
    }

    /// The frame the simulation is currently on.
    pub fn current_frame(&self) -> Frame {
        self.sync_layer.current_frame()
    }

    /// The highest frame with authoritative inputs from every connected
    /// player.
    pub fn confirmed_frame(&self) -> Frame {
        self.sync_layer.last_confirmed_frame()
    }

    /// Averaged frames ahead of the slowest remote peer.
    pub fn frames_ahead(&self) -> f32 {
        self.frames_ahead
    }

    /// `true` once every remote endpoint has completed its handshake.
    pub fn is_running(&self) -> bool {
        self.state == EngineState::Running
    }

    /// Connection quality for one remote player.
    pub fn network_stats(&self, player: PlayerId) -> Result<NetworkStats, NetplayError> {
        self.endpoints
            .get(player.as_usize())
            .and_then(Option::as_ref)
            .map(PeerProtocol::network_stats)
            .ok_or_else(|| {
                InvalidRequestKind::InvalidPlayerId {
                    player,
                    num_players: self.config.num_players,
                }
                .into()
            })
    }

    /// Registers the local input for the current frame.
    ///
    /// # Errors
    /// [`NetplayError::PredictionThreshold`] once the speculation window is
    /// exhausted; the caller should skip advancing this iteration and keep
    /// polling until remote inputs catch up.
    pub fn add_local_input(
        &mut self,
        player: PlayerId,
        input: NetplayInput,
    ) -> Result<(), NetplayError> {
        if self.state != EngineState::Running {
            return Err(NetplayError::NotSynchronized);
        }
        if self.local_player != Some(player) {
            return Err(InvalidRequestKind::NotLocalPlayer { player }.into());
        }
        let current = self.sync_layer.current_frame();
        let confirmed = self.sync_layer.last_confirmed_frame();
        let speculated = if confirmed.is_null() {
            current.as_i32()
        } else {
            current - confirmed
        };
        if speculated >= self.config.max_rollback_frames as i32 && self.has_remote_players() {
            trace!(%current, %confirmed, "prediction window exhausted");
            return Err(NetplayError::PredictionThreshold);
        }
        self.pending_local_input = Some(input);
        Ok(())
    }

    /// The authoritative-or-predicted inputs for the current frame, one per
    /// player.
    pub fn synchronize_inputs(
        &mut self,
    ) -> Result<SmallVec<[(NetplayInput, InputStatus); MAX_PLAYERS]>, NetplayError> {
        if self.state != EngineState::Running {
            return Err(NetplayError::NotSynchronized);
        }
        Ok(self.sync_layer.synchronized_inputs(&self.local_connect_status))
    }

    /// Completes the current frame: distributes the local input, saves a
    /// snapshot, and advances the machine through the handler.
    pub fn advance_frame<H: RollbackHandler>(
        &mut self,
        handler: &mut H,
    ) -> Result<(), NetplayError> {
        if self.state != EngineState::Running {
            return Err(NetplayError::NotSynchronized);
        }
        let Some(local) = self.local_player else {
            return Err(InvalidRequestKind::WrongState {
                state: "no local player",
            }
            .into());
        };
        let current = self.sync_layer.current_frame();
        let Some(input) = self.pending_local_input.take() else {
            return Err(InvalidRequestKind::MissingLocalInput { frame: current }.into());
        };

        let actual = self.sync_layer.add_local_input(local.as_usize(), input);
        if actual.is_valid() {
            self.local_connect_status[local.as_usize()].last_frame = actual;
            for endpoint in self.endpoints.iter_mut().flatten() {
                endpoint.send_input(PlayerInput::new(actual, input), &self.local_connect_status);
            }
        }

        self.sync_layer.save_current(handler)?;
        let inputs = self.sync_layer.synchronized_inputs(&self.local_connect_status);
        handler.advance_frame(&inputs, AdvanceFlags { rollback: false });
        self.sync_layer.advance_frame();
        Ok(())
    }

    /// Housekeeping, called once per outer-loop iteration: polls endpoints,
    /// applies received inputs, performs rollbacks, advances the confirmed
    /// frame, exchanges checksums, and emits events.
    pub fn idle<H: RollbackHandler>(&mut self, handler: &mut H) -> Result<(), NetplayError> {
        let now = Instant::now();
        let mut events: Vec<RollbackEvent> = Vec::new();

        self.poll_endpoints(now, &mut events);

        if self.state == EngineState::Synchronizing
            && self
                .endpoints
                .iter()
                .flatten()
                .all(PeerProtocol::is_synchronized)
            && self.started
        {
            self.state = EngineState::Running;
        }
        if self.state == EngineState::Running && !self.running_notified && self.started {
            self.running_notified = true;
            events.push(RollbackEvent::Running);
        }

        if self.state == EngineState::Running && self.started {
            self.propagate_remote_disconnects(&mut events);

            // rollback before anything else looks at the simulation
            let first_incorrect = self
                .sync_layer
                .check_simulation_consistency(self.disconnect_frame);
            if first_incorrect.is_valid() {
                let current = self.sync_layer.current_frame();
                if first_incorrect < current {
                    self.rollback_to(first_incorrect, handler)?;
                } else {
                    self.sync_layer.reset_prediction();
                }
                self.disconnect_frame = Frame::NULL;
            }

            let confirmed = self.min_confirmed_frame();
            if confirmed.is_valid() {
                self.sync_layer.set_last_confirmed_frame(confirmed);
            }

            self.exchange_checksums(&mut events);
            self.update_time_sync(&mut events);
        }

        for event in events {
            handler.on_event(event);
        }
        Ok(())
    }

    /// Flushes queued gameplay datagrams to the sink.
    pub fn network_idle(&mut self, sink: &mut impl DatagramSink) {
        for endpoint in self.endpoints.iter_mut().flatten() {
            endpoint.send_all(sink);
        }
    }

    /// Feeds one gameplay datagram received from `peer`. Undecodable
    /// packets are logged and dropped.
    pub fn handle_packet(&mut self, peer: PeerHandle, bytes: &[u8]) {
        let Ok(message) = codec::decode::<GameplayMessage>(bytes, "gameplay message") else {
            warn!(%peer, len = bytes.len(), "dropping undecodable gameplay packet");
            return;
        };
        let now = Instant::now();
        for endpoint in self.endpoints.iter_mut().flatten() {
            if endpoint.peer() == peer {
                endpoint.handle_message(&message, now);
                return;
            }
        }
        trace!(%peer, "gameplay packet from unknown peer");
    }

    /// Returns every live snapshot buffer to the handler's pool. Call
    /// before dropping the session so no buffers are lost.
    pub fn shutdown<H: RollbackHandler>(&mut self, handler: &mut H) {
        self.sync_layer.free_all(handler);
    }

    fn has_remote_players(&self) -> bool {
        self.endpoints.iter().any(Option::is_some)
    }

    fn poll_endpoints(&mut self, now: Instant, events: &mut Vec<RollbackEvent>) {
        for index in 0..self.endpoints.len() {
            let Some(endpoint) = self.endpoints[index].as_mut() else {
                continue;
            };
            let player = endpoint.player();
            for event in endpoint.poll(now) {
                match event {
                    ProtocolEvent::Connected => {
                        events.push(RollbackEvent::ConnectedToPeer { player });
                    },
                    ProtocolEvent::Synchronizing { count, total } => {
                        events.push(RollbackEvent::SynchronizingWithPeer {
                            player,
                            count,
                            total,
                        });
                    },
                    ProtocolEvent::Synchronized => {
                        events.push(RollbackEvent::SynchronizedWithPeer { player });
                    },
                    ProtocolEvent::Input(input) => {
                        let status = &mut self.local_connect_status[index];
                        if !status.disconnected
                            && input.frame.as_i32() == status.last_frame.as_i32() + 1
                        {
                            status.last_frame = input.frame;
                            self.sync_layer
                                .add_remote_input(index, input.frame, input.input);
                        }
                    },
                    ProtocolEvent::Disconnected => {
                        let status = &mut self.local_connect_status[index];
                        if !status.disconnected {
                            status.disconnected = true;
                            let last = status.last_frame;
                            if self.sync_layer.current_frame() > last {
                                // re-simulate from there with blank inputs
                                self.disconnect_frame = last + 1;
                            }
                            events.push(RollbackEvent::DisconnectedFromPeer { player });
                        }
                    },
                }
            }
        }
    }

    /// Adopts disconnects that other peers observed before we did, rolling
    /// the affected player back to the earliest frame anyone has for them.
    fn propagate_remote_disconnects(&mut self, events: &mut Vec<RollbackEvent>) {
        for index in 0..self.config.num_players {
            if Some(PlayerId::new(index)) == self.local_player
                || self.local_connect_status[index].disconnected
            {
                continue;
            }
            let mut seen_disconnected = false;
            let mut min_frame = Frame::new(i32::MAX);
            for endpoint in self.endpoints.iter().flatten() {
                if !endpoint.is_running() {
                    continue;
                }
                let status = endpoint.peer_connect_status(PlayerId::new(index));
                if status.disconnected {
                    seen_disconnected = true;
                    min_frame = min_frame.min(status.last_frame);
                }
            }
            if seen_disconnected {
                let status = &mut self.local_connect_status[index];
                status.disconnected = true;
                status.last_frame = status.last_frame.min(min_frame);
                let last = status.last_frame;
                if self.sync_layer.current_frame() > last {
                    self.disconnect_frame = last + 1;
                }
                events.push(RollbackEvent::DisconnectedFromPeer {
                    player: PlayerId::new(index),
                });
            }
        }
    }

    /// The highest frame for which inputs from every connected player are
    /// in hand.
    fn min_confirmed_frame(&self) -> Frame {
        let mut confirmed = Frame::new(i32::MAX);
        for status in &self.local_connect_status {
            if !status.disconnected {
                confirmed = confirmed.min(status.last_frame);
            }
        }
        if confirmed.as_i32() == i32::MAX {
            Frame::NULL
        } else {
            confirmed
        }
    }

    fn rollback_to<H: RollbackHandler>(
        &mut self,
        first_incorrect: Frame,
        handler: &mut H,
    ) -> Result<(), NetplayError> {
        let target = self.sync_layer.current_frame();
        debug!(%first_incorrect, %target, "rolling back");
        self.sync_layer.load_frame(first_incorrect, handler)?;
        self.sync_layer.reset_prediction();
        while self.sync_layer.current_frame() < target {
            let inputs = self.sync_layer.synchronized_inputs(&self.local_connect_status);
            handler.advance_frame(&inputs, AdvanceFlags { rollback: true });
            self.sync_layer.advance_frame();
            if self.sync_layer.current_frame() < target {
                self.sync_layer.save_current(handler)?;
            }
        }
        Ok(())
    }

    fn exchange_checksums(&mut self, events: &mut Vec<RollbackEvent>) {
        let interval = self.config.checksum_interval;
        if interval == 0 {
            return;
        }
        let confirmed = self.sync_layer.last_confirmed_frame();

        // send our checksum for the next interval frame once it is confirmed
        let frame_to_send = if self.last_sent_checksum_frame.is_null() {
            Frame::new(interval as i32)
        } else {
            self.last_sent_checksum_frame + interval as i32
        };
        if frame_to_send <= confirmed {
            if let Some(checksum) = self.sync_layer.checksum_for(frame_to_send) {
                for endpoint in self.endpoints.iter_mut().flatten() {
                    endpoint.send_checksum_report(frame_to_send, checksum);
                }
                self.last_sent_checksum_frame = frame_to_send;
            }
        }

        // compare whatever the peers reported for frames we both confirmed
        for endpoint in self.endpoints.iter_mut().flatten() {
            let player = endpoint.player();
            let mut checked = Vec::new();
            for (&frame, &theirs) in &endpoint.pending_checksums {
                if frame >= confirmed {
                    continue;
                }
                if let Some(ours) = self.sync_layer.checksum_for(frame) {
                    if ours != theirs {
                        warn!(%frame, ours, theirs, %player, "state checksum mismatch");
                        events.push(RollbackEvent::Desync {
                            frame,
                            ours,
                            theirs,
                            player,
                        });
                    }
                }
                checked.push(frame);
            }
            for frame in checked {
                endpoint.pending_checksums.remove(&frame);
            }
        }
    }

    fn update_time_sync(&mut self, events: &mut Vec<RollbackEvent>) {
        let current = self.sync_layer.current_frame();
        for endpoint in self.endpoints.iter_mut().flatten() {
            if endpoint.is_running() {
                endpoint.update_local_frame_advantage(current);
            }
        }
        let mut max_advantage: f32 = 0.0;
        for (index, endpoint) in self.endpoints.iter().enumerate() {
            let Some(endpoint) = endpoint else { continue };
            if !self.local_connect_status[index].disconnected {
                max_advantage = max_advantage.max(endpoint.average_frame_advantage());
            }
        }
        self.frames_ahead = max_advantage;

        if current >= self.next_time_sync_frame {
            self.next_time_sync_frame = current + TIME_SYNC_CHECK_INTERVAL as i32;
            if self.frames_ahead.abs() >= 1.0 {
                events.push(RollbackEvent::TimeSync {
                    frames_ahead: self.frames_ahead,
                    interval: TIME_SYNC_CHECK_INTERVAL,
                });
            }
        }
    }
}
