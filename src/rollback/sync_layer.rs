//! Frame bookkeeping: the snapshot ring, the snapshot pool, and the input
//! queues behind the rollback engine.
//!
//! Snapshot buffers are owned values that move between exactly two places:
//! the free-list pool (owned by the session runner, accessed through the
//! [`RollbackHandler`] callbacks) and the ring (owned here). A save moves a
//! buffer pool → ring; overwriting a ring slot or tearing the layer down
//! moves it ring → pool via `free_buffer`. Nothing is ever aliased.

use std::collections::BTreeMap;

use smallvec::SmallVec;
use tracing::{debug, trace};

use super::input_queue::InputQueue;
use super::messages::ConnectStatus;
use super::{AdvanceFlags, RollbackHandler};
use crate::{Frame, InputStatus, NetplayError, NetplayInput, MAX_PLAYERS};

/// How many per-frame checksums the layer remembers for desync comparison.
const CHECKSUM_HISTORY: usize = 64;

/// An opaque machine snapshot for one frame, produced by the session
/// runner's `save_frame` callback. The snapshot of frame `f` captures the
/// machine *before* the inputs of frame `f` are applied.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// The frame this snapshot belongs to.
    pub frame: Frame,
    /// Serialized machine state.
    pub data: Vec<u8>,
    /// Desync checksum over the state.
    pub checksum: u32,
}

/// Free-list of reusable snapshot buffers. Buffers keep their capacity
/// across reuse, so steady-state saving allocates nothing.
#[derive(Debug, Default)]
pub struct SnapshotPool {
    free: Vec<Vec<u8>>,
}

impl SnapshotPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pops a cleared buffer from the free-list, or allocates a fresh one.
    pub fn acquire(&mut self) -> Vec<u8> {
        let mut buffer = self.free.pop().unwrap_or_default();
        buffer.clear();
        buffer
    }

    /// Returns a buffer to the free-list.
    pub fn release(&mut self, buffer: Vec<u8>) {
        self.free.push(buffer);
    }

    /// Number of buffers currently in the free-list.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

/// Bounded ring of live snapshots, indexed by frame number.
#[derive(Debug)]
struct SnapshotRing {
    slots: Vec<Option<Snapshot>>,
}

impl SnapshotRing {
    fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots }
    }

    fn slot(&self, frame: Frame) -> usize {
        frame.as_i32() as usize % self.slots.len()
    }

    /// Moves a snapshot into the ring, evicting (freeing) whatever occupied
    /// its slot.
    fn store<H: RollbackHandler>(&mut self, snapshot: Snapshot, handler: &mut H) {
        let index = self.slot(snapshot.frame);
        if let Some(old) = self.slots[index].take() {
            handler.free_buffer(old);
        }
        self.slots[index] = Some(snapshot);
    }

    fn get(&self, frame: Frame) -> Option<&Snapshot> {
        self.slots[self.slot(frame)]
            .as_ref()
            .filter(|s| s.frame == frame)
    }

    fn free_all<H: RollbackHandler>(&mut self, handler: &mut H) {
        for slot in &mut self.slots {
            if let Some(snapshot) = slot.take() {
                handler.free_buffer(snapshot);
            }
        }
    }
}

/// The synchronization layer: current/confirmed frame tracking, one input
/// queue per player, and the snapshot ring.
#[derive(Debug)]
pub(crate) struct SyncLayer {
    current_frame: Frame,
    last_confirmed_frame: Frame,
    queues: Vec<InputQueue>,
    ring: SnapshotRing,
    recent_checksums: BTreeMap<Frame, u32>,
}

impl SyncLayer {
    pub(crate) fn new(num_players: usize, max_rollback: usize) -> Self {
        // +2: one slot for every speculative frame, one for the confirmed
        // frame itself, one of slack for the save-before-advance ordering
        Self {
            current_frame: Frame::new(0),
            last_confirmed_frame: Frame::NULL,
            queues: (0..num_players).map(|_| InputQueue::new()).collect(),
            ring: SnapshotRing::new(max_rollback + 2),
            recent_checksums: BTreeMap::new(),
        }
    }

    pub(crate) fn current_frame(&self) -> Frame {
        self.current_frame
    }

    pub(crate) fn last_confirmed_frame(&self) -> Frame {
        self.last_confirmed_frame
    }

    pub(crate) fn advance_frame(&mut self) {
        self.current_frame += 1;
    }

    pub(crate) fn set_frame_delay(&mut self, player: usize, delay: usize) {
        self.queues[player].set_frame_delay(delay);
    }

    /// Saves the current frame through the handler and moves the snapshot
    /// into the ring.
    pub(crate) fn save_current<H: RollbackHandler>(
        &mut self,
        handler: &mut H,
    ) -> Result<(), NetplayError> {
        let frame = self.current_frame;
        let snapshot = handler.save_frame(frame)?;
        debug_assert_eq!(snapshot.frame, frame);
        self.recent_checksums.insert(frame, snapshot.checksum);
        while self.recent_checksums.len() > CHECKSUM_HISTORY {
            self.recent_checksums.pop_first();
        }
        self.ring.store(snapshot, handler);
        Ok(())
    }

    /// Restores the machine to `frame` through the handler. The snapshot
    /// stays live in the ring.
    pub(crate) fn load_frame<H: RollbackHandler>(
        &mut self,
        frame: Frame,
        handler: &mut H,
    ) -> Result<(), NetplayError> {
        let rollback_depth = (self.current_frame - frame).max(0) as usize;
        let snapshot = self.ring.get(frame).ok_or(NetplayError::SnapshotLoad)?;
        handler.load_frame(snapshot, rollback_depth)?;
        self.current_frame = frame;
        Ok(())
    }

    /// The checksum recorded when `frame` was last saved.
    pub(crate) fn checksum_for(&self, frame: Frame) -> Option<u32> {
        self.recent_checksums.get(&frame).copied()
    }

    pub(crate) fn add_local_input(
        &mut self,
        player: usize,
        input: NetplayInput,
    ) -> Frame {
        self.queues[player].add_local(self.current_frame, input)
    }

    pub(crate) fn add_remote_input(&mut self, player: usize, frame: Frame, input: NetplayInput) -> Frame {
        self.queues[player].add_remote(frame, input)
    }

    /// Assembles the inputs to simulate the current frame with, one entry
    /// per player.
    pub(crate) fn synchronized_inputs(
        &mut self,
        connect_status: &[ConnectStatus],
    ) -> SmallVec<[(NetplayInput, InputStatus); MAX_PLAYERS]> {
        let frame = self.current_frame;
        let mut inputs = SmallVec::new();
        for (player, queue) in self.queues.iter_mut().enumerate() {
            let status = &connect_status[player];
            if status.disconnected && frame > status.last_frame {
                inputs.push((NetplayInput::BLANK, InputStatus::Disconnected));
            } else {
                inputs.push(queue.input(frame));
            }
        }
        inputs
    }

    /// Marks everything up to `frame` authoritative.
    pub(crate) fn set_last_confirmed_frame(&mut self, frame: Frame) {
        if frame > self.last_confirmed_frame {
            trace!(%frame, "confirmed frame advanced");
            self.last_confirmed_frame = frame;
        }
    }

    /// The earliest frame whose prediction turned out wrong, folding in a
    /// disconnect-triggered correction frame. [`Frame::NULL`] when the
    /// simulation is consistent.
    pub(crate) fn check_simulation_consistency(&self, disconnect_frame: Frame) -> Frame {
        let mut first_incorrect = disconnect_frame;
        for queue in &self.queues {
            let incorrect = queue.first_incorrect_frame();
            if incorrect.is_valid()
                && (first_incorrect.is_null() || incorrect < first_incorrect)
            {
                first_incorrect = incorrect;
            }
        }
        first_incorrect
    }

    pub(crate) fn reset_prediction(&mut self) {
        for queue in &mut self.queues {
            queue.reset_prediction();
        }
    }

    /// Returns every live snapshot buffer to the pool. Called on teardown.
    pub(crate) fn free_all<H: RollbackHandler>(&mut self, handler: &mut H) {
        debug!("releasing all live snapshots");
        self.ring.free_all(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollback::RollbackEvent;

    /// Handler that "saves" a counter state and tracks pool discipline.
    struct CountingHandler {
        pool: SnapshotPool,
        state: u32,
        saves: usize,
        frees: usize,
        loads: Vec<Frame>,
    }

    impl CountingHandler {
        fn new() -> Self {
            Self {
                pool: SnapshotPool::new(),
                state: 0,
                saves: 0,
                frees: 0,
                loads: Vec::new(),
            }
        }
    }

    impl RollbackHandler for CountingHandler {
        fn save_frame(&mut self, frame: Frame) -> Result<Snapshot, NetplayError> {
            self.saves += 1;
            let mut data = self.pool.acquire();
            data.extend_from_slice(&self.state.to_le_bytes());
            Ok(Snapshot {
                frame,
                data,
                checksum: self.state,
            })
        }

        fn load_frame(
            &mut self,
            snapshot: &Snapshot,
            _rollback_depth: usize,
        ) -> Result<(), NetplayError> {
            let bytes: [u8; 4] = snapshot.data[..4].try_into().map_err(|_| NetplayError::SnapshotLoad)?;
            self.state = u32::from_le_bytes(bytes);
            self.loads.push(snapshot.frame);
            Ok(())
        }

        fn advance_frame(
            &mut self,
            _inputs: &[(NetplayInput, InputStatus)],
            _flags: AdvanceFlags,
        ) {
            self.state += 1;
        }

        fn free_buffer(&mut self, snapshot: Snapshot) {
            self.frees += 1;
            self.pool.release(snapshot.data);
        }

        fn on_event(&mut self, _event: RollbackEvent) {}
    }

    fn advance_one(layer: &mut SyncLayer, handler: &mut CountingHandler) {
        layer.save_current(handler).unwrap();
        handler.advance_frame(&[], AdvanceFlags { rollback: false });
        layer.advance_frame();
    }

    #[test]
    fn save_then_load_restores_state() {
        let mut layer = SyncLayer::new(1, 4);
        let mut handler = CountingHandler::new();

        for _ in 0..3 {
            advance_one(&mut layer, &mut handler);
        }
        let state_at_3 = handler.state;
        advance_one(&mut layer, &mut handler);
        assert_ne!(handler.state, state_at_3);

        layer.load_frame(Frame::new(3), &mut handler).unwrap();
        assert_eq!(layer.current_frame(), Frame::new(3));
        assert_eq!(handler.state, state_at_3);
    }

    #[test]
    fn every_free_matches_an_eviction() {
        let mut layer = SyncLayer::new(1, 2);
        let mut handler = CountingHandler::new();

        // ring capacity is max_rollback + 2 = 4; after N saves there have
        // been N - 4 evictions
        for _ in 0..10 {
            advance_one(&mut layer, &mut handler);
        }
        assert_eq!(handler.saves, 10);
        assert_eq!(handler.frees, 6);

        layer.free_all(&mut handler);
        assert_eq!(handler.frees, 10);
        // every buffer is back in the pool, none aliased
        assert_eq!(handler.pool.available(), 10);
    }

    #[test]
    fn load_of_evicted_frame_fails() {
        let mut layer = SyncLayer::new(1, 2);
        let mut handler = CountingHandler::new();
        for _ in 0..8 {
            advance_one(&mut layer, &mut handler);
        }
        // frame 0 left the ring long ago
        assert!(layer.load_frame(Frame::new(0), &mut handler).is_err());
    }

    #[test]
    fn window_of_recent_frames_stays_loadable() {
        let mut layer = SyncLayer::new(1, 4);
        let mut handler = CountingHandler::new();
        for _ in 0..20 {
            advance_one(&mut layer, &mut handler);
        }
        // frames current-1 .. current-window are all still in the ring
        for back in 1..=4 {
            let frame = layer.current_frame() - back;
            assert!(
                layer.load_frame(frame, &mut handler).is_ok(),
                "frame {frame} should be loadable"
            );
            // restore position for the next check
            layer.current_frame = Frame::new(20);
        }
    }

    #[test]
    fn checksum_history_tracks_saves() {
        let mut layer = SyncLayer::new(1, 4);
        let mut handler = CountingHandler::new();
        advance_one(&mut layer, &mut handler);
        advance_one(&mut layer, &mut handler);
        assert_eq!(layer.checksum_for(Frame::new(0)), Some(0));
        assert_eq!(layer.checksum_for(Frame::new(1)), Some(1));
        assert_eq!(layer.checksum_for(Frame::new(5)), None);
    }

    #[test]
    fn consistency_folds_in_disconnect_frame() {
        let layer = SyncLayer::new(2, 4);
        assert!(layer.check_simulation_consistency(Frame::NULL).is_null());
        assert_eq!(
            layer.check_simulation_consistency(Frame::new(7)),
            Frame::new(7)
        );
    }

    #[test]
    fn disconnected_player_gets_blank_inputs_past_their_last_frame() {
        let mut layer = SyncLayer::new(2, 4);
        layer.add_remote_input(1, Frame::new(0), NetplayInput { buttons: 5 });
        let status = [
            ConnectStatus::default(),
            ConnectStatus {
                disconnected: true,
                last_frame: Frame::new(0),
            },
        ];
        // frame 0: their real input still applies
        let inputs = layer.synchronized_inputs(&status);
        assert_eq!(inputs[1], (NetplayInput { buttons: 5 }, InputStatus::Confirmed));
        // frame 1: disconnected blank
        layer.advance_frame();
        let inputs = layer.synchronized_inputs(&status);
        assert_eq!(inputs[1], (NetplayInput::BLANK, InputStatus::Disconnected));
    }
}
