//! Rewind correctness: a pair of rollback sessions whose inputs arrive late
//! must converge on exactly the state a delay-free reference run produces.

use std::collections::VecDeque;

use rollnet::{
    AdvanceFlags, DatagramSink, Frame, InputStatus, NetplayError, NetplayInput, PeerHandle,
    PlayerId, PlayerKind, RollbackConfig, RollbackEvent, RollbackHandler, RollbackSession,
    Snapshot, SnapshotPool,
};

const TARGET_FRAME: i32 = 100;
/// Iterations of artificial one-way latency applied to every datagram.
const WIRE_DELAY: usize = 3;

/// Deterministic machine stand-in: the state is a hash of the full input
/// history, so one wrong or misordered input changes everything after it.
struct HashMachine {
    pool: SnapshotPool,
    state: u64,
    rollbacks: usize,
    events: Vec<RollbackEvent>,
}

impl HashMachine {
    fn new() -> Self {
        Self {
            pool: SnapshotPool::new(),
            state: 0,
            rollbacks: 0,
            events: Vec::new(),
        }
    }
}

fn mix(state: u64, inputs: &[NetplayInput]) -> u64 {
    let mut mixed = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    for input in inputs {
        mixed = mixed.wrapping_add(u64::from(input.buttons)).rotate_left(7);
    }
    mixed
}

impl RollbackHandler for HashMachine {
    fn save_frame(&mut self, frame: Frame) -> Result<Snapshot, NetplayError> {
        let mut data = self.pool.acquire();
        data.extend_from_slice(&self.state.to_le_bytes());
        Ok(Snapshot {
            frame,
            data,
            checksum: self.state as u32,
        })
    }

    fn load_frame(&mut self, snapshot: &Snapshot, _depth: usize) -> Result<(), NetplayError> {
        self.rollbacks += 1;
        let bytes: [u8; 8] = snapshot.data[..8]
            .try_into()
            .map_err(|_| NetplayError::SnapshotLoad)?;
        self.state = u64::from_le_bytes(bytes);
        Ok(())
    }

    fn advance_frame(&mut self, inputs: &[(NetplayInput, InputStatus)], _flags: AdvanceFlags) {
        let raw: Vec<NetplayInput> = inputs.iter().map(|(input, _)| *input).collect();
        self.state = mix(self.state, &raw);
    }

    fn free_buffer(&mut self, snapshot: Snapshot) {
        self.pool.release(snapshot.data);
    }

    fn on_event(&mut self, event: RollbackEvent) {
        self.events.push(event);
    }
}

/// Captures outgoing datagrams so the test can delay their delivery.
#[derive(Default)]
struct CaptureSink {
    sent: Vec<Vec<u8>>,
}

impl DatagramSink for CaptureSink {
    fn send_datagram(&mut self, _peer: PeerHandle, bytes: &[u8]) {
        self.sent.push(bytes.to_vec());
    }
}

/// One endpoint of the simulated pair.
struct Side {
    session: RollbackSession,
    machine: HashMachine,
    local: PlayerId,
    /// Packets waiting to be delivered to this side: (due iteration, bytes).
    inbox: VecDeque<(usize, Vec<u8>)>,
    remote_peer: PeerHandle,
}

impl Side {
    fn new(local: usize) -> Self {
        let config = RollbackConfig {
            num_players: 2,
            input_delay: 0,
            checksum_interval: 10,
            ..RollbackConfig::default()
        };
        let mut session = RollbackSession::new(config).unwrap();
        let remote_peer = PeerHandle::new(0);
        for player in 0..2 {
            let kind = if player == local {
                PlayerKind::Local
            } else {
                PlayerKind::Remote(remote_peer)
            };
            session.add_player(kind, PlayerId::new(player)).unwrap();
        }
        session.start().unwrap();
        Self {
            session,
            machine: HashMachine::new(),
            local: PlayerId::new(local),
            inbox: VecDeque::new(),
            remote_peer,
        }
    }

    fn deliver_due(&mut self, iteration: usize) {
        while self
            .inbox
            .front()
            .is_some_and(|(due, _)| *due <= iteration)
        {
            let (_, bytes) = self.inbox.pop_front().unwrap();
            self.session.handle_packet(self.remote_peer, &bytes);
        }
    }
}

fn input_script(player: usize, frame: i32) -> NetplayInput {
    // arbitrary but deterministic and different per player per frame
    NetplayInput {
        buttons: (frame as u32)
            .wrapping_mul(2654435761)
            .wrapping_add(player as u32 * 0x9e37)
            & 0xFFFF,
    }
}

fn step_side(side: &mut Side, other: &mut Side, iteration: usize, delay: usize) {
    side.deliver_due(iteration);
    side.session.idle(&mut side.machine).unwrap();

    if side.session.is_running() && side.session.current_frame() < TARGET_FRAME {
        let frame = side.session.current_frame();
        let input = input_script(side.local.as_usize(), frame.as_i32());
        match side.session.add_local_input(side.local, input) {
            Ok(()) => side.session.advance_frame(&mut side.machine).unwrap(),
            Err(NetplayError::PredictionThreshold) => {},
            Err(error) => panic!("unexpected error: {error}"),
        }
    }

    let mut sink = CaptureSink::default();
    side.session.network_idle(&mut sink);
    for bytes in sink.sent {
        other.inbox.push_back((iteration + delay, bytes));
    }
}

fn run_pair(delay: usize) -> (Side, Side) {
    let mut a = Side::new(0);
    let mut b = Side::new(1);

    for iteration in 0..20_000usize {
        step_side(&mut a, &mut b, iteration, delay);
        step_side(&mut b, &mut a, iteration, delay);

        let both_done = a.session.current_frame() == TARGET_FRAME
            && b.session.current_frame() == TARGET_FRAME
            && a.session.confirmed_frame() >= TARGET_FRAME - 1
            && b.session.confirmed_frame() >= TARGET_FRAME - 1;
        if both_done {
            // a few extra idles let any final corrections settle
            for _ in 0..4 {
                a.deliver_due(usize::MAX - 1);
                b.deliver_due(usize::MAX - 1);
                a.session.idle(&mut a.machine).unwrap();
                b.session.idle(&mut b.machine).unwrap();
            }
            return (a, b);
        }
    }
    panic!(
        "sessions never converged: a at {} (confirmed {}), b at {} (confirmed {})",
        a.session.current_frame(),
        a.session.confirmed_frame(),
        b.session.current_frame(),
        b.session.confirmed_frame()
    );
}

fn reference_state() -> u64 {
    let mut state = 0u64;
    for frame in 0..TARGET_FRAME {
        let inputs = [input_script(0, frame), input_script(1, frame)];
        state = mix(state, &inputs);
    }
    state
}

#[test]
fn delayed_inputs_converge_on_the_reference_run() {
    let (a, b) = run_pair(WIRE_DELAY);
    let expected = reference_state();

    assert_eq!(
        a.machine.state, expected,
        "side a diverged from the reference run"
    );
    assert_eq!(
        b.machine.state, expected,
        "side b diverged from the reference run"
    );
    // with three iterations of latency, predictions had to be corrected
    assert!(
        a.machine.rollbacks > 0 || b.machine.rollbacks > 0,
        "expected at least one rollback under wire delay"
    );
}

#[test]
fn zero_delay_still_matches_reference() {
    let (a, b) = run_pair(0);
    let expected = reference_state();
    assert_eq!(a.machine.state, expected);
    assert_eq!(b.machine.state, expected);
}

#[test]
fn no_desync_events_between_honest_peers() {
    let (a, b) = run_pair(WIRE_DELAY);
    let desyncs = |side: &Side| {
        side.machine
            .events
            .iter()
            .filter(|e| matches!(e, RollbackEvent::Desync { .. }))
            .count()
    };
    assert_eq!(desyncs(&a), 0);
    assert_eq!(desyncs(&b), 0);
}
