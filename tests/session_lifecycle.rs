//! End-to-end session scenarios over loopback UDP: hosting, the join
//! handshake, resync on peer loss, connect timeouts, and malformed resets.

mod common;

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use serial_test::serial;

use common::{RecordingHost, ScriptedMachine, SharedInput};
use rollnet::control::{ConnectResult, ControlMessage, ResetMessage, RosterEntry};
use rollnet::{
    Channel, NetplayError, NetplaySession, PlayerId, SessionOptions, SessionState, Transport,
    TransportEvent, MAX_PLAYERS,
};

type TestSession = NetplaySession<ScriptedMachine, RecordingHost, SharedInput>;

fn options(nickname: &str) -> SessionOptions {
    SessionOptions {
        nickname: nickname.to_owned(),
        local_port: 0,
        connect_timeout: Duration::from_secs(8),
        close_timeout: Duration::from_millis(300),
        ..SessionOptions::default()
    }
}

fn localhost(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

struct Peer {
    session: TestSession,
    machine: std::rc::Rc<std::cell::RefCell<common::MachineLog>>,
    host_log: std::rc::Rc<std::cell::RefCell<common::HostLog>>,
}

fn host_peer(nickname: &str) -> Peer {
    let (machine, machine_log) = ScriptedMachine::new();
    let (host_if, host_log) = RecordingHost::new();
    let (input, _) = SharedInput::new();
    let session =
        NetplaySession::create_session(machine, host_if, input, options(nickname)).unwrap();
    Peer {
        session,
        machine: machine_log,
        host_log,
    }
}

fn join_peer(nickname: &str, host_addr: SocketAddr) -> Peer {
    let (machine, machine_log) = ScriptedMachine::new();
    let (host_if, host_log) = RecordingHost::new();
    let (input, _) = SharedInput::new();
    let session =
        NetplaySession::join_session(machine, host_if, input, host_addr, options(nickname))
            .unwrap();
    Peer {
        session,
        machine: machine_log,
        host_log,
    }
}

fn addr_of(session: &TestSession) -> SocketAddr {
    localhost(session.local_addr().unwrap().port())
}

/// Steps every peer round-robin until `done` or the budget runs out.
fn step_until(peers: &mut [&mut Peer], budget: Duration, mut done: impl FnMut(&[&mut Peer]) -> bool) -> bool {
    let deadline = Instant::now() + budget;
    while Instant::now() < deadline {
        for peer in peers.iter_mut() {
            peer.session.step();
        }
        if done(peers) {
            return true;
        }
    }
    false
}

#[test]
#[serial]
fn host_only_start_is_running_with_one_player() {
    let mut host = host_peer("A");
    assert_eq!(host.session.state(), SessionState::Running);
    assert!(host.session.is_host());
    assert!(host.session.is_active());
    assert_eq!(host.session.num_players(), 1);
    assert_eq!(host.session.local_player_id(), PlayerId::HOST);
    assert!(host.host_log.borrow().overlay.is_some());

    // a solo session advances frames immediately
    for _ in 0..20 {
        host.session.step();
    }
    assert!(host.machine.borrow().frames > 0);
    assert!(host.host_log.borrow().frames_presented > 0);
}

#[test]
#[serial]
fn join_handshake_reaches_running_on_both_peers() {
    let mut host = host_peer("A");
    // give the host machine visible progress so the snapshot is non-trivial
    for _ in 0..20 {
        host.session.step();
    }
    let pre_join_state = host.machine.borrow().state;
    assert_ne!(pre_join_state, 0);

    let mut joiner = join_peer("B", addr_of(&host.session));

    let connected = step_until(
        &mut [&mut host, &mut joiner],
        Duration::from_secs(15),
        |peers| {
            peers.iter().all(|p| {
                p.session.state() == SessionState::Running && p.session.num_players() == 2
            })
        },
    );
    assert!(connected, "join handshake never completed");

    assert!(host.session.is_host());
    assert!(!joiner.session.is_host());
    assert_eq!(joiner.session.local_player_id(), PlayerId::new(1));
    // the joiner loaded the host's snapshot during the reset
    assert!(joiner.machine.borrow().loads >= 1);
    assert!(host
        .host_log
        .borrow()
        .messages
        .iter()
        .any(|m| m.contains("B joined the session")));
    assert!(!joiner.host_log.borrow().loading_screens.is_empty());

    // and the lockstep loop actually runs on both sides
    let join_frames = joiner.machine.borrow().frames;
    let advancing = step_until(
        &mut [&mut host, &mut joiner],
        Duration::from_secs(15),
        |peers| peers[1].machine.borrow().frames >= join_frames + 30,
    );
    assert!(advancing, "joiner never advanced frames after the resync");

    // chat flows over the control channel
    host.session.send_chat_message("hello");
    let chatted = step_until(
        &mut [&mut host, &mut joiner],
        Duration::from_secs(5),
        |peers| {
            peers[1]
                .host_log
                .borrow()
                .messages
                .iter()
                .any(|m| m == "A: hello")
        },
    );
    assert!(chatted, "chat message never arrived");
}

#[test]
#[serial]
fn third_peer_drop_triggers_resync_of_the_rest() {
    let mut host = host_peer("A");
    let mut first = join_peer("B", addr_of(&host.session));

    let two = step_until(
        &mut [&mut host, &mut first],
        Duration::from_secs(15),
        |peers| {
            peers.iter().all(|p| {
                p.session.state() == SessionState::Running && p.session.num_players() == 2
            })
        },
    );
    assert!(two, "first join never completed");

    let mut second = join_peer("C", addr_of(&host.session));
    let three = step_until(
        &mut [&mut host, &mut first, &mut second],
        Duration::from_secs(20),
        |peers| {
            peers.iter().all(|p| {
                p.session.state() == SessionState::Running && p.session.num_players() == 3
            })
        },
    );
    assert!(three, "second join never completed");
    assert_eq!(second.session.local_player_id(), PlayerId::new(2));

    // peer C vanishes without a word; the engines notice the silence, the
    // host drops it and resyncs the remaining pair
    drop(second);
    let recovered = step_until(
        &mut [&mut host, &mut first],
        Duration::from_secs(25),
        |peers| {
            peers.iter().all(|p| {
                p.session.state() == SessionState::Running && p.session.num_players() == 2
            })
        },
    );
    assert!(recovered, "session never recovered from the dropped peer");
    assert!(first
        .host_log
        .borrow()
        .messages
        .iter()
        .any(|m| m.contains("left the session")));
}

#[test]
#[serial]
fn connect_timeout_surfaces_after_retries() {
    // bind and immediately drop a socket so nothing answers on the port
    let dead_port = {
        let socket = UdpSocket::bind(localhost(0)).unwrap();
        socket.local_addr().unwrap().port()
    };
    let (machine, machine_log) = ScriptedMachine::new();
    let (host_if, host_log) = RecordingHost::new();
    let (input, _) = SharedInput::new();
    let opts = SessionOptions {
        connect_timeout: Duration::from_millis(1200),
        connect_retries: 2,
        close_timeout: Duration::from_millis(200),
        ..options("J")
    };
    let mut session =
        NetplaySession::join_session(machine, host_if, input, localhost(dead_port), opts)
            .unwrap();

    let started = Instant::now();
    let result = session.execute();
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(NetplayError::ConnectTimeout)));
    assert!(!session.is_active());
    assert!(elapsed >= Duration::from_millis(1200));
    assert!(elapsed < Duration::from_secs(10));
    let log = host_log.borrow();
    assert!(log
        .errors
        .iter()
        .any(|(_, message)| message.contains("Connection failed")));
    // the settings overlay was applied and cleared again
    assert!(log.overlay.is_none());
    assert!(log.overlay_sets >= 1 && log.overlay_clears >= 1);
    // the machine was never touched
    assert_eq!(machine_log.borrow().loads, 0);
}

#[test]
#[serial]
fn malformed_reset_closes_the_joiner_without_touching_the_machine() {
    // a bare transport impersonates a host
    let mut fake_host = Transport::start(0, MAX_PLAYERS).unwrap();
    let fake_addr = localhost(fake_host.local_addr().unwrap().port());

    let (machine, machine_log) = ScriptedMachine::new();
    let (host_if, host_log) = RecordingHost::new();
    let (input, _) = SharedInput::new();
    let mut joiner =
        NetplaySession::join_session(machine, host_if, input, fake_addr, options("B")).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while joiner.is_active() && Instant::now() < deadline {
        joiner.step();
        while let Some(event) = fake_host.poll(Instant::now() + Duration::from_millis(2)) {
            let TransportEvent::Received {
                peer,
                channel: Channel::Control,
                bytes,
            } = event
            else {
                continue;
            };
            if !matches!(
                ControlMessage::decode(&bytes),
                Ok(ControlMessage::ConnectRequest { .. })
            ) {
                continue;
            }
            let response = ControlMessage::ConnectResponse {
                result: ConnectResult::Success,
                player_id: 1,
            };
            fake_host
                .send(peer, Channel::Control, &response.encode())
                .unwrap();

            // a reset whose declared snapshot size exceeds the bytes present
            let mut players = vec![None; MAX_PLAYERS];
            players[0] = Some(RosterEntry {
                controller_port: 0,
                nickname: "A".to_owned(),
                addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, fake_addr.port()),
            });
            players[1] = Some(RosterEntry {
                controller_port: 1,
                nickname: "B".to_owned(),
                addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1),
            });
            let mut reset_bytes = ControlMessage::Reset(ResetMessage {
                cookie: 1,
                num_players: 2,
                players,
                state_data: vec![0; 32],
            })
            .encode();
            // state_data_size now claims far more than the packet carries
            reset_bytes[4..8].copy_from_slice(&u32::MAX.to_le_bytes());
            fake_host
                .send(peer, Channel::Control, &reset_bytes)
                .unwrap();
        }
    }

    assert!(!joiner.is_active(), "joiner never closed");
    // rejected before any state was loaded
    assert_eq!(machine_log.borrow().loads, 0);
    assert!(host_log
        .borrow()
        .errors
        .iter()
        .any(|(_, message)| message.contains("invalid session state")));
}
