//! Shared collaborator stubs for the integration suites.
//!
//! The stubs share their observable state through `Rc<RefCell<..>>` handles
//! so a test can hand the stub to a session (which takes ownership) and
//! still inspect what happened. Sessions are single-threaded, so `Rc` is
//! exactly right.
#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use rollnet::{
    HostInterface, InputProvider, Machine, NetplayError, NetplayInput, SettingsOverlay,
    MAX_PLAYERS, NUM_BINDINGS,
};

/// Observable state of a [`ScriptedMachine`].
#[derive(Debug, Default)]
pub struct MachineLog {
    pub state: u64,
    pub frames: u64,
    pub saves: usize,
    pub loads: usize,
    pub muted: bool,
}

/// Deterministic stand-in for the emulated machine: the state is a running
/// hash of every pad input it has ever consumed, so two machines fed the
/// same inputs in the same order are bit-identical and any divergence is
/// loud.
pub struct ScriptedMachine {
    log: Rc<RefCell<MachineLog>>,
    pads: [NetplayInput; MAX_PLAYERS],
}

impl ScriptedMachine {
    pub fn new() -> (Self, Rc<RefCell<MachineLog>>) {
        let log = Rc::new(RefCell::new(MachineLog::default()));
        (
            Self {
                log: log.clone(),
                pads: [NetplayInput::BLANK; MAX_PLAYERS],
            },
            log,
        )
    }
}

/// The state transition both the scripted machine and reference runs use.
pub fn mix_state(state: u64, inputs: &[NetplayInput]) -> u64 {
    let mut mixed = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    for input in inputs {
        mixed = mixed.wrapping_add(u64::from(input.buttons)).rotate_left(7);
    }
    mixed
}

impl Machine for ScriptedMachine {
    fn run_frame(&mut self) {
        let mut log = self.log.borrow_mut();
        log.state = mix_state(log.state, &self.pads);
        log.frames += 1;
    }

    fn save_state(&mut self, buffer: &mut Vec<u8>) -> Result<(), NetplayError> {
        let mut log = self.log.borrow_mut();
        log.saves += 1;
        buffer.clear();
        buffer.extend_from_slice(&log.state.to_le_bytes());
        buffer.extend_from_slice(&log.frames.to_le_bytes());
        Ok(())
    }

    fn load_state(&mut self, bytes: &[u8]) -> Result<(), NetplayError> {
        if bytes.len() != 16 {
            return Err(NetplayError::SnapshotLoad);
        }
        let mut log = self.log.borrow_mut();
        log.loads += 1;
        log.state = u64::from_le_bytes(bytes[..8].try_into().map_err(|_| NetplayError::SnapshotLoad)?);
        log.frames = u64::from_le_bytes(bytes[8..].try_into().map_err(|_| NetplayError::SnapshotLoad)?);
        Ok(())
    }

    fn set_pad(&mut self, port: usize, input: NetplayInput) {
        if let Some(pad) = self.pads.get_mut(port) {
            *pad = input;
        }
    }

    fn set_audio_muted(&mut self, muted: bool) {
        self.log.borrow_mut().muted = muted;
    }

    fn nominal_frame_rate(&self) -> f32 {
        // fast frames keep the integration tests quick
        240.0
    }
}

/// Observable state of a [`RecordingHost`].
#[derive(Debug, Default)]
pub struct HostLog {
    pub messages: Vec<String>,
    pub errors: Vec<(String, String)>,
    pub loading_screens: Vec<String>,
    pub overlay: Option<SettingsOverlay>,
    pub overlay_sets: usize,
    pub overlay_clears: usize,
    pub frames_presented: u64,
}

/// Host interface that records every callback.
pub struct RecordingHost {
    log: Rc<RefCell<HostLog>>,
}

impl RecordingHost {
    pub fn new() -> (Self, Rc<RefCell<HostLog>>) {
        let log = Rc::new(RefCell::new(HostLog::default()));
        (Self { log: log.clone() }, log)
    }
}

impl HostInterface for RecordingHost {
    fn on_netplay_message(&mut self, text: &str) {
        self.log.borrow_mut().messages.push(text.to_owned());
    }

    fn display_loading_screen(&mut self, text: &str, _progress: Option<i32>) {
        self.log.borrow_mut().loading_screens.push(text.to_owned());
    }

    fn pump_messages(&mut self) {}

    fn report_error(&mut self, title: &str, message: &str) {
        self.log
            .borrow_mut()
            .errors
            .push((title.to_owned(), message.to_owned()));
    }

    fn set_settings_layer(&mut self, overlay: Option<SettingsOverlay>) {
        let mut log = self.log.borrow_mut();
        match overlay {
            Some(overlay) => {
                log.overlay_sets += 1;
                log.overlay = Some(overlay);
            },
            None => {
                log.overlay_clears += 1;
                log.overlay = None;
            },
        }
    }

    fn present_frame(&mut self) {
        self.log.borrow_mut().frames_presented += 1;
    }
}

/// Input provider whose button word can be changed from outside the session.
pub struct SharedInput {
    buttons: Rc<RefCell<u32>>,
}

impl SharedInput {
    pub fn new() -> (Self, Rc<RefCell<u32>>) {
        let buttons = Rc::new(RefCell::new(0));
        (
            Self {
                buttons: buttons.clone(),
            },
            buttons,
        )
    }
}

impl InputProvider for SharedInput {
    fn input_value(&mut self, slot: usize, binding: usize) -> f32 {
        if slot != 0 || binding >= NUM_BINDINGS {
            return 0.0;
        }
        if *self.buttons.borrow() & (1 << binding) != 0 {
            1.0
        } else {
            0.0
        }
    }
}
