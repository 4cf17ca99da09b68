//! Collaborator seams: the emulated machine and the GUI host.
//!
//! The netplay core never touches the emulator or the UI directly. The
//! machine is an opaque deterministic box that can run one frame, serialize
//! itself, and restore itself; the host is a narrow callback surface for
//! messages, errors, and loading screens. Both are driven exclusively from
//! the session runner's thread.

use crate::{NetplayError, NetplayInput};

/// The emulated machine. Implementations must be deterministic: two machines
/// restored from the same snapshot and fed the same inputs must produce
/// byte-identical snapshots thereafter; rollback and desync detection both
/// depend on it.
pub trait Machine {
    /// Advances the machine by exactly one frame using the pad state
    /// previously set via [`set_pad`](Machine::set_pad).
    fn run_frame(&mut self);

    /// Serializes the complete machine state into `buffer`, replacing its
    /// contents. The buffer comes from the snapshot pool and may already have
    /// capacity from an earlier save.
    fn save_state(&mut self, buffer: &mut Vec<u8>) -> Result<(), NetplayError>;

    /// Restores the machine from a snapshot produced by
    /// [`save_state`](Machine::save_state).
    fn load_state(&mut self, bytes: &[u8]) -> Result<(), NetplayError>;

    /// Sets the digital pad state for a controller port before the next
    /// frame.
    fn set_pad(&mut self, port: usize, input: NetplayInput);

    /// Mutes or unmutes audio output. The session runner mutes the machine
    /// for the duration of rollback replays.
    fn set_audio_muted(&mut self, muted: bool);

    /// Nominal frame rate of the machine (e.g. 60.0 or 59.94). The frame
    /// pacer derives its period from this.
    fn nominal_frame_rate(&self) -> f32;
}

/// The GUI host. All user-visible output of a session flows through here.
pub trait HostInterface {
    /// Displays a netplay chat or system message.
    fn on_netplay_message(&mut self, text: &str);

    /// Shows or updates the loading screen. `progress` is a percentage when
    /// known.
    fn display_loading_screen(&mut self, text: &str, progress: Option<i32>);

    /// Gives the host a chance to process window/UI messages on the session
    /// thread. Called once per outer-loop iteration.
    fn pump_messages(&mut self);

    /// Reports a user-visible error without blocking the session thread.
    fn report_error(&mut self, title: &str, message: &str);

    /// Applies (`Some`) or clears (`None`) the deterministic settings layer
    /// that netplay sessions require.
    fn set_settings_layer(&mut self, overlay: Option<SettingsOverlay>);

    /// Presents the most recently rendered frame.
    fn present_frame(&mut self);
}

/// The settings forced for the duration of a session. Every field pins a
/// behavior that would otherwise break cross-peer determinism or rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingsOverlay {
    /// Force digital controllers on every port.
    pub digital_controllers: bool,
    /// Runahead must be off; the rollback engine owns speculation.
    pub runahead_frames: u32,
    /// The host-side rewind feature must be off.
    pub rewind_enabled: bool,
    /// Recompiler block linking interferes with mid-block state restores.
    pub recompiler_block_linking: bool,
    /// Readbacks must use the software renderer so snapshots capture them.
    pub software_renderer_readbacks: bool,
}

impl SettingsOverlay {
    /// The overlay applied for every netplay session.
    #[must_use]
    pub fn for_session() -> Self {
        Self {
            digital_controllers: true,
            runahead_frames: 0,
            rewind_enabled: false,
            recompiler_block_linking: false,
            software_renderer_readbacks: true,
        }
    }
}
