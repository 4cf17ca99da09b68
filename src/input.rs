//! Controller input: the wire bitfield and the sampling seam.

use serde::{Deserialize, Serialize};

use crate::{Frame, NUM_BINDINGS};

/// Analog values at or above this threshold register as a pressed button.
pub const BUTTON_THRESHOLD: f32 = 0.25;

/// The immutable button bitfield exchanged between peers for one player for
/// one frame. Bit `i` corresponds to digital binding `i`.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
pub struct NetplayInput {
    /// Packed button bits.
    pub buttons: u32,
}

impl NetplayInput {
    /// An input with no buttons pressed. Also used for disconnected players.
    pub const BLANK: NetplayInput = NetplayInput { buttons: 0 };

    /// Returns whether binding `i` is pressed.
    #[inline]
    #[must_use]
    pub const fn pressed(self, binding: usize) -> bool {
        self.buttons & (1 << binding) != 0
    }

    /// Returns a copy with binding `i` set.
    #[inline]
    #[must_use]
    pub const fn with(self, binding: usize) -> Self {
        Self {
            buttons: self.buttons | (1 << binding),
        }
    }
}

/// Per-slot, per-binding analog value source: the seam to the emulator's
/// controller layer. Values are expected in `[0.0, 1.0]`.
pub trait InputProvider {
    /// Returns the current value of `binding` on controller `slot`.
    fn input_value(&mut self, slot: usize, binding: usize) -> f32;
}

/// Samples the local digital input for one frame. Only controller slot 0 is
/// supported.
pub fn sample_local_input(provider: &mut impl InputProvider) -> NetplayInput {
    let mut input = NetplayInput::BLANK;
    for binding in 0..NUM_BINDINGS {
        if provider.input_value(0, binding) >= BUTTON_THRESHOLD {
            input = input.with(binding);
        }
    }
    input
}

/// One player's input for one frame. `frame` is [`Frame::NULL`] for inputs
/// that were dropped or never assigned.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PlayerInput {
    /// The frame this input belongs to.
    pub frame: Frame,
    /// The button bitfield.
    pub input: NetplayInput,
}

impl PlayerInput {
    /// Creates a new `PlayerInput`.
    #[must_use]
    pub fn new(frame: Frame, input: NetplayInput) -> Self {
        Self { frame, input }
    }

    /// Creates a blank input for the given frame.
    #[must_use]
    pub fn blank(frame: Frame) -> Self {
        Self {
            frame,
            input: NetplayInput::BLANK,
        }
    }
}
