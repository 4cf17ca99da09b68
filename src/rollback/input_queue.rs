//! Per-player input ring with frame delay and prediction.
//!
//! Each player has one queue. Authoritative inputs are added strictly in
//! frame order. When the engine asks for a frame the queue does not hold yet
//! (a remote player's input that has not arrived), the queue starts
//! predicting by repeating the last confirmed input and keeps returning that
//! same value until the prediction is reset. When the real input later
//! arrives, it is compared against the prediction that was handed out; the
//! first disagreeing frame becomes `first_incorrect_frame`, which is what
//! triggers a rollback.

use tracing::trace;

use crate::input::PlayerInput;
use crate::{Frame, InputStatus, NetplayInput};

/// Ring capacity. Far larger than any supported prediction window, so slots
/// recycle long after their frames stop mattering.
pub(crate) const INPUT_QUEUE_LENGTH: usize = 128;

/// The highest frame delay the ring can absorb while staying coherent.
pub(crate) const MAX_FRAME_DELAY: usize = INPUT_QUEUE_LENGTH - 1;

#[derive(Debug)]
pub(crate) struct InputQueue {
    /// Ring of authoritative inputs; slot `frame % INPUT_QUEUE_LENGTH`.
    /// A slot whose stored frame does not match the lookup frame is stale.
    inputs: Vec<PlayerInput>,
    /// Local-player sending delay, in frames.
    frame_delay: usize,
    /// Highest authoritative frame added so far.
    last_added_frame: Frame,
    /// The value handed out while predicting; `frame` is NULL when not
    /// predicting.
    prediction: PlayerInput,
    /// Highest frame the engine has requested.
    last_requested_frame: Frame,
    /// First frame whose authoritative input disagreed with the prediction.
    first_incorrect_frame: Frame,
}

impl InputQueue {
    pub(crate) fn new() -> Self {
        Self {
            inputs: vec![PlayerInput::blank(Frame::NULL); INPUT_QUEUE_LENGTH],
            frame_delay: 0,
            last_added_frame: Frame::NULL,
            prediction: PlayerInput::blank(Frame::NULL),
            last_requested_frame: Frame::NULL,
            first_incorrect_frame: Frame::NULL,
        }
    }

    pub(crate) fn set_frame_delay(&mut self, delay: usize) {
        self.frame_delay = delay;
    }

    pub(crate) fn last_added_frame(&self) -> Frame {
        self.last_added_frame
    }

    pub(crate) fn first_incorrect_frame(&self) -> Frame {
        self.first_incorrect_frame
    }

    /// Forgets the current prediction and any recorded misprediction. Called
    /// after a rollback has replayed past the incorrect frames.
    pub(crate) fn reset_prediction(&mut self) {
        self.prediction.frame = Frame::NULL;
        self.first_incorrect_frame = Frame::NULL;
        self.last_requested_frame = Frame::NULL;
    }

    /// Returns the authoritative input for `frame`, if the ring still holds
    /// it.
    pub(crate) fn confirmed_input(&self, frame: Frame) -> Option<NetplayInput> {
        let slot = &self.inputs[ring_slot(frame)];
        (slot.frame == frame).then_some(slot.input)
    }

    /// Returns the input to simulate `frame` with: the authoritative input
    /// when it is here, otherwise a repeat-last-confirmed prediction.
    pub(crate) fn input(&mut self, frame: Frame) -> (NetplayInput, InputStatus) {
        if self.last_requested_frame.is_null() || frame > self.last_requested_frame {
            self.last_requested_frame = frame;
        }

        if self.prediction.frame.is_valid() {
            return (self.prediction.input, InputStatus::Predicted);
        }

        if let Some(input) = self.confirmed_input(frame) {
            return (input, InputStatus::Confirmed);
        }

        // not here yet: start predicting by repeating the last confirmed
        // input (or blank if there has never been one)
        self.prediction.frame = frame;
        self.prediction.input = if self.last_added_frame.is_valid() {
            self.inputs[ring_slot(self.last_added_frame)].input
        } else {
            NetplayInput::BLANK
        };
        trace!(%frame, "predicting input");
        (self.prediction.input, InputStatus::Predicted)
    }

    /// Adds the local player's input for `frame`, shifted by the configured
    /// frame delay. Returns the frame the input actually landed on. The gap
    /// opened by the first delayed add is filled with blanks so every frame
    /// has an authoritative input.
    pub(crate) fn add_local(&mut self, frame: Frame, input: NetplayInput) -> Frame {
        let target = frame + self.frame_delay as i32;
        let mut expected = if self.last_added_frame.is_null() {
            Frame::new(0)
        } else {
            self.last_added_frame + 1
        };
        if target < expected {
            // the delay shrank under us; drop rather than rewrite history
            trace!(%frame, %target, %expected, "dropping late local input");
            return Frame::NULL;
        }
        while expected < target {
            let filler = if self.last_added_frame.is_valid() {
                self.inputs[ring_slot(self.last_added_frame)].input
            } else {
                NetplayInput::BLANK
            };
            self.add_authoritative(expected, filler);
            expected += 1;
        }
        self.add_authoritative(target, input);
        target
    }

    /// Adds a remote player's authoritative input. Returns the frame on
    /// success, or [`Frame::NULL`] if it was out of sequence.
    pub(crate) fn add_remote(&mut self, frame: Frame, input: NetplayInput) -> Frame {
        let expected = if self.last_added_frame.is_null() {
            Frame::new(0)
        } else {
            self.last_added_frame + 1
        };
        if frame != expected {
            trace!(%frame, %expected, "out-of-sequence remote input dropped");
            return Frame::NULL;
        }
        self.add_authoritative(frame, input);
        frame
    }

    fn add_authoritative(&mut self, frame: Frame, input: NetplayInput) {
        self.inputs[ring_slot(frame)] = PlayerInput::new(frame, input);
        self.last_added_frame = frame;

        // verify any prediction that covered this frame
        if self.prediction.frame.is_valid()
            && frame >= self.prediction.frame
            && frame <= self.last_requested_frame
            && input != self.prediction.input
            && (self.first_incorrect_frame.is_null() || frame < self.first_incorrect_frame)
        {
            trace!(%frame, "misprediction detected");
            self.first_incorrect_frame = frame;
        }

        // once authoritative inputs have caught up with everything handed
        // out, and nothing disagreed, the prediction has served its purpose
        if self.prediction.frame.is_valid()
            && self.first_incorrect_frame.is_null()
            && self.last_requested_frame.is_valid()
            && frame >= self.last_requested_frame
        {
            self.prediction.frame = Frame::NULL;
        }
    }
}

fn ring_slot(frame: Frame) -> usize {
    frame.as_i32() as usize % INPUT_QUEUE_LENGTH
}
