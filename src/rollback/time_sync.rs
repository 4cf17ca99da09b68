//! Frame-advantage averaging for time synchronization.

use crate::Frame;

/// Number of frames averaged when estimating frame advantage. Half a second
/// at 60 FPS: stable enough to ignore jitter, quick enough to chase real
/// drift.
const FRAME_WINDOW_SIZE: usize = 30;

/// Tracks local and remote frame advantages over a sliding window. The
/// averaged difference tells the frame pacer how far this peer's simulation
/// clock has drifted from the remote's.
#[derive(Debug)]
pub(crate) struct TimeSync {
    local: [i32; FRAME_WINDOW_SIZE],
    remote: [i32; FRAME_WINDOW_SIZE],
}

impl Default for TimeSync {
    fn default() -> Self {
        Self {
            local: [0; FRAME_WINDOW_SIZE],
            remote: [0; FRAME_WINDOW_SIZE],
        }
    }
}

impl TimeSync {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn advance_frame(&mut self, frame: Frame, local_adv: i32, remote_adv: i32) {
        if frame.is_null() {
            return;
        }
        let slot = frame.as_i32() as usize % FRAME_WINDOW_SIZE;
        self.local[slot] = local_adv;
        self.remote[slot] = remote_adv;
    }

    pub(crate) fn average_frame_advantage(&self) -> f32 {
        let local_avg =
            self.local.iter().sum::<i32>() as f32 / FRAME_WINDOW_SIZE as f32;
        let remote_avg =
            self.remote.iter().sum::<i32>() as f32 / FRAME_WINDOW_SIZE as f32;

        // meet in the middle
        (remote_avg - local_avg) / 2.0
    }
}
