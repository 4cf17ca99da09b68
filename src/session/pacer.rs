//! The adaptive frame pacer.
//!
//! Keeps the simulation stepping at the machine's nominal rate, gently
//! retuned when the rollback engine reports clock drift against the peers.
//! A correction is spread across three quarters of the reporting interval
//! and then snapped back to full speed, so a transient network hiccup never
//! leaves the simulation permanently fast or slow.

use tracing::{debug, trace};
use web_time::{Duration, Instant};

use crate::Frame;

/// If the deadline falls this many periods behind, the backlog is dropped
/// instead of fast-forwarded.
const BACKLOG_SKIP_PERIODS: u32 = 8;

/// Correction fraction: only a quarter of the measured drift is corrected
/// per timesync report, spread over 0.75 × the report interval.
const DRIFT_CORRECTION_DIVISOR: f64 = 4.0;
const RECOVERY_WINDOW: f64 = 0.75;

/// See the module docs.
#[derive(Debug)]
pub struct FramePacer {
    nominal_period: Duration,
    frame_period: Duration,
    target_speed: f64,
    next_frame_time: Instant,
    next_recovery_frame: Frame,
}

impl FramePacer {
    /// Creates a pacer for a machine running at `fps` frames per second.
    #[must_use]
    pub fn new(fps: f32) -> Self {
        let nominal_period = Duration::from_secs_f64(1.0 / f64::from(fps.max(1.0)));
        Self {
            nominal_period,
            frame_period: nominal_period,
            target_speed: 1.0,
            next_frame_time: Instant::now(),
            next_recovery_frame: Frame::NULL,
        }
    }

    /// Restarts pacing from now at full speed. Called whenever the session
    /// (re-)enters the running state.
    pub fn reset(&mut self) {
        self.target_speed = 1.0;
        self.frame_period = self.nominal_period;
        self.next_frame_time = Instant::now();
        self.next_recovery_frame = Frame::NULL;
    }

    /// The current speed multiplier (1.0 = nominal).
    #[must_use]
    pub fn target_speed(&self) -> f64 {
        self.target_speed
    }

    /// The instant the next frame is due.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.next_frame_time
    }

    /// Reacts to a timesync report: we are `frame_delta` frames ahead of
    /// the slowest peer (negative = behind), reported every `interval`
    /// frames. Sub-frame drift is ignored.
    pub fn on_time_sync(&mut self, current_frame: Frame, frame_delta: f32, interval: u32) {
        if frame_delta.abs() < 1.0 {
            return;
        }
        let period = self.frame_period.as_secs_f64();
        let total_time = f64::from(frame_delta) * period / DRIFT_CORRECTION_DIVISOR;
        let recovery_frames = RECOVERY_WINDOW * f64::from(interval);
        let per_frame_delta = -(total_time / recovery_frames);
        self.target_speed = (period + per_frame_delta) / period;
        self.frame_period =
            Duration::from_secs_f64(self.nominal_period.as_secs_f64() / self.target_speed);
        self.next_recovery_frame = current_frame + recovery_frames.ceil() as i32;
        debug!(
            frame_delta,
            speed = self.target_speed,
            recovery_frame = %self.next_recovery_frame,
            "timesync speed correction"
        );
    }

    /// Per-frame upkeep: once the recovery frame is reached, snap back to
    /// full speed.
    pub fn tick(&mut self, current_frame: Frame) {
        if self.next_recovery_frame.is_valid() && current_frame >= self.next_recovery_frame {
            trace!(frame = %current_frame, "timesync recovery complete");
            self.target_speed = 1.0;
            self.frame_period = self.nominal_period;
            self.next_recovery_frame = Frame::NULL;
        }
    }

    /// Advances the deadline by one period. If the deadline has fallen many
    /// periods behind (a debugger pause, a long resync), the backlog is
    /// dropped and pacing restarts from now; returns `true` in that case so
    /// the caller can skip sleeping entirely.
    pub fn advance_deadline(&mut self) -> bool {
        self.next_frame_time += self.frame_period;
        let now = Instant::now();
        let backlog_limit = self.frame_period * BACKLOG_SKIP_PERIODS;
        if now.saturating_duration_since(self.next_frame_time) > backlog_limit {
            debug!("frame deadline backlog dropped");
            self.next_frame_time = now;
            return true;
        }
        false
    }
}
