//! Virtual clock for one session.
//!
//! The clock only moves forward through [`TimeEngine::advance_to`]. Scrubbing
//! uses [`TimeEngine::jump_to`] (no replay of the skipped interval) and safe
//! time travel uses [`TimeEngine::fast_forward`], which the processing loop
//! honours by draining queued events up to the target without pacing.
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

struct ClockState {
    current_ns: i64,
    speed_factor: f64,
    fast_forward_to: Option<i64>,
    /// (simulated ns, wall instant) pair pacing is measured from.
    anchor: Option<(i64, Instant)>,
}

pub struct TimeEngine {
    state: Mutex<ClockState>,
    paused: AtomicBool,
}

impl TimeEngine {
    pub fn new(start_ns: i64, speed_factor: f64) -> Self {
        Self {
            state: Mutex::new(ClockState {
                current_ns: start_ns,
                speed_factor: speed_factor.max(0.0),
                fast_forward_to: None,
                anchor: None,
            }),
            paused: AtomicBool::new(false),
        }
    }

    pub fn now_ns(&self) -> i64 {
        self.state.lock().current_ns
    }

    pub fn speed(&self) -> f64 {
        self.state.lock().speed_factor
    }

    /// Moves the clock forward. Returns false (and leaves the clock alone) if
    /// `ts` is in the past.
    pub fn advance_to(&self, ts: i64) -> bool {
        let mut state = self.state.lock();
        if ts < state.current_ns {
            debug!(ts, current = state.current_ns, "advance_to ignored: timestamp in the past");
            return false;
        }
        state.current_ns = ts;
        true
    }

    /// Forcibly resets the clock, forwards or backwards.
    pub fn jump_to(&self, ts: i64) {
        let mut state = self.state.lock();
        info!(from = state.current_ns, to = ts, "⏭️ Clock jump");
        state.current_ns = ts;
        state.fast_forward_to = None;
        state.anchor = None;
    }

    /// Requests that every queued event up to `ts` be applied unthrottled.
    /// Returns false if `ts` is not ahead of the clock.
    pub fn fast_forward(&self, ts: i64) -> bool {
        let mut state = self.state.lock();
        if ts <= state.current_ns {
            return false;
        }
        info!(from = state.current_ns, to = ts, "⏩ Fast forward requested");
        state.fast_forward_to = Some(ts);
        true
    }

    pub fn fast_forward_target(&self) -> Option<i64> {
        self.state.lock().fast_forward_to
    }

    /// True when an event at `ts` falls inside an active fast-forward window.
    pub fn in_fast_forward(&self, ts: i64) -> bool {
        self.state
            .lock()
            .fast_forward_to
            .is_some_and(|target| ts <= target)
    }

    /// Lands the clock on the fast-forward target once nothing queued remains
    /// inside the window.
    pub fn complete_fast_forward(&self) -> Option<i64> {
        let mut state = self.state.lock();
        let target = state.fast_forward_to.take()?;
        if target > state.current_ns {
            state.current_ns = target;
        }
        state.anchor = None;
        debug!(target, "Fast forward complete");
        Some(target)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.state.lock().anchor = None;
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Changes pacing only. Negative factors are refused.
    pub fn set_speed(&self, factor: f64) -> bool {
        if !factor.is_finite() || factor < 0.0 {
            return false;
        }
        let mut state = self.state.lock();
        state.speed_factor = factor;
        state.anchor = None;
        true
    }

    /// Wall-clock time the loop should wait before applying an event at
    /// `next_ts`, preserving `simulated / wall == speed_factor`.
    pub fn pacing_delay(&self, next_ts: i64) -> Duration {
        let mut state = self.state.lock();
        if state.speed_factor <= 0.0 {
            return Duration::ZERO;
        }
        if state.fast_forward_to.is_some_and(|target| next_ts <= target) {
            return Duration::ZERO;
        }
        let now = Instant::now();
        let current_ns = state.current_ns;
        let (sim_anchor, wall_anchor) = *state.anchor.get_or_insert((current_ns, now));
        let sim_delta = next_ts.saturating_sub(sim_anchor);
        if sim_delta <= 0 {
            return Duration::ZERO;
        }
        let wall_target = wall_anchor + Duration::from_secs_f64(sim_delta as f64 / 1e9 / state.speed_factor);
        wall_target.saturating_duration_since(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_is_forward_only() {
        let clock = TimeEngine::new(1_000, 0.0);
        assert!(clock.advance_to(2_000));
        assert!(clock.advance_to(2_000));
        assert!(!clock.advance_to(1_500));
        assert_eq!(clock.now_ns(), 2_000);
    }

    #[test]
    fn test_jump_moves_backwards() {
        let clock = TimeEngine::new(5_000, 0.0);
        clock.jump_to(100);
        assert_eq!(clock.now_ns(), 100);
    }

    #[test]
    fn test_fast_forward_window() {
        let clock = TimeEngine::new(0, 1.0);
        assert!(!clock.fast_forward(0));
        assert!(clock.fast_forward(10_000));
        assert!(clock.in_fast_forward(9_999));
        assert!(!clock.in_fast_forward(10_001));
        assert_eq!(clock.pacing_delay(5_000), Duration::ZERO);

        assert_eq!(clock.complete_fast_forward(), Some(10_000));
        assert_eq!(clock.now_ns(), 10_000);
        assert_eq!(clock.fast_forward_target(), None);
    }

    #[test]
    fn test_unthrottled_has_no_delay() {
        let clock = TimeEngine::new(0, 0.0);
        assert_eq!(clock.pacing_delay(60_000_000_000), Duration::ZERO);
    }

    #[test]
    fn test_pacing_scales_with_speed() {
        let clock = TimeEngine::new(0, 10.0);
        // 1s of simulated time at 10x is ~100ms of wall time.
        let delay = clock.pacing_delay(1_000_000_000);
        assert!(delay <= Duration::from_millis(100));
        assert!(delay >= Duration::from_millis(90));
    }

    #[test]
    fn test_set_speed_rejects_negative() {
        let clock = TimeEngine::new(0, 1.0);
        assert!(!clock.set_speed(-1.0));
        assert!(clock.set_speed(0.0));
        assert_eq!(clock.speed(), 0.0);
    }

    #[test]
    fn test_pause_resume() {
        let clock = TimeEngine::new(0, 0.0);
        assert!(!clock.is_paused());
        clock.pause();
        assert!(clock.is_paused());
        clock.resume();
        assert!(!clock.is_paused());
    }
}
