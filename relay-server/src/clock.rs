//! Maps monotonic time to frame numbers and produces timing-pong values (§4.A).
//!
//! Every computation here is deliberately simple — the whole point of the
//! past-horizon design is that clients, not the server, do the smoothing.

use protocol::{FRAME_RATE, PAST_HORIZON_FRAMES};
use std::time::{Duration, Instant};

/// Milliseconds per frame at [`protocol::FRAME_RATE`].
pub const MS_PER_FRAME: f64 = 1000.0 / FRAME_RATE as f64;

/// Duration of one frame, for use with [`Instant`] arithmetic.
pub fn frame_duration(frames: u32) -> Duration {
    Duration::from_secs_f64(frames as f64 / FRAME_RATE as f64)
}

/// The instant at which `past_horizon_frame` would be frame zero, i.e. the
/// instance's "fictional zero instant" (§4.A).
pub fn fictional_zero(past_horizon_perf_time: Instant, past_horizon_frame: u32) -> Instant {
    past_horizon_perf_time
        .checked_sub(frame_duration(past_horizon_frame))
        .unwrap_or(past_horizon_perf_time)
}

/// `floor(now - zero)` in milliseconds — the value returned to a client for
/// timing synchronisation (§4.A).
pub fn timing_pong(now: Instant, past_horizon_perf_time: Instant, past_horizon_frame: u32) -> i64 {
    let zero = fictional_zero(past_horizon_perf_time, past_horizon_frame);
    now.saturating_duration_since(zero).as_millis() as i64
}

/// `past_horizon_frame + PAST_HORIZON_FRAMES` (§4.A, §3 invariant d).
pub fn present_frame(past_horizon_frame: u32) -> u32 {
    past_horizon_frame + PAST_HORIZON_FRAMES
}

/// The deadline at which the *next* horizon advance becomes due: one frame
/// past the present frame (§4.G).
pub fn next_advance_deadline(past_horizon_perf_time: Instant) -> Instant {
    past_horizon_perf_time + frame_duration(PAST_HORIZON_FRAMES + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_frame_is_past_horizon_plus_fifteen() {
        assert_eq!(present_frame(1), 16);
        assert_eq!(present_frame(100), 115);
    }

    #[test]
    fn timing_pong_is_zero_at_fictional_zero() {
        let now = Instant::now();
        let zero = fictional_zero(now, 10);
        assert_eq!(timing_pong(zero, now, 10), 0);
    }

    #[test]
    fn timing_pong_advances_with_wall_clock() {
        let now = Instant::now();
        let later = now + Duration::from_millis(500);
        let pong_now = timing_pong(now, now, 5);
        let pong_later = timing_pong(later, now, 5);
        assert_eq!(pong_later - pong_now, 500);
    }

    #[test]
    fn next_advance_deadline_is_sixteen_frames_ahead() {
        let now = Instant::now();
        let deadline = next_advance_deadline(now);
        let expected = now + frame_duration(16);
        assert_eq!(deadline, expected);
    }
}
