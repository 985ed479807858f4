//! Frame-rate bookkeeping.

use std::time::{Duration, Instant};

/// Running capture statistics, driven by sample timestamps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameStats {
    frames_captured: u64,
    total_frame_time: Duration,
    previous: Option<Duration>,
}

impl FrameStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a frame presented at `timestamp`. Time running backwards adds
    /// nothing to the total.
    pub fn record(&mut self, timestamp: Duration) {
        if let Some(previous) = self.previous {
            self.total_frame_time += timestamp.saturating_sub(previous);
        }
        self.previous = Some(timestamp);
        self.frames_captured += 1;
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured
    }

    pub fn total_frame_time(&self) -> Duration {
        self.total_frame_time
    }

    /// Frames per second over the whole capture, rounded. 0 until time has
    /// elapsed.
    pub fn frame_rate(&self) -> i32 {
        let seconds = self.total_frame_time.as_secs_f64();
        if seconds <= 0.0 {
            return 0;
        }
        (self.frames_captured as f64 / seconds).round() as i32
    }
}

/// Wall-clock rate over a fixed reporting interval, for periodic logs.
pub struct RateMeter {
    count: u32,
    since: Instant,
    interval: Duration,
}

impl RateMeter {
    pub fn new(interval: Duration) -> Self {
        Self { count: 0, since: Instant::now(), interval }
    }

    /// Count one event. Returns the rate once per interval.
    pub fn tick(&mut self) -> Option<f32> {
        self.count += 1;
        let elapsed = self.since.elapsed();
        if elapsed < self.interval {
            return None;
        }
        let rate = self.count as f32 / elapsed.as_secs_f32();
        self.count = 0;
        self.since = Instant::now();
        Some(rate)
    }
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_converges_to_inverse_interval() {
        let mut stats = FrameStats::new();
        let interval = Duration::from_micros(33_333);
        let mut errors = Vec::new();
        for n in 0..600u32 {
            stats.record(interval * n);
            if n > 0 {
                errors.push((stats.frame_rate() - 30).abs());
            }
        }
        assert_eq!(stats.frame_rate(), 30);
        assert_eq!(stats.frames_captured(), 600);
        // Rounding error never grows.
        assert!(errors.windows(2).all(|w| w[1] <= w[0]));
    }

    #[test]
    fn test_no_elapsed_time_means_zero() {
        let mut stats = FrameStats::new();
        assert_eq!(stats.frame_rate(), 0);
        stats.record(Duration::from_secs(5));
        assert_eq!(stats.frame_rate(), 0);
        stats.record(Duration::from_secs(5));
        assert_eq!(stats.frame_rate(), 0);
        assert_eq!(stats.frames_captured(), 2);
    }

    #[test]
    fn test_backwards_timestamps_add_nothing() {
        let mut stats = FrameStats::new();
        stats.record(Duration::from_secs(10));
        stats.record(Duration::from_secs(9));
        assert_eq!(stats.total_frame_time(), Duration::ZERO);
        stats.record(Duration::from_secs(10));
        assert_eq!(stats.total_frame_time(), Duration::from_secs(1));
    }

    #[test]
    fn test_meter_waits_for_interval() {
        let mut meter = RateMeter::new(Duration::from_secs(3600));
        assert_eq!(meter.tick(), None);
        let mut fast = RateMeter::new(Duration::ZERO);
        assert!(fast.tick().is_some());
    }
}
