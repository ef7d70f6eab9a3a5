//! FFmpeg progress parsing.
//!
//! The total duration comes from the `Duration:` banner on stderr and the
//! position from the key/value stream written by `-progress pipe:1`.

use std::sync::LazyLock;

use regex::Regex;

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Duration:\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("duration pattern is valid")
});

/// Highest percentage reported while the process is still running.
const RUNNING_CAP: u8 = 99;

/// Turns FFmpeg output lines into a 0–99 percentage.
///
/// The two streams are read independently, so a position can arrive before
/// the duration banner. The latest such position is held until the banner
/// shows up.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    total_us: Option<i64>,
    pending_us: Option<i64>,
    last: u8,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total input duration in microseconds, once known.
    pub const fn total_us(&self) -> Option<i64> {
        self.total_us
    }

    /// Feed a stderr line. Only the first `Duration:` banner is used.
    ///
    /// Returns a percentage when a held position can now be reported.
    pub fn observe_stderr(&mut self, line: &str) -> Option<u8> {
        if self.total_us.is_some() {
            return None;
        }
        let caps = DURATION_RE.captures(line)?;
        let hours: f64 = caps[1].parse().unwrap_or(0.0);
        let minutes: f64 = caps[2].parse().unwrap_or(0.0);
        let seconds: f64 = caps[3].parse().unwrap_or(0.0);
        #[allow(clippy::cast_possible_truncation)]
        let total = ((hours * 3600.0 + minutes * 60.0 + seconds) * 1_000_000.0) as i64;
        if total <= 0 {
            return None;
        }
        self.total_us = Some(total);
        let position = self.pending_us.take()?;
        self.advance_to(position)
    }

    /// Feed a `-progress` line. Returns a new percentage when it increased.
    pub fn observe_progress(&mut self, line: &str) -> Option<u8> {
        let (key, value) = line.trim().split_once('=')?;
        match key {
            // FFmpeg reports out_time_ms in microseconds as well
            "out_time_us" | "out_time_ms" => {
                let position: i64 = value.parse().ok()?;
                if self.total_us.is_none() {
                    self.pending_us = Some(position);
                    return None;
                }
                self.advance_to(position)
            }
            "progress" if value == "end" => self.bump(RUNNING_CAP),
            _ => None,
        }
    }

    fn advance_to(&mut self, position: i64) -> Option<u8> {
        let total = self.total_us?;
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let percent = ((position.max(0) as f64 / total as f64) * 100.0)
            .floor()
            .min(f64::from(RUNNING_CAP)) as u8;
        self.bump(percent)
    }

    fn bump(&mut self, percent: u8) -> Option<u8> {
        if percent > self.last {
            self.last = percent;
            Some(percent)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_banner() {
        let mut tracker = ProgressTracker::new();
        tracker.observe_stderr("  Duration: 00:01:40.00, start: 0.000000, bitrate: 1205 kb/s");
        assert_eq!(tracker.total_us(), Some(100_000_000));

        // Later banners (e.g. for outputs) are ignored
        tracker.observe_stderr("  Duration: 00:00:05.00");
        assert_eq!(tracker.total_us(), Some(100_000_000));
    }

    #[test]
    fn test_progress_percentage() {
        let mut tracker = ProgressTracker::new();
        assert_eq!(tracker.observe_progress("out_time_us=1000000"), None);

        tracker.observe_stderr("Duration: 00:00:10.00");
        assert_eq!(tracker.observe_progress("out_time_us=2500000"), Some(25));
        assert_eq!(tracker.observe_progress("out_time_ms=5000000"), Some(50));
        // Never goes backwards
        assert_eq!(tracker.observe_progress("out_time_us=1000000"), None);
        assert_eq!(tracker.observe_progress("frame=120"), None);
    }

    #[test]
    fn test_capped_until_exit() {
        let mut tracker = ProgressTracker::new();
        tracker.observe_stderr("Duration: 00:00:10.00");
        assert_eq!(tracker.observe_progress("out_time_us=10000000"), Some(99));
        assert_eq!(tracker.observe_progress("progress=end"), None);

        let mut tracker = ProgressTracker::new();
        assert_eq!(tracker.observe_progress("progress=continue"), None);
        assert_eq!(tracker.observe_progress("progress=end"), Some(99));
    }

    #[test]
    fn test_position_before_banner() {
        let mut tracker = ProgressTracker::new();
        assert_eq!(tracker.observe_progress("out_time_us=1000000"), None);
        assert_eq!(tracker.observe_progress("out_time_us=3000000"), None);
        assert_eq!(tracker.observe_stderr("  Duration: 00:00:10.00, start: 0.000000"), Some(30));
        assert_eq!(tracker.observe_progress("out_time_us=4000000"), Some(40));
    }

    #[test]
    fn test_negative_position() {
        let mut tracker = ProgressTracker::new();
        tracker.observe_stderr("Duration: 00:00:10.00");
        assert_eq!(tracker.observe_progress("out_time_us=-5000"), None);
    }
}
