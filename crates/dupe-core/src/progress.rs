use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Decimal percentages such as `45.25%`, tried first.
static DECIMAL_PERCENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    // safety: this regex is valid and tested
    Regex::new(r"(\d+\.\d+)%").expect("valid regex")
});

/// Bare integer percentages such as `45%`.
static INTEGER_PERCENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    // safety: this regex is valid and tested
    Regex::new(r"(\d+)%").expect("valid regex")
});

/// Extract a completion fraction from a line of tool output.
///
/// Looks for a number immediately followed by `%`. The decimal pattern is
/// tried before the integer one, and within a pattern the leftmost match
/// wins. The number is divided by 100 and returned as parsed: values are not
/// clamped and successive calls are not assumed to be monotonic.
///
/// Handles the shapes `hdiutil` and `asr` print, e.g.
/// `Creating... 45.25%` and `.......................45%`.
pub fn extract(line: &str) -> Option<f64> {
    [&*DECIMAL_PERCENT_RE, &*INTEGER_PERCENT_RE]
        .into_iter()
        .find_map(|re| re.captures(line))
        .and_then(|caps| caps[1].parse::<f64>().ok())
        .map(|percent| percent / 100.0)
}

/// The sub-range of overall progress that one step occupies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepSpan {
    pub start: f64,
    pub end: f64,
}

impl StepSpan {
    pub const FULL: StepSpan = StepSpan { start: 0.0, end: 1.0 };

    /// Build a span, clamping both ends into [0, 1] and ordering them.
    pub fn new(start: f64, end: f64) -> Self {
        let start = start.clamp(0.0, 1.0);
        let end = end.clamp(0.0, 1.0);
        Self {
            start: start.min(end),
            end: start.max(end),
        }
    }

    /// Map a step-local fraction into overall progress.
    ///
    /// `1.0` maps exactly to `end` so a finished final step reports exactly 1.
    pub fn scale(&self, fraction: f64) -> f64 {
        if fraction >= 1.0 {
            return self.end;
        }
        let fraction = fraction.max(0.0);
        self.start + (self.end - self.start) * fraction
    }
}

/// Float slack when comparing the heartbeat value to its ceiling.
const CEILING_TOLERANCE: f64 = 1e-9;

/// Synthetic progress for steps whose tool prints no percentages.
///
/// Every tick adds a fixed increment to a step-local fraction, creeping
/// toward `ceiling` but never past it; only real completion reports 1.0.
/// The heartbeat is polled from the same loop that observes the step's
/// completion, so dropping it there cancels it before completion is seen.
#[derive(Debug)]
pub struct Heartbeat {
    interval: Interval,
    value: f64,
    increment: f64,
    ceiling: f64,
}

impl Heartbeat {
    /// Default ceiling: synthetic progress stops at 90% of the step.
    pub const DEFAULT_CEILING: f64 = 0.9;

    pub fn new(period: Duration, increment: f64, ceiling: f64) -> Self {
        let period = period.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let ceiling = ceiling.clamp(0.0, 1.0);
        Self {
            interval,
            value: 0.0,
            increment: increment.clamp(0.0, ceiling),
            ceiling,
        }
    }

    /// Current step-local value.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Wait for the next tick and return the new step-local value, or `None`
    /// once the ceiling has been reached.
    pub async fn tick(&mut self) -> Option<f64> {
        self.interval.tick().await;
        if self.value >= self.ceiling - CEILING_TOLERANCE || self.increment <= 0.0 {
            return None;
        }
        self.value = (self.value + self.increment).min(self.ceiling);
        Some(self.value)
    }
}
