//! Utility functions and helpers.

mod clock;
mod random;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use random::{DrawSource, FixedDraws, RandomStreams};

/// Tolerance used when comparing accumulated floating-point ratios to 1.
pub const RATIO_EPSILON: f64 = 1e-5;

/// Whether `value` is within [`RATIO_EPSILON`] of `target`.
pub fn approx_eq(value: f64, target: f64) -> bool {
    (value - target).abs() <= RATIO_EPSILON
}

/// Format a byte count for human-readable summaries.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}
