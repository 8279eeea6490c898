//! Progress formatting shared by the download and upload stages.

use std::time::{Duration, Instant};

const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

/// Formats a byte count on the B → KB → MB → GB ladder.
pub fn human_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value > 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

/// Bytes moved so far against the expected total (0 when unknown).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub done: u64,
    pub total: u64,
}

impl Progress {
    pub const fn new(done: u64, total: u64) -> Self {
        Self { done, total }
    }

    /// Percentage in `0..=100`, or `None` when the total is unknown.
    pub fn percent(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some((self.done as f64 / self.total as f64 * 100.0).min(100.0))
    }

    /// Status line such as `Downloading... 42.50% (1.20 MB of 2.82 MB)`.
    pub fn describe(&self, label: &str) -> String {
        match self.percent() {
            Some(percent) => format!(
                "{}... {:.2}% ({} of {})",
                label,
                percent,
                human_size(self.done),
                human_size(self.total)
            ),
            None => format!("{}... {}", label, human_size(self.done)),
        }
    }
}

/// Rate-limits status updates so chunk-sized writes do not flood readers.
pub struct ProgressThrottle {
    last_emit: Option<Instant>,
    min_interval: Duration,
}

impl ProgressThrottle {
    pub const fn new(min_interval: Duration) -> Self {
        Self {
            last_emit: None,
            min_interval,
        }
    }

    /// Returns true when enough time has passed since the last emitted update.
    pub fn should_emit(&mut self) -> bool {
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}
