//! Throughput tracking and human-readable formatting for progress logs.

use std::time::Instant;

/// Time-based speed calculation over a monotonically growing byte counter.
pub struct ThroughputTracker {
    last_update_time: Instant,
    last_bytes: u64,
    bytes_per_second: u64,
}

impl ThroughputTracker {
    pub fn new() -> Self {
        Self {
            last_update_time: Instant::now(),
            last_bytes: 0,
            bytes_per_second: 0,
        }
    }

    /// Feed the current total and get the speed since the previous update.
    pub fn update(&mut self, total_bytes: u64) -> u64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update_time).as_secs_f64();

        if elapsed > 0.0 {
            let bytes_diff = total_bytes.saturating_sub(self.last_bytes);
            self.bytes_per_second = (bytes_diff as f64 / elapsed) as u64;
        }

        self.last_update_time = now;
        self.last_bytes = total_bytes;
        self.bytes_per_second
    }
}

impl Default for ThroughputTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
