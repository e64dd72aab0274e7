use std::collections::VecDeque;

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Bitrates {
    /// kbit/s
    pub incoming: u64,
    /// kbit/s
    pub outgoing: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Sample {
    bytes: u64,
    timestamp_ms: u64,
}

/// Sliding window of cumulative byte counters.
#[derive(Debug, Clone)]
pub struct BitrateWindow {
    window_ms: u64,
    samples: VecDeque<Sample>,
}

impl BitrateWindow {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            samples: VecDeque::new(),
        }
    }

    /// Records a sample and returns the current rate in kbit/s.
    pub fn record(&mut self, bytes: u64, timestamp_ms: u64) -> u64 {
        self.samples.push_back(Sample {
            bytes,
            timestamp_ms,
        });
        let newest = self
            .samples
            .iter()
            .map(|sample| sample.timestamp_ms)
            .max()
            .unwrap_or(timestamp_ms);
        let window_ms = self.window_ms;
        self.samples
            .retain(|sample| newest.saturating_sub(sample.timestamp_ms) < window_ms);
        self.rate()
    }

    pub fn rate(&self) -> u64 {
        if self.samples.len() < 2 {
            return 0;
        }
        let oldest = self.samples.iter().min_by_key(|sample| sample.timestamp_ms);
        let latest = self.samples.iter().max_by_key(|sample| sample.timestamp_ms);
        match (oldest, latest) {
            (Some(oldest), Some(latest)) => {
                let elapsed = latest.timestamp_ms.saturating_sub(oldest.timestamp_ms);
                if elapsed == 0 {
                    return 0;
                }
                latest.bytes.saturating_sub(oldest.bytes) * 8 / elapsed
            }
            _ => 0,
        }
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_samples_one_second_apart() {
        let mut window = BitrateWindow::new(5_000);
        assert_eq!(window.record(1_000, 0), 0);
        assert_eq!(window.record(3_000, 1_000), 16);
    }

    #[test]
    fn old_samples_fall_out_of_window() {
        let mut window = BitrateWindow::new(5_000);
        window.record(0, 0);
        window.record(10_000, 1_000);
        window.record(20_000, 5_500);
        assert_eq!(window.len(), 2);
        assert_eq!(window.rate(), (20_000 - 10_000) * 8 / 4_500);
    }

    #[test]
    fn rate_truncates_and_tolerates_counter_reset() {
        let mut window = BitrateWindow::new(5_000);
        window.record(100, 0);
        assert_eq!(window.record(101, 3), 2);
        window.clear();
        window.record(5_000, 0);
        assert_eq!(window.record(10, 500), 0);
    }

    #[test]
    fn duplicate_timestamps_yield_zero() {
        let mut window = BitrateWindow::new(5_000);
        window.record(10, 42);
        assert_eq!(window.record(20, 42), 0);
    }
}
