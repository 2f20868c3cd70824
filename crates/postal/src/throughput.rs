//! Sliding-window throughput tracking (items/sec, bytes/sec).

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_WINDOW: Duration = Duration::from_secs(5);

struct Inner {
    window: Duration,
    entries: VecDeque<(Instant, usize)>,
}

/// Tracks items-per-second and bytes-per-second over a trailing window
/// (default 5 s). Thread-safe.
pub struct ThroughputMeter {
    inner: Mutex<Inner>,
}

impl ThroughputMeter {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                window,
                entries: VecDeque::new(),
            }),
        }
    }

    /// Record a single item of `bytes` size at the current instant.
    pub fn add(&self, bytes: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.push_back((Instant::now(), bytes));
    }

    /// Evict entries older than the window, then report `(items_per_s, bytes_per_s)`.
    pub fn rate(&self) -> (f64, f64) {
        let mut inner = self.inner.lock().unwrap();
        let window = inner.window;
        let cutoff = Instant::now().checked_sub(window);
        if let Some(cutoff) = cutoff {
            while let Some(&(ts, _)) = inner.entries.front() {
                if ts < cutoff {
                    inner.entries.pop_front();
                } else {
                    break;
                }
            }
        }
        let count = inner.entries.len();
        let bytes: usize = inner.entries.iter().map(|(_, b)| b).sum();
        let secs = window.as_secs_f64();
        (count as f64 / secs, bytes as f64 / secs)
    }
}

impl Default for ThroughputMeter {
    fn default() -> Self {
        Self::new()
    }
}
