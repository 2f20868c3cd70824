//! A bounded, de-duplicated queue of human-readable error strings.

use std::collections::VecDeque;
use std::sync::Mutex;

const DEFAULT_CAPACITY: usize = 64;
const OVERFLOW_MARKER: &str = "...";

struct Inner {
    entries: VecDeque<String>,
    capacity: usize,
    last: Option<String>,
}

/// Bounded, de-duplicated error journal drained by the application via `get()`.
pub struct ErrorJournal {
    inner: Mutex<Inner>,
}

impl ErrorJournal {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                capacity,
                last: None,
            }),
        }
    }

    /// Appends `err` unless it is empty or identical to the previously
    /// reported string. Returns `false` for a no-op, and also when the
    /// journal was full and the newest (tail) entry had to be replaced with
    /// `"..."`.
    pub fn set(&self, err: impl Into<String>) -> bool {
        let err = err.into();
        if err.is_empty() {
            return false;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.last.as_deref() == Some(err.as_str()) {
            return false;
        }
        inner.last = Some(err.clone());
        if inner.entries.len() >= inner.capacity {
            inner.entries.pop_back();
            inner.entries.push_back(OVERFLOW_MARKER.to_string());
            return false;
        }
        inner.entries.push_back(err);
        true
    }

    /// Pops and returns the oldest entry, or an empty string if none.
    pub fn get(&self) -> String {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.pop_front().unwrap_or_default()
    }

    pub fn has_error(&self) -> bool {
        !self.inner.lock().unwrap().entries.is_empty()
    }
}

impl Default for ErrorJournal {
    fn default() -> Self {
        Self::new()
    }
}
