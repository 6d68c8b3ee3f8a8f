//! Bounded label values for per-guardrail metrics.

use std::collections::HashSet;

use parking_lot::Mutex;

/// Label value used once the limit is reached.
pub const OVERFLOW_LABEL: &str = "__other__";

/// Caps the number of distinct values a label may take.
///
/// Guardrail ids come from contracts, which are tenant-controlled; without a
/// cap a misbehaving control plane could create unbounded time series.
pub struct CardinalityLimiter {
    seen: Mutex<HashSet<String>>,
    limit: usize,
}

impl CardinalityLimiter {
    pub fn new(limit: usize) -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
            limit,
        }
    }

    /// `value` if already admitted or there is room, [`OVERFLOW_LABEL`] otherwise.
    pub fn admit<'a>(&self, value: &'a str) -> &'a str {
        let mut seen = self.seen.lock();
        if seen.contains(value) {
            return value;
        }
        if seen.len() < self.limit {
            seen.insert(value.to_string());
            return value;
        }
        OVERFLOW_LABEL
    }

    pub fn admitted(&self) -> usize {
        self.seen.lock().len()
    }
}
