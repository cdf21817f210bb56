use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing transfer counter.
///
/// Counters are bumped on the piece manager's logical thread but read from
/// snapshot and announce code paths without synchronization; the relaxed
/// reads are best effort by design, per the engine's shared-state rules.
#[derive(Debug, Default)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds to the running total.
    pub fn add(&self, bytes: u64) {
        self.0.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Returns the running total.
    pub fn sum(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_is_monotonic() {
        let counter = Counter::new();
        assert_eq!(counter.sum(), 0);
        counter.add(16_384);
        counter.add(1024);
        assert_eq!(counter.sum(), 17_408);
    }
}
