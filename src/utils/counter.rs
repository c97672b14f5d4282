//! Process-local monotonic counters for `update_id` assignment.

use std::sync::atomic::{AtomicI64, Ordering};

/// Lock-free monotonic counter.
///
/// Every call to [`Counter::increment`] returns a value strictly greater than
/// any value returned before, including under concurrent use.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicI64,
}

impl Counter {
    /// Creates a counter whose first increment yields `start + 1`.
    #[must_use]
    pub fn new(start: i64) -> Self {
        Self {
            value: AtomicI64::new(start),
        }
    }

    /// Advances the counter and returns the new value.
    pub fn increment(&self) -> i64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the last assigned value.
    #[must_use]
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Raises the counter to `floor` if it is currently lower.
    pub fn raise_to(&self, floor: i64) {
        self.value.fetch_max(floor, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    #[test]
    fn test_increment_sequence() {
        let counter = Counter::new(10);
        assert_eq!(counter.increment(), 11);
        assert_eq!(counter.increment(), 12);
        assert_eq!(counter.value(), 12);
    }

    #[test]
    fn test_raise_to_never_lowers() {
        let counter = Counter::new(5);
        counter.raise_to(3);
        assert_eq!(counter.value(), 5);
        counter.raise_to(42);
        assert_eq!(counter.increment(), 43);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_unique() {
        let start = 100;
        let counter = Arc::new(Counter::new(start));

        let handles: Vec<_> = (0..1000)
            .map(|_| {
                let counter = counter.clone();
                tokio::spawn(async move { counter.increment() })
            })
            .collect();

        let mut seen = BTreeSet::new();
        for handle in handles {
            seen.insert(handle.await.unwrap());
        }

        let expected: BTreeSet<i64> = (start + 1..=start + 1000).collect();
        assert_eq!(seen, expected);
    }
}
