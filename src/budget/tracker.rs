//! Runtime spend accounting for one in-flight request.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counts units actually consumed while a graph runs.
///
/// Shared by every node task of one request, so charging is atomic. The
/// tracker never blocks execution; enforcement happens before the run, this
/// records what really happened.
#[derive(Debug)]
pub struct BudgetTracker {
    predicted: u64,
    consumed: AtomicU64,
}

impl BudgetTracker {
    pub fn new(predicted: u64) -> Self {
        Self {
            predicted,
            consumed: AtomicU64::new(0),
        }
    }

    /// Record spend, returning the new total.
    pub fn charge(&self, units: u64) -> u64 {
        self.consumed
            .fetch_add(units, Ordering::Relaxed)
            .saturating_add(units)
    }

    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    pub fn predicted(&self) -> u64 {
        self.predicted
    }

    /// Prediction not yet spent; zero once spend passes it.
    pub fn remaining(&self) -> u64 {
        self.predicted.saturating_sub(self.consumed())
    }

    pub fn over_prediction(&self) -> bool {
        self.consumed() > self.predicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charge_accumulates() {
        let tracker = BudgetTracker::new(10_000);
        assert_eq!(tracker.charge(4_000), 4_000);
        assert_eq!(tracker.charge(1_500), 5_500);
        assert_eq!(tracker.consumed(), 5_500);
        assert_eq!(tracker.remaining(), 4_500);
        assert!(!tracker.over_prediction());
    }

    #[test]
    fn test_remaining_saturates_at_zero() {
        let tracker = BudgetTracker::new(1_000);
        tracker.charge(2_500);
        assert_eq!(tracker.remaining(), 0);
        assert!(tracker.over_prediction());
    }

    #[tokio::test]
    async fn test_concurrent_charges_all_land() {
        use std::sync::Arc;

        let tracker = Arc::new(BudgetTracker::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let t = Arc::clone(&tracker);
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    t.charge(3);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(tracker.consumed(), 8 * 100 * 3);
    }
}
