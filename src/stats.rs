use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Outcome of running one tagged frame through the chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No filter matched; the frame is implicitly dropped.
    Unmatched,
    /// Matched a rule with no action.
    Ignored,
    Dropped,
    Forwarded,
    Counted,
    /// The action failed (unresolved rule or listener, send error).
    Failed,
}

/// Tallies kept per filter and once globally.
#[derive(Debug, Default)]
pub struct Counters {
    total: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    counted: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub total: u64,
    pub forwarded: u64,
    pub dropped: u64,
    pub counted: u64,
    pub errors: u64,
}

impl Counters {
    pub fn record(&self, verdict: Verdict) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let slot = match verdict {
            Verdict::Forwarded => &self.forwarded,
            Verdict::Dropped | Verdict::Unmatched => &self.dropped,
            Verdict::Counted => &self.counted,
            Verdict::Failed => &self.errors,
            Verdict::Ignored => return,
        };
        slot.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            total: self.total.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            counted: self.counted.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for c in [&self.total, &self.forwarded, &self.dropped, &self.counted, &self.errors] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

impl fmt::Display for CounterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>10} | {:>10} | {:>10} | {:>10} | {:>10}",
            self.total, self.forwarded, self.dropped, self.counted, self.errors
        )
    }
}

/// Global statistics shared by every device worker.
#[derive(Debug, Default)]
pub struct Statistics {
    counters: Counters,
    unmatched: AtomicU64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, verdict: Verdict) {
        if verdict == Verdict::Unmatched {
            self.unmatched.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.record(verdict);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub fn unmatched(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.counters.reset();
        self.unmatched.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sorts_verdicts() {
        // ARRANGE
        let counters = Counters::default();

        // ACT
        for v in [
            Verdict::Forwarded,
            Verdict::Forwarded,
            Verdict::Dropped,
            Verdict::Counted,
            Verdict::Failed,
            Verdict::Ignored,
        ] {
            counters.record(v);
        }

        // ASSERT
        let snap = counters.snapshot();
        assert_eq!(snap.total, 6);
        assert_eq!(snap.forwarded, 2);
        assert_eq!(snap.dropped, 1);
        assert_eq!(snap.counted, 1);
        assert_eq!(snap.errors, 1);
    }

    #[test]
    fn test_unmatched_counts_as_drop_globally() {
        let stats = Statistics::new();

        stats.record(Verdict::Unmatched);

        assert_eq!(stats.unmatched(), 1);
        assert_eq!(stats.snapshot().dropped, 1);
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let stats = Statistics::new();
        stats.record(Verdict::Unmatched);
        stats.record(Verdict::Forwarded);

        stats.reset();

        assert_eq!(stats.snapshot(), CounterSnapshot::default());
        assert_eq!(stats.unmatched(), 0);
    }
}
