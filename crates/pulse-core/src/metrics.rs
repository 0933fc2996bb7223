//! Global atomic counters for Pulse.
//!
//! Counters are bumped at the call site. [`Metrics::flush`] emits them as a
//! single `tracing::info!` event (the daemon does this after each pass).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    ticks: AtomicU64,
    drops_spawned: AtomicU64,
    auto_retries: AtomicU64,
    escalations: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            drops_spawned: AtomicU64::new(0),
            auto_retries: AtomicU64::new(0),
            escalations: AtomicU64::new(0),
        }
    }

    pub fn inc_ticks(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_spawns(&self) {
        self.drops_spawned.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "drops_spawned", "counter incremented");
    }

    pub fn inc_auto_retries(&self) {
        self.auto_retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "auto_retries", "counter incremented");
    }

    pub fn inc_escalations(&self) {
        self.escalations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "escalations", "counter incremented");
    }

    /// Emit all current counter values as one `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            ticks = self.ticks(),
            drops_spawned = self.drops_spawned(),
            auto_retries = self.auto_retries(),
            escalations = self.escalations(),
        );
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn drops_spawned(&self) -> u64 {
        self.drops_spawned.load(Ordering::Relaxed)
    }

    pub fn auto_retries(&self) -> u64 {
        self.auto_retries.load(Ordering::Relaxed)
    }

    pub fn escalations(&self) -> u64 {
        self.escalations.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.ticks.store(0, Ordering::Relaxed);
        self.drops_spawned.store(0, Ordering::Relaxed);
        self.auto_retries.store(0, Ordering::Relaxed);
        self.escalations.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_and_reset() {
        let m = Metrics::new();
        m.inc_ticks();
        m.inc_ticks();
        m.inc_spawns();
        m.inc_auto_retries();
        m.inc_escalations();
        m.inc_escalations();
        assert_eq!(m.ticks(), 2);
        assert_eq!(m.drops_spawned(), 1);
        assert_eq!(m.auto_retries(), 1);
        assert_eq!(m.escalations(), 2);
        m.flush();
        m.reset();
        assert_eq!(m.ticks(), 0);
        assert_eq!(m.escalations(), 0);
    }
}
