use std::sync::atomic::{AtomicUsize, Ordering};

/// Running totals of sub-network evaluations.
///
/// Updated with relaxed atomics so parallel draws can record micro-head
/// passes without locking.
#[derive(Debug, Default)]
pub struct PassCounters {
    encoder: AtomicUsize,
    macro_head: AtomicUsize,
    micro_head: AtomicUsize,
}

/// Snapshot of [`PassCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PassCounts {
    pub encoder: usize,
    pub macro_head: usize,
    pub micro_head: usize,
}

impl PassCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_encoder(&self) {
        self.encoder.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_macro_head(&self) {
        self.macro_head.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_micro_head(&self) {
        self.micro_head.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PassCounts {
        PassCounts {
            encoder: self.encoder.load(Ordering::Relaxed),
            macro_head: self.macro_head.load(Ordering::Relaxed),
            micro_head: self.micro_head.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.encoder.store(0, Ordering::Relaxed);
        self.macro_head.store(0, Ordering::Relaxed);
        self.micro_head.store(0, Ordering::Relaxed);
    }
}

impl Clone for PassCounters {
    fn clone(&self) -> Self {
        let counts = self.snapshot();
        Self {
            encoder: AtomicUsize::new(counts.encoder),
            macro_head: AtomicUsize::new(counts.macro_head),
            micro_head: AtomicUsize::new(counts.micro_head),
        }
    }
}
