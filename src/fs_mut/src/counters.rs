use std::sync::atomic::{AtomicU64, Ordering};

/// Increment-only counters for the file open paths.
#[derive(Default)]
pub struct OpenCounters {
    opens: AtomicU64,
    read_only: AtomicU64,
    read_write: AtomicU64,
    errors: AtomicU64,
}

impl OpenCounters {
    pub(crate) fn incr_open(&self) {
        self.opens.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_read_only(&self) {
        self.read_only.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_read_write(&self) {
        self.read_write.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }

    pub fn read_only(&self) -> u64 {
        self.read_only.load(Ordering::Relaxed)
    }

    pub fn read_write(&self) -> u64 {
        self.read_write.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}
