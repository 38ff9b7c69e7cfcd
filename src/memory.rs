//! Memory Monitor - Advisory Admission Control
//!
//! The monitor does not free anything itself: every canvas and decoded-image
//! buffer is owned by exactly one scope and dropped deterministically, with an
//! [`AllocationGuard`] tying the accounting to the buffer's lifetime. What the
//! monitor provides is the pre-flight admission check against the configured
//! ceiling, a peak watermark for instrumented verification, and a reclaim pass
//! that asks the allocator to hand freed pages back to the operating system.

use crate::config::MemoryBudget;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Point-in-time view of engine-owned pixel memory.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemorySample {
    pub used_bytes: u64,
    pub ceiling_bytes: u64,
}

impl MemorySample {
    pub fn usage_ratio(&self) -> f64 {
        self.used_bytes as f64 / self.ceiling_bytes as f64
    }
}

/// Pressure levels derived from the budget ratios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPressure {
    Low,
    Warning,
    Critical,
    Emergency,
}

impl std::fmt::Display for MemoryPressure {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            MemoryPressure::Low => write!(f, "LOW"),
            MemoryPressure::Warning => write!(f, "WARNING"),
            MemoryPressure::Critical => write!(f, "CRITICAL"),
            MemoryPressure::Emergency => write!(f, "EMERGENCY"),
        }
    }
}

pub struct MemoryMonitor {
    budget: MemoryBudget,
    used: AtomicU64,
    peak: AtomicU64,
    /// Bytes dropped since the last reclaim pass. Drained by `reclaim()`.
    pending_release: AtomicU64,
    reclaim_passes: AtomicU64,
}

impl MemoryMonitor {
    pub fn new(budget: MemoryBudget) -> Arc<Self> {
        Arc::new(Self {
            budget,
            used: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            pending_release: AtomicU64::new(0),
            reclaim_passes: AtomicU64::new(0),
        })
    }

    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }

    pub fn sample(&self) -> MemorySample {
        MemorySample {
            used_bytes: self.used.load(Ordering::Acquire),
            ceiling_bytes: self.budget.ceiling_bytes,
        }
    }

    /// Admission predicate: would `n` more bytes keep us under the critical
    /// threshold?
    pub fn can_allocate(&self, n: u64) -> bool {
        let sample = self.sample();
        let projected = (sample.used_bytes + n) as f64 / sample.ceiling_bytes as f64;
        projected < self.budget.critical_ratio
    }

    pub fn pressure(&self) -> MemoryPressure {
        let ratio = self.sample().usage_ratio();
        if ratio >= self.budget.emergency_ratio {
            MemoryPressure::Emergency
        } else if ratio >= self.budget.critical_ratio {
            MemoryPressure::Critical
        } else if ratio >= self.budget.warning_ratio {
            MemoryPressure::Warning
        } else {
            MemoryPressure::Low
        }
    }

    /// Forced reclamation pass. Asks glibc to return freed pages to the OS
    /// and drains the pending-release counter. Idempotent and always safe to
    /// call speculatively; a second pass with nothing dropped returns 0.
    pub fn reclaim(&self) -> u64 {
        self.reclaim_passes.fetch_add(1, Ordering::Relaxed);
        os_release_freed_pages();
        self.pending_release.swap(0, Ordering::AcqRel)
    }

    /// High-water mark of registered bytes over the monitor's lifetime.
    pub fn peak_bytes(&self) -> u64 {
        self.peak.load(Ordering::Acquire)
    }

    pub fn reclaim_passes(&self) -> u64 {
        self.reclaim_passes.load(Ordering::Relaxed)
    }

    /// Register a buffer with the accounting. The returned guard must live
    /// exactly as long as the buffer it describes.
    pub fn register(self: &Arc<Self>, bytes: u64) -> AllocationGuard {
        let used = self.used.fetch_add(bytes, Ordering::AcqRel) + bytes;
        self.peak.fetch_max(used, Ordering::AcqRel);
        AllocationGuard {
            monitor: Arc::clone(self),
            bytes,
        }
    }
}

/// RAII registration of one buffer's bytes. Dropping the guard releases the
/// accounting and feeds the pending-release counter for the next reclaim.
pub struct AllocationGuard {
    monitor: Arc<MemoryMonitor>,
    bytes: u64,
}

impl AllocationGuard {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Re-register at a new size (canvas growth). The delta is accounted the
    /// same way a fresh registration would be.
    pub fn resize(&mut self, new_bytes: u64) {
        if new_bytes > self.bytes {
            let delta = new_bytes - self.bytes;
            let used = self.monitor.used.fetch_add(delta, Ordering::AcqRel) + delta;
            self.monitor.peak.fetch_max(used, Ordering::AcqRel);
        } else {
            let delta = self.bytes - new_bytes;
            self.monitor.used.fetch_sub(delta, Ordering::AcqRel);
            self.monitor
                .pending_release
                .fetch_add(delta, Ordering::AcqRel);
        }
        self.bytes = new_bytes;
    }
}

impl Drop for AllocationGuard {
    fn drop(&mut self) {
        self.monitor.used.fetch_sub(self.bytes, Ordering::AcqRel);
        self.monitor
            .pending_release
            .fetch_add(self.bytes, Ordering::AcqRel);
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn os_release_freed_pages() {
    // malloc_trim walks the arenas and returns whole free pages to the
    // kernel. Freed Vec/mmap memory is otherwise kept for reuse and still
    // counts against the container limit.
    unsafe {
        libc::malloc_trim(0);
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn os_release_freed_pages() {}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(ceiling: u64) -> Arc<MemoryMonitor> {
        MemoryMonitor::new(MemoryBudget::new(ceiling))
    }

    #[test]
    fn admission_respects_critical_ratio() {
        let m = monitor(1000);
        // critical defaults to 0.85
        assert!(m.can_allocate(840));
        assert!(!m.can_allocate(850));
        let _g = m.register(500);
        assert!(m.can_allocate(300));
        assert!(!m.can_allocate(400));
    }

    #[test]
    fn guard_drop_releases_and_feeds_reclaim() {
        let m = monitor(1000);
        {
            let _g = m.register(400);
            assert_eq!(m.sample().used_bytes, 400);
        }
        assert_eq!(m.sample().used_bytes, 0);
        assert_eq!(m.reclaim(), 400);
        // Idempotent: nothing pending on the second pass.
        assert_eq!(m.reclaim(), 0);
    }

    #[test]
    fn peak_watermark_tracks_high_water() {
        let m = monitor(1000);
        {
            let _a = m.register(300);
            let _b = m.register(200);
        }
        let _c = m.register(100);
        assert_eq!(m.peak_bytes(), 500);
    }

    #[test]
    fn resize_adjusts_accounting_both_ways() {
        let m = monitor(1000);
        let mut g = m.register(100);
        g.resize(250);
        assert_eq!(m.sample().used_bytes, 250);
        assert_eq!(m.peak_bytes(), 250);
        g.resize(50);
        assert_eq!(m.sample().used_bytes, 50);
        drop(g);
        assert_eq!(m.reclaim(), 250);
    }

    #[test]
    fn pressure_levels_follow_ratios() {
        let m = monitor(1000);
        assert_eq!(m.pressure(), MemoryPressure::Low);
        let _g = m.register(700);
        assert_eq!(m.pressure(), MemoryPressure::Warning);
        let _h = m.register(150);
        assert_eq!(m.pressure(), MemoryPressure::Critical);
        let _i = m.register(100);
        assert_eq!(m.pressure(), MemoryPressure::Emergency);
    }
}
