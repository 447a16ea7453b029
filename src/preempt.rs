//! Preemption accounting.
//!
//! Spinlock acquisition disables preemption and release re-enables it; the
//! timer interrupt only reschedules while the counter is zero, so allocator
//! code holding a lock is never preempted. The counter is per-CPU by
//! design, which on this single-CPU kernel means one static.

use core::sync::atomic::{AtomicU32, Ordering};

static PREEMPT_COUNT: AtomicU32 = AtomicU32::new(0);

/// Disables preemption. Safe to nest; preemption stays off until every
/// disable has been paired with an enable.
pub fn preempt_disable() {
    PREEMPT_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Re-enables preemption. Do not assume preemption is on afterwards; an
/// outer section may still hold it off.
///
/// # Panics
///
/// Panics on an unpaired enable.
pub fn preempt_enable() {
    let old = PREEMPT_COUNT.fetch_sub(1, Ordering::Relaxed);
    assert!(old != 0, "preempt_enable without preempt_disable");
}

/// Whether the scheduler may switch tasks right now.
pub fn preemptible() -> bool {
    PREEMPT_COUNT.load(Ordering::Relaxed) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nesting() {
        assert!(preemptible());
        preempt_disable();
        preempt_disable();
        assert!(!preemptible());
        preempt_enable();
        assert!(!preemptible());
        preempt_enable();
        assert!(preemptible());
    }
}
