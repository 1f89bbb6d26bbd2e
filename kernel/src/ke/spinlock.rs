//! Spinlocks and ticket locks
//!
//! Both flavors raise the IPL to at least DPC for the duration of the
//! hold, so a DPC cannot interrupt the holder on its own CPU and then
//! deadlock trying to take the same lock. The raw (`_raw`) entry points
//! skip the IPL adjustment for callers already running raised; debug
//! builds check that claim.
//!
//! The ticket lock grants strictly FIFO service and is used where
//! starvation under contention matters. The plain spinlock is the default
//! for rarely contended state.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::hal;
use crate::ke::ipl::{ke_get_ipl, ke_lower_ipl, ke_raise_ipl_if_needed, Ipl};

/// Test-and-set spinlock.
#[repr(C)]
pub struct KSpinLock {
    locked: AtomicBool,
}

impl KSpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    pub fn init(&mut self) {
        self.locked = AtomicBool::new(false);
    }

    /// Acquire at DPC level. Returns the IPL to pass back to `release`.
    #[inline]
    pub unsafe fn acquire(&self) -> Ipl {
        self.acquire_at(Ipl::Dpc)
    }

    /// Acquire with the IPL raised to `ipl`. Queues shared with contexts
    /// above DPC (the DPC queue itself) raise higher.
    pub unsafe fn acquire_at(&self, ipl: Ipl) -> Ipl {
        let old = ke_raise_ipl_if_needed(ipl);
        self.spin_until_held();
        old
    }

    /// Acquire without touching the IPL. The caller is already at or
    /// above DPC.
    pub unsafe fn acquire_raw(&self) {
        debug_assert!(ke_get_ipl() >= Ipl::Dpc);
        self.spin_until_held();
    }

    /// Release and restore the IPL returned by the acquire.
    #[inline]
    pub unsafe fn release(&self, old_ipl: Ipl) {
        self.locked.store(false, Ordering::Release);
        ke_lower_ipl(old_ipl);
    }

    /// Release without touching the IPL.
    #[inline]
    pub unsafe fn release_raw(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// One-shot acquisition attempt. Does not leave the IPL raised on
    /// failure.
    pub unsafe fn try_acquire(&self) -> Option<Ipl> {
        let old = ke_raise_ipl_if_needed(Ipl::Dpc);
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(old)
        } else {
            ke_lower_ipl(old);
            None
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    #[inline]
    fn spin_until_held(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                hal::spin_wait_hint();
            }
        }
    }
}

impl Default for KSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Take-a-number lock with FIFO service order.
#[repr(C)]
pub struct KTicketLock {
    next_number: AtomicU32,
    now_serving: AtomicU32,
}

impl KTicketLock {
    pub const fn new() -> Self {
        Self {
            next_number: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
        }
    }

    pub fn init(&mut self) {
        self.next_number = AtomicU32::new(0);
        self.now_serving = AtomicU32::new(0);
    }

    /// Acquire at DPC level; spins until this caller's ticket is served.
    pub unsafe fn acquire(&self) -> Ipl {
        let old = ke_raise_ipl_if_needed(Ipl::Dpc);
        let ticket = self.next_number.fetch_add(1, Ordering::Relaxed);
        while self.now_serving.load(Ordering::Acquire) != ticket {
            hal::spin_wait_hint();
        }
        old
    }

    /// Serve the next ticket and restore the IPL.
    pub unsafe fn release(&self, old_ipl: Ipl) {
        self.now_serving.fetch_add(1, Ordering::Release);
        ke_lower_ipl(old_ipl);
    }
}

impl Default for KTicketLock {
    fn default() -> Self {
        Self::new()
    }
}
