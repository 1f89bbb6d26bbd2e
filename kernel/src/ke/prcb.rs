//! Processor control block (PRCB)
//!
//! One per CPU, alive for the life of the system. A PRCB is touched only
//! by its own processor, with two exceptions:
//!
//! - the TLB-shootdown staging fields, guarded by `tlbs_lock`
//! - ready-queue insertion from another CPU, under `sched.lock`
//!
//! The pending-events word is written from interrupt context on the same
//! CPU (and by the reschedule IPI handler on its own CPU), so it is
//! atomic rather than plain.

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use bitflags::bitflags;

use crate::hal;
use crate::ke::dpc::KDpc;
use crate::ke::ipl::Ipl;
use crate::ke::list::ListEntry;
use crate::ke::sched::KScheduler;
use crate::ke::spinlock::KSpinLock;

/// Upper bound on supported processors.
pub const MAX_PROCESSORS: usize = 32;

bitflags! {
    /// Software events waiting for the next IPL drop.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PendingEvents: u32 {
        /// The running thread's quantum expired; reschedule below DPC.
        const YIELD = 1 << 0;
        /// The DPC queue is non-empty.
        const DPCS = 1 << 2;
    }
}

/// Per-processor control block.
#[repr(C)]
pub struct KPrcb {
    /// Processor index. Must stay the first field: the bare-metal
    /// backend reads it GS-relative at offset zero.
    pub id: u32,
    /// Hardware (LAPIC) identifier.
    pub hardware_id: u32,
    /// Whether this is the bootstrap processor.
    pub bootstrap: bool,
    /// Current IPL. Only this CPU reads or writes it.
    pub ipl: Ipl,

    /// DPC queue head and its lock. The lock raises to NoInterrupts
    /// because device ISRs above DPC enqueue here.
    pub dpc_queue: ListEntry,
    pub dpc_lock: KSpinLock,
    /// Drains the timer tree when the clock observes an expired timer.
    pub clock_dpc: KDpc,

    /// TLB-shootdown staging: start address, page count, and the guard
    /// that sequences initiator and recipient (see `ke::ipi`).
    pub tlbs_address: usize,
    pub tlbs_page_count: usize,
    pub tlbs_lock: KSpinLock,

    pending_events: AtomicU32,

    /// This processor's scheduler.
    pub sched: KScheduler,

    /// HAL per-processor data.
    pub hal_data: *mut u8,
}

// A PRCB must fit in one page.
const _: () = assert!(core::mem::size_of::<KPrcb>() <= 4096);

impl KPrcb {
    pub const fn new() -> Self {
        Self {
            id: 0,
            hardware_id: 0,
            bootstrap: false,
            ipl: Ipl::Normal,
            dpc_queue: ListEntry::new(),
            dpc_lock: KSpinLock::new(),
            clock_dpc: KDpc::new(),
            tlbs_address: 0,
            tlbs_page_count: 0,
            tlbs_lock: KSpinLock::new(),
            pending_events: AtomicU32::new(0),
            sched: KScheduler::new(),
            hal_data: ptr::null_mut(),
        }
    }

    #[inline]
    pub fn pending_events(&self) -> PendingEvents {
        PendingEvents::from_bits_truncate(self.pending_events.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_pending(&self, events: PendingEvents) {
        self.pending_events.fetch_or(events.bits(), Ordering::Release);
    }

    #[inline]
    pub fn clear_pending(&self, events: PendingEvents) {
        self.pending_events.fetch_and(!events.bits(), Ordering::Release);
    }
}

struct PrcbTable(UnsafeCell<[KPrcb; MAX_PROCESSORS]>);

// Cross-CPU access is limited to the fields documented above, under
// their own locks.
unsafe impl Sync for PrcbTable {}

static PRCB_TABLE: PrcbTable = {
    const INIT: KPrcb = KPrcb::new();
    PrcbTable(UnsafeCell::new([INIT; MAX_PROCESSORS]))
};

static PROCESSOR_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Pointer to processor `index`'s PRCB.
///
/// # Safety
/// `index` must be below `MAX_PROCESSORS`.
pub unsafe fn ki_get_prcb(index: usize) -> *mut KPrcb {
    debug_assert!(index < MAX_PROCESSORS);
    (PRCB_TABLE.0.get() as *mut KPrcb).add(index)
}

/// The calling processor's PRCB.
#[inline]
pub unsafe fn ke_get_current_prcb() -> &'static mut KPrcb {
    &mut *ki_get_prcb(hal::current_processor())
}

/// Number of processors brought online so far.
#[inline]
pub fn ke_get_processor_count() -> usize {
    PROCESSOR_COUNT.load(Ordering::Acquire)
}

/// Affinity mask covering every online processor.
#[inline]
pub fn ke_online_processor_mask() -> u64 {
    let count = ke_get_processor_count();
    if count >= 64 {
        u64::MAX
    } else {
        (1u64 << count) - 1
    }
}

/// Record that processors `0..count` are online.
pub(super) fn ki_set_processor_count(count: usize) {
    PROCESSOR_COUNT.store(count, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prcb_fits_in_a_page() {
        assert!(core::mem::size_of::<KPrcb>() <= 4096);
    }

    #[test]
    fn test_pending_event_mask() {
        let prcb = KPrcb::new();
        assert!(prcb.pending_events().is_empty());

        prcb.set_pending(PendingEvents::DPCS);
        prcb.set_pending(PendingEvents::YIELD);
        assert!(prcb.pending_events().contains(PendingEvents::DPCS | PendingEvents::YIELD));

        prcb.clear_pending(PendingEvents::DPCS);
        assert_eq!(prcb.pending_events(), PendingEvents::YIELD);
    }
}
