//! Deferred procedure calls
//!
//! A DPC carries a short, non-blocking callout from interrupt context to
//! the next point the processor drops below DPC level. The object is
//! caller-owned; the queue links it into the current processor's PRCB.
//!
//! Importance controls placement only: an important DPC goes to the front
//! of the queue. It must be set before enqueueing; re-ordering an already
//! queued DPC is undefined and not attempted.
//!
//! A DPC routine runs at DPC level and must neither block nor lower the
//! IPL; debug builds verify the level on return.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::containing_record;
use crate::ke::ipl::{ke_get_ipl, ke_lower_ipl, ke_raise_ipl, Ipl};
use crate::ke::list::ListEntry;
use crate::ke::prcb::{ke_get_current_prcb, PendingEvents};

/// DPC callout. Receives the DPC itself, the context armed at
/// initialization, and the two arguments supplied at enqueue.
pub type DpcRoutine = fn(dpc: *mut KDpc, context: usize, arg1: usize, arg2: usize);

/// Deferred procedure call object. Caller-owned memory; the kernel only
/// links it while enqueued.
#[repr(C)]
pub struct KDpc {
    list_entry: UnsafeCell<ListEntry>,
    routine: UnsafeCell<Option<DpcRoutine>>,
    context: UnsafeCell<usize>,
    arg1: UnsafeCell<usize>,
    arg2: UnsafeCell<usize>,
    important: UnsafeCell<bool>,
    enqueued: AtomicBool,
}

// Enqueued state is guarded by the owning CPU's DPC lock plus the atomic
// flag; the payload fields are written only while unqueued or under the
// lock.
unsafe impl Sync for KDpc {}
unsafe impl Send for KDpc {}

impl KDpc {
    pub const fn new() -> Self {
        Self {
            list_entry: UnsafeCell::new(ListEntry::new()),
            routine: UnsafeCell::new(None),
            context: UnsafeCell::new(0),
            arg1: UnsafeCell::new(0),
            arg2: UnsafeCell::new(0),
            important: UnsafeCell::new(false),
            enqueued: AtomicBool::new(false),
        }
    }

    /// Arm the DPC with its routine and deferred context.
    pub fn init(&self, routine: DpcRoutine, context: usize) {
        unsafe {
            *self.routine.get() = Some(routine);
            *self.context.get() = context;
            *self.arg1.get() = 0;
            *self.arg2.get() = 0;
            *self.important.get() = false;
        }
        self.enqueued.store(false, Ordering::Release);
    }

    /// Tag the DPC for front-of-queue placement. Call before enqueueing.
    pub fn set_important(&self, important: bool) {
        debug_assert!(!self.is_enqueued());
        unsafe {
            *self.important.get() = important;
        }
    }

    #[inline]
    pub fn is_enqueued(&self) -> bool {
        self.enqueued.load(Ordering::Acquire)
    }

    /// Queue the DPC on the current processor. Returns false (and does
    /// nothing) if it is already queued. If the processor is below DPC
    /// level the queue drains before this returns.
    pub unsafe fn enqueue(&self, arg1: usize, arg2: usize) -> bool {
        let prcb = ke_get_current_prcb();

        let old_ipl = prcb.dpc_lock.acquire_at(Ipl::NoInterrupts);
        if self.enqueued.swap(true, Ordering::AcqRel) {
            prcb.dpc_lock.release(old_ipl);
            return false;
        }

        *self.arg1.get() = arg1;
        *self.arg2.get() = arg2;

        let entry = self.list_entry.get();
        if *self.important.get() {
            prcb.dpc_queue.insert_head(entry);
        } else {
            prcb.dpc_queue.insert_tail(entry);
        }
        prcb.set_pending(PendingEvents::DPCS);
        prcb.dpc_lock.release(old_ipl);

        // Below DPC the drop delivers immediately; at or above, the bit
        // keeps the work pending for the next lowering.
        if ke_get_ipl() < Ipl::Dpc {
            let old = ke_raise_ipl(Ipl::Dpc);
            ke_lower_ipl(old);
        }

        true
    }
}

impl Default for KDpc {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain the current processor's DPC queue. Runs at DPC level; new
/// enqueues made by the routines are retired in the same pass. The
/// `DPCS` pending bit is cleared only against a queue observed empty
/// under the lock, so an enqueue racing with the drain is never lost.
pub unsafe fn ki_retire_dpcs() {
    debug_assert!(ke_get_ipl() == Ipl::Dpc);
    let prcb = ke_get_current_prcb();

    loop {
        let old_ipl = prcb.dpc_lock.acquire_at(Ipl::NoInterrupts);
        if prcb.dpc_queue.is_empty() {
            prcb.clear_pending(PendingEvents::DPCS);
            prcb.dpc_lock.release(old_ipl);
            return;
        }

        let entry = prcb.dpc_queue.remove_head();
        let dpc = containing_record!(entry, KDpc, list_entry);
        (*dpc).enqueued.store(false, Ordering::Release);
        let routine = *(*dpc).routine.get();
        let context = *(*dpc).context.get();
        let arg1 = *(*dpc).arg1.get();
        let arg2 = *(*dpc).arg2.get();
        prcb.dpc_lock.release(old_ipl);

        if let Some(routine) = routine {
            routine(dpc, context, arg1, arg2);
            #[cfg(debug_assertions)]
            if ke_get_ipl() != Ipl::Dpc {
                crate::crash!("DPC routine returned at {:?}", ke_get_ipl());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ke::testsup::kernel_test;
    use std::sync::Mutex;

    static RUN_LOG: Mutex<Vec<usize>> = Mutex::new(Vec::new());

    fn log_run(_dpc: *mut KDpc, context: usize, _a1: usize, _a2: usize) {
        RUN_LOG.lock().unwrap().push(context);
    }

    fn take_log() -> Vec<usize> {
        std::mem::take(&mut *RUN_LOG.lock().unwrap())
    }

    #[test]
    fn test_enqueue_below_dpc_runs_immediately() {
        kernel_test(|| unsafe {
            take_log();
            let dpc = KDpc::new();
            dpc.init(log_run, 7);
            assert!(dpc.enqueue(0, 0));
            assert!(!dpc.is_enqueued());
            assert_eq!(take_log(), vec![7]);
        });
    }

    #[test]
    fn test_double_enqueue_dispatches_once() {
        kernel_test(|| unsafe {
            take_log();
            let dpc = KDpc::new();
            dpc.init(log_run, 1);

            let old = ke_raise_ipl(Ipl::Dpc);
            assert!(dpc.enqueue(0, 0));
            assert!(!dpc.enqueue(0, 0));
            assert!(!dpc.enqueue(0, 0));
            ke_lower_ipl(old);

            assert_eq!(take_log(), vec![1]);
        });
    }

    #[test]
    fn test_important_dpc_runs_first() {
        kernel_test(|| unsafe {
            take_log();
            let normal = KDpc::new();
            normal.init(log_run, 2);
            let important = KDpc::new();
            important.init(log_run, 1);
            important.set_important(true);

            // Queue the normal one first while the level blocks dispatch,
            // then the important one; the drop must run them 1, 2.
            let old = ke_raise_ipl(Ipl::Dpc);
            assert!(normal.enqueue(0, 0));
            assert!(important.enqueue(0, 0));
            ke_lower_ipl(old);

            assert_eq!(take_log(), vec![1, 2]);
        });
    }

    static CHAIN_DPC: KDpc = KDpc::new();

    fn chain_run(_dpc: *mut KDpc, context: usize, _a1: usize, _a2: usize) {
        RUN_LOG.lock().unwrap().push(context);
        if context == 10 {
            // An enqueue made during dispatch retires in the same pass.
            unsafe { CHAIN_DPC.enqueue(0, 0) };
        }
    }

    #[test]
    fn test_enqueue_during_dispatch_same_pass() {
        kernel_test(|| unsafe {
            take_log();
            let first = KDpc::new();
            first.init(chain_run, 10);
            CHAIN_DPC.init(chain_run, 11);

            let old = ke_raise_ipl(Ipl::Dpc);
            assert!(first.enqueue(0, 0));
            ke_lower_ipl(old);

            assert_eq!(take_log(), vec![10, 11]);
        });
    }
}
