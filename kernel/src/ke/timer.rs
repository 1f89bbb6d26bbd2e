//! Timer objects and the clock tick
//!
//! Timers are dispatcher objects that signal when the clock passes their
//! expiry tick. Armed timers live in the owning processor's timer tree,
//! ordered by absolute expiry. The clock interrupt runs at CLOCK level
//! and does two things only: charge the running thread's quantum, and
//! queue the clock DPC when the earliest armed expiry is due. The DPC
//! walks the expired prefix of the tree at DPC level under the dispatcher
//! lock, signalling each timer, re-arming periodic ones, and queueing
//! their user DPCs.
//!
//! Like events, timers come in notification and synchronization reset
//! flavors; a synchronization timer rearms to unsignalled after
//! satisfying one waiter.

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::containing_record;
use crate::hal;
use crate::ke::dispatcher::{DispatcherHeader, DispatcherType, KI_DISPATCHER_LOCK};
use crate::ke::dpc::KDpc;
use crate::ke::prcb::{ke_get_current_prcb, ki_get_prcb, PendingEvents};
use crate::ke::sched::KScheduler;
use crate::rtl::AvlNode;

/// Timer reset flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerType {
    /// Stays signalled after expiry until explicitly re-armed.
    Notification,
    /// Auto-resets after satisfying one waiter.
    Synchronization,
}

/// Kernel timer.
#[repr(C)]
pub struct KTimer {
    pub header: DispatcherHeader,
    node: UnsafeCell<AvlNode>,
    period_ticks: UnsafeCell<u64>,
    timer_type: UnsafeCell<TimerType>,
    dpc: UnsafeCell<*mut KDpc>,
    /// Processor whose timer tree holds the armed node.
    cpu: UnsafeCell<u32>,
    inserted: AtomicBool,
}

unsafe impl Sync for KTimer {}
unsafe impl Send for KTimer {}

impl KTimer {
    pub const fn new() -> Self {
        Self {
            header: DispatcherHeader::new(DispatcherType::Timer),
            node: UnsafeCell::new(AvlNode::new()),
            period_ticks: UnsafeCell::new(0),
            timer_type: UnsafeCell::new(TimerType::Notification),
            dpc: UnsafeCell::new(ptr::null_mut()),
            cpu: UnsafeCell::new(0),
            inserted: AtomicBool::new(false),
        }
    }

    pub fn init(&mut self, timer_type: TimerType) {
        self.header.init(DispatcherType::Timer, 0);
        unsafe {
            *self.node.get() = AvlNode::new();
            *self.period_ticks.get() = 0;
            *self.timer_type.get() = timer_type;
            *self.dpc.get() = ptr::null_mut();
        }
        self.inserted.store(false, Ordering::Release);
    }

    pub(super) fn timer_type(&self) -> TimerType {
        unsafe { *self.timer_type.get() }
    }

    #[inline]
    pub fn read_state(&self) -> i32 {
        self.header.signal_state()
    }

    /// Arm the timer to expire `due_ms` from now, optionally repeating
    /// every `period_ms` and queueing `dpc` at each expiry. Re-arming a
    /// pending timer resets it; returns whether it was pending.
    pub unsafe fn set(&self, due_ms: u64, period_ms: u64, dpc: Option<&KDpc>) -> bool {
        let old_ipl = KI_DISPATCHER_LOCK.acquire();
        let was_pending = self.cancel_locked();

        self.header.set_signal_state(0);
        let cpu = hal::current_processor();
        *self.cpu.get() = cpu as u32;
        *self.period_ticks.get() = hal::milliseconds_to_ticks(period_ms);
        *self.dpc.get() = dpc
            .map(|d| d as *const KDpc as *mut KDpc)
            .unwrap_or(ptr::null_mut());

        let node = self.node.get();
        (*node).key = hal::query_tick_count() + hal::milliseconds_to_ticks(due_ms);
        let sched = &mut (*ki_get_prcb(cpu)).sched;
        sched.timer_tree.insert(node);
        self.inserted.store(true, Ordering::Release);
        ki_update_next_timer_due(sched);

        KI_DISPATCHER_LOCK.release(old_ipl);
        was_pending
    }

    /// Disarm a pending timer. Returns whether it was pending.
    pub unsafe fn cancel(&self) -> bool {
        let old_ipl = KI_DISPATCHER_LOCK.acquire();
        let was_pending = self.cancel_locked();
        KI_DISPATCHER_LOCK.release(old_ipl);
        was_pending
    }

    /// Arm a bare one-shot expiry for a wait timeout. No user DPC, no
    /// period.
    ///
    /// # Safety
    /// Dispatcher lock held.
    pub(super) unsafe fn arm_locked(&self, due_ticks: u64) {
        self.cancel_locked();
        self.header.set_signal_state(0);
        let cpu = hal::current_processor();
        *self.cpu.get() = cpu as u32;
        *self.period_ticks.get() = 0;
        *self.dpc.get() = ptr::null_mut();

        let node = self.node.get();
        (*node).key = hal::query_tick_count() + due_ticks;
        let sched = &mut (*ki_get_prcb(cpu)).sched;
        sched.timer_tree.insert(node);
        self.inserted.store(true, Ordering::Release);
        ki_update_next_timer_due(sched);
    }

    /// # Safety
    /// Dispatcher lock held.
    pub(super) unsafe fn cancel_locked(&self) -> bool {
        if !self.inserted.swap(false, Ordering::AcqRel) {
            return false;
        }
        let sched = &mut (*ki_get_prcb(*self.cpu.get() as usize)).sched;
        sched.timer_tree.remove(self.node.get());
        ki_update_next_timer_due(sched);
        true
    }
}

impl Default for KTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Refresh the cached earliest-expiry tick the clock interrupt polls.
///
/// # Safety
/// Dispatcher lock held.
pub(super) unsafe fn ki_update_next_timer_due(sched: &mut KScheduler) {
    let first = sched.timer_tree.first();
    let due = if first.is_null() {
        u64::MAX
    } else {
        (*first).key
    };
    sched.next_timer_due.store(due, Ordering::Release);
}

/// Clock interrupt body. Runs at CLOCK level on every tick.
pub unsafe fn ke_timer_tick() {
    let prcb = ke_get_current_prcb();
    let now = hal::query_tick_count();
    let sched = &prcb.sched;

    let current = sched.current_thread;
    if !current.is_null() {
        (*current).accumulated_ticks += 1;
        if current != sched.idle_thread && now >= (*current).quantum_until {
            prcb.set_pending(PendingEvents::YIELD);
        }
    }

    if sched.next_timer_due.load(Ordering::Acquire) <= now {
        prcb.clock_dpc.enqueue(now as usize, 0);
    }
}

/// Clock DPC: signal every timer in this processor's tree whose expiry
/// has passed, re-arming periodic ones.
pub fn ki_expire_timers(_dpc: *mut KDpc, _context: usize, _arg1: usize, _arg2: usize) {
    unsafe {
        let old_ipl = KI_DISPATCHER_LOCK.acquire();
        let sched = &mut ke_get_current_prcb().sched;
        let now = hal::query_tick_count();

        loop {
            let node = sched.timer_tree.first();
            if node.is_null() || (*node).key > now {
                break;
            }
            let timer = containing_record!(node, KTimer, node);

            sched.timer_tree.remove(node);
            (*timer).inserted.store(false, Ordering::Release);
            (*timer).header.set_signal_state(1);
            crate::ke::wait::ki_signal_object(
                &(*timer).header as *const _ as *mut DispatcherHeader,
                0,
            );

            let period = *(*timer).period_ticks.get();
            if period > 0 {
                (*node).key = now + period;
                sched.timer_tree.insert(node);
                (*timer).inserted.store(true, Ordering::Release);
            }

            let dpc = *(*timer).dpc.get();
            if !dpc.is_null() {
                (*dpc).enqueue(now as usize, 0);
            }
        }

        ki_update_next_timer_due(sched);
        KI_DISPATCHER_LOCK.release(old_ipl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim;
    use crate::ke::testsup::kernel_test;

    #[test]
    fn test_one_shot_signals_at_expiry() {
        kernel_test(|| unsafe {
            let mut timer = KTimer::new();
            timer.init(TimerType::Notification);
            timer.set(5, 0, None);

            sim::advance_clock(4);
            assert_eq!(timer.read_state(), 0);

            sim::advance_clock(1);
            assert_eq!(timer.read_state(), 1);

            // Stays signalled; one-shot does not re-arm.
            sim::advance_clock(10);
            assert_eq!(timer.read_state(), 1);
            assert!(!timer.cancel());
        });
    }

    #[test]
    fn test_rearm_resets_pending_timer() {
        kernel_test(|| unsafe {
            let mut timer = KTimer::new();
            timer.init(TimerType::Notification);
            assert!(!timer.set(10, 0, None));
            // Re-arming while pending reports the pending state and
            // pushes the expiry out.
            assert!(timer.set(20, 0, None));

            sim::advance_clock(15);
            assert_eq!(timer.read_state(), 0);
            sim::advance_clock(5);
            assert_eq!(timer.read_state(), 1);
        });
    }

    #[test]
    fn test_periodic_rearms_and_queues_dpc() {
        use std::sync::atomic::{AtomicUsize, Ordering as AO};
        static FIRES: AtomicUsize = AtomicUsize::new(0);

        fn count_fire(_d: *mut KDpc, _c: usize, _a: usize, _b: usize) {
            FIRES.fetch_add(1, AO::SeqCst);
        }

        kernel_test(|| unsafe {
            FIRES.store(0, AO::SeqCst);
            let dpc = KDpc::new();
            dpc.init(count_fire, 0);

            let mut timer = KTimer::new();
            timer.init(TimerType::Notification);
            timer.set(3, 3, Some(&dpc));

            sim::advance_clock(9);
            assert_eq!(FIRES.load(AO::SeqCst), 3);

            assert!(timer.cancel());
            sim::advance_clock(9);
            assert_eq!(FIRES.load(AO::SeqCst), 3);
        });
    }

    #[test]
    fn test_cancel_unarmed_timer() {
        kernel_test(|| unsafe {
            let mut timer = KTimer::new();
            timer.init(TimerType::Synchronization);
            assert!(!timer.cancel());
        });
    }
}
