//! Asynchronous procedure calls
//!
//! APCs run in the context of a specific thread, at APC level, from one
//! of three per-thread queues:
//!
//! - **Special**: kernel-mode APC with no normal routine; can interrupt
//!   normal kernel and user APCs.
//! - **Kernel**: kernel-mode APC with a normal routine; delivered only
//!   while no kernel-tier APC is already running and the thread has not
//!   disabled kernel APCs.
//! - **User**: delivered only after an alertable wait was alerted (there
//!   is no other return-to-user edge in this kernel).
//!
//! The tier is derived at initialization: no normal routine means
//! Special; otherwise the requested mode picks Kernel or User. Delivery
//! points are the IPL dropping below APC, resumption from a wait, and
//! thread startup.

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::containing_record;
use crate::ke::dispatcher::KI_DISPATCHER_LOCK;
use crate::ke::ipl::{ke_get_ipl, ke_lower_ipl, ke_raise_ipl, Ipl};
use crate::ke::list::ListEntry;
use crate::ke::sched::ke_get_current_thread;
use crate::ke::thread::{KThread, ProcessorMode, ThreadState, APC_TIER_COUNT};
use crate::ke::wait::ki_unwait_thread;
use crate::status::KStatus;

/// Queue tier an APC is delivered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApcTier {
    Special = 0,
    Kernel = 1,
    User = 2,
}

/// Runs at APC level in kernel mode, first for every APC. May rewrite
/// the normal routine and its arguments before they run.
pub type ApcKernelRoutine = fn(
    apc: *mut KApc,
    normal_routine: &mut Option<ApcNormalRoutine>,
    normal_context: &mut usize,
    arg1: &mut usize,
    arg2: &mut usize,
);

/// Runs after the kernel routine, in the APC's target mode.
pub type ApcNormalRoutine = fn(context: usize, arg1: usize, arg2: usize);

/// Asynchronous procedure call object. Caller-owned.
#[repr(C)]
pub struct KApc {
    thread: UnsafeCell<*mut KThread>,
    kernel_routine: UnsafeCell<Option<ApcKernelRoutine>>,
    normal_routine: UnsafeCell<Option<ApcNormalRoutine>>,
    normal_context: UnsafeCell<usize>,
    arg1: UnsafeCell<usize>,
    arg2: UnsafeCell<usize>,
    mode: UnsafeCell<ProcessorMode>,
    tier: UnsafeCell<ApcTier>,
    list_entry: UnsafeCell<ListEntry>,
    enqueued: AtomicBool,
}

unsafe impl Sync for KApc {}
unsafe impl Send for KApc {}

impl KApc {
    pub const fn new() -> Self {
        Self {
            thread: UnsafeCell::new(ptr::null_mut()),
            kernel_routine: UnsafeCell::new(None),
            normal_routine: UnsafeCell::new(None),
            normal_context: UnsafeCell::new(0),
            arg1: UnsafeCell::new(0),
            arg2: UnsafeCell::new(0),
            mode: UnsafeCell::new(ProcessorMode::Kernel),
            tier: UnsafeCell::new(ApcTier::Special),
            list_entry: UnsafeCell::new(ListEntry::new()),
            enqueued: AtomicBool::new(false),
        }
    }

    /// Bind the APC to a thread and derive its tier: Special when
    /// `normal_routine` is absent (mode forced to kernel), otherwise
    /// Kernel or User per `mode`.
    pub unsafe fn init(
        &self,
        thread: *mut KThread,
        kernel_routine: Option<ApcKernelRoutine>,
        normal_routine: Option<ApcNormalRoutine>,
        normal_context: usize,
        mode: ProcessorMode,
    ) {
        let special = normal_routine.is_none();
        *self.thread.get() = thread;
        *self.kernel_routine.get() = kernel_routine;
        *self.normal_routine.get() = normal_routine;
        *self.normal_context.get() = normal_context;
        *self.mode.get() = if special { ProcessorMode::Kernel } else { mode };
        *self.tier.get() = if special {
            ApcTier::Special
        } else if mode == ProcessorMode::Kernel {
            ApcTier::Kernel
        } else {
            ApcTier::User
        };
        self.enqueued.store(false, Ordering::Release);
    }

    #[inline]
    pub fn tier(&self) -> ApcTier {
        unsafe { *self.tier.get() }
    }

    #[inline]
    pub fn is_enqueued(&self) -> bool {
        self.enqueued.load(Ordering::Acquire)
    }

    /// Queue the APC to its thread. Returns false if it is already
    /// queued. A user APC posted to a thread blocked in an alertable
    /// wait alerts the wait; an APC posted to the running thread
    /// delivers before this returns if the level permits.
    pub unsafe fn insert(&self, arg1: usize, arg2: usize) -> bool {
        let thread = *self.thread.get();
        debug_assert!(!thread.is_null());

        let old_ipl = KI_DISPATCHER_LOCK.acquire();
        if self.enqueued.swap(true, Ordering::AcqRel) {
            KI_DISPATCHER_LOCK.release(old_ipl);
            return false;
        }

        *self.arg1.get() = arg1;
        *self.arg2.get() = arg2;

        let tier = *self.tier.get();
        (*thread).apc_queue[tier as usize].insert_tail(&mut *self.list_entry.get());

        let request_interrupt = ki_should_request_apc_interrupt(self, thread);

        if tier == ApcTier::User
            && (*thread).state == ThreadState::Waiting
            && (*thread).alertable
        {
            (*thread).user_apc_deliverable = true;
            ki_unwait_thread(thread, KStatus::Alerted, 0);
        }

        KI_DISPATCHER_LOCK.release(old_ipl);

        // Same-thread delivery point: we are the target and the level
        // allows APC dispatch right now.
        if request_interrupt && thread == ke_get_current_thread() && ke_get_ipl() < Ipl::Apc {
            let old = ke_raise_ipl(Ipl::Apc);
            ki_deliver_apcs();
            ke_lower_ipl(old);
        }

        true
    }
}

impl Default for KApc {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a just-queued APC warrants an APC-level interrupt on its
/// thread: a tier only breaks in on strictly weaker activity.
unsafe fn ki_should_request_apc_interrupt(apc: &KApc, thread: *mut KThread) -> bool {
    if (*thread).apc_running[ApcTier::Special as usize] {
        return false;
    }
    if apc.tier() == ApcTier::Special {
        return true;
    }
    if (*thread).apc_running[ApcTier::Kernel as usize] {
        return false;
    }
    if apc.tier() == ApcTier::Kernel {
        return true;
    }
    !(*thread).apc_running[ApcTier::User as usize]
}

/// Whether `thread` has APCs the dispatcher should deliver at the next
/// drop below APC level.
pub(super) unsafe fn ki_apcs_deliverable(thread: *mut KThread) -> bool {
    if (*thread).apc_running[ApcTier::Special as usize] {
        return false;
    }
    if !(*thread).apc_queue[ApcTier::Special as usize].is_empty() {
        return true;
    }
    if !(*thread).apc_running[ApcTier::Kernel as usize]
        && (*thread).apc_disable == 0
        && !(*thread).apc_queue[ApcTier::Kernel as usize].is_empty()
    {
        return true;
    }
    (*thread).user_apc_deliverable
        && !(*thread).apc_running[ApcTier::User as usize]
        && !(*thread).apc_queue[ApcTier::User as usize].is_empty()
}

pub(super) unsafe fn ki_user_apcs_pending(thread: *mut KThread) -> bool {
    !(*thread).apc_queue[ApcTier::User as usize].is_empty()
}

/// Pick the strongest deliverable APC, honoring tier gating.
///
/// # Safety
/// Dispatcher lock held.
unsafe fn ki_next_deliverable_apc(thread: *mut KThread) -> Option<*mut KApc> {
    if (*thread).apc_running[ApcTier::Special as usize] {
        return None;
    }
    let special = &mut (*thread).apc_queue[ApcTier::Special as usize];
    if !special.is_empty() {
        return Some(containing_record!(special.flink, KApc, list_entry));
    }
    if !(*thread).apc_running[ApcTier::Kernel as usize] && (*thread).apc_disable == 0 {
        let kernel = &mut (*thread).apc_queue[ApcTier::Kernel as usize];
        if !kernel.is_empty() {
            return Some(containing_record!(kernel.flink, KApc, list_entry));
        }
    }
    if (*thread).user_apc_deliverable && !(*thread).apc_running[ApcTier::User as usize] {
        let user = &mut (*thread).apc_queue[ApcTier::User as usize];
        if !user.is_empty() {
            return Some(containing_record!(user.flink, KApc, list_entry));
        }
    }
    None
}

/// Drain the current thread's deliverable APCs. Runs at APC level; the
/// routines run outside the dispatcher lock with the tier's running
/// flag set, so a tier never re-enters itself.
pub unsafe fn ki_deliver_apcs() {
    debug_assert!(ke_get_ipl() == Ipl::Apc);
    let thread = ke_get_current_thread();
    if thread.is_null() {
        return;
    }

    loop {
        let old_ipl = KI_DISPATCHER_LOCK.acquire();
        let apc = match ki_next_deliverable_apc(thread) {
            Some(apc) => apc,
            None => {
                if (*thread).apc_queue[ApcTier::User as usize].is_empty() {
                    (*thread).user_apc_deliverable = false;
                }
                KI_DISPATCHER_LOCK.release(old_ipl);
                return;
            }
        };

        let tier = (*apc).tier();
        (*(*apc).list_entry.get()).remove();
        (*apc).enqueued.store(false, Ordering::Release);
        (*thread).apc_running[tier as usize] = true;

        let kernel_routine = *(*apc).kernel_routine.get();
        let mut normal_routine = *(*apc).normal_routine.get();
        let mut normal_context = *(*apc).normal_context.get();
        let mut arg1 = *(*apc).arg1.get();
        let mut arg2 = *(*apc).arg2.get();
        KI_DISPATCHER_LOCK.release(old_ipl);

        if let Some(routine) = kernel_routine {
            routine(apc, &mut normal_routine, &mut normal_context, &mut arg1, &mut arg2);
        }
        if let Some(routine) = normal_routine {
            routine(normal_context, arg1, arg2);
        }

        let old_ipl = KI_DISPATCHER_LOCK.acquire();
        (*thread).apc_running[tier as usize] = false;
        KI_DISPATCHER_LOCK.release(old_ipl);
    }
}

/// Discard every pending APC of a terminating thread.
///
/// # Safety
/// Dispatcher lock held.
pub(super) unsafe fn ki_rundown_apcs(thread: *mut KThread) {
    for tier in 0..APC_TIER_COUNT {
        let queue = &mut (*thread).apc_queue[tier];
        while !queue.is_empty() {
            let entry = queue.remove_head();
            let apc = containing_record!(entry, KApc, list_entry);
            (*apc).enqueued.store(false, Ordering::Release);
        }
    }
    (*thread).user_apc_deliverable = false;
}

/// Hold off kernel-tier APC delivery for the calling thread.
pub unsafe fn ke_enter_critical_region() {
    let thread = ke_get_current_thread();
    if !thread.is_null() {
        (*thread).apc_disable += 1;
    }
}

/// Re-enable kernel-tier APC delivery.
pub unsafe fn ke_leave_critical_region() {
    let thread = ke_get_current_thread();
    if !thread.is_null() {
        debug_assert!((*thread).apc_disable > 0);
        (*thread).apc_disable -= 1;
        if (*thread).apc_disable == 0 && ki_apcs_deliverable(thread) && ke_get_ipl() < Ipl::Apc {
            let old = ke_raise_ipl(Ipl::Apc);
            ki_deliver_apcs();
            ke_lower_ipl(old);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ke::dispatcher::DispatcherHeader;
    use crate::ke::event::{EventType, KEvent};
    use crate::ke::sched::{ke_yield_execution, PRIORITY_NORMAL};
    use crate::ke::testsup::{kernel_test, spawn_thread};
    use crate::ke::wait::{ke_wait_for_single_object, TIMEOUT_INFINITE};
    use std::sync::atomic::{AtomicUsize, Ordering as AO};
    use std::sync::Mutex;

    static DELIVERIES: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    fn note_kernel(
        _apc: *mut KApc,
        _normal: &mut Option<ApcNormalRoutine>,
        _ctx: &mut usize,
        _a1: &mut usize,
        _a2: &mut usize,
    ) {
        DELIVERIES.lock().unwrap().push("kernel-routine");
        assert_eq!(ke_get_ipl(), Ipl::Apc);
    }

    fn note_normal(_ctx: usize, _a1: usize, _a2: usize) {
        DELIVERIES.lock().unwrap().push("normal-routine");
    }

    fn take_deliveries() -> Vec<&'static str> {
        std::mem::take(&mut *DELIVERIES.lock().unwrap())
    }

    #[test]
    fn test_tier_derivation() {
        kernel_test(|| unsafe {
            let thread = ke_get_current_thread();
            let apc = KApc::new();

            apc.init(thread, Some(note_kernel), None, 0, ProcessorMode::User);
            // No normal routine: special, forced kernel mode.
            assert_eq!(apc.tier(), ApcTier::Special);

            apc.init(thread, Some(note_kernel), Some(note_normal), 0, ProcessorMode::Kernel);
            assert_eq!(apc.tier(), ApcTier::Kernel);

            apc.init(thread, Some(note_kernel), Some(note_normal), 0, ProcessorMode::User);
            assert_eq!(apc.tier(), ApcTier::User);
        });
    }

    #[test]
    fn test_special_apc_delivers_to_current_thread() {
        kernel_test(|| unsafe {
            take_deliveries();
            let thread = ke_get_current_thread();
            let apc = KApc::new();
            apc.init(thread, Some(note_kernel), None, 0, ProcessorMode::Kernel);

            assert!(apc.insert(0, 0));
            // Delivered synchronously at the insert (we were at NORMAL).
            assert_eq!(take_deliveries(), vec!["kernel-routine"]);
            assert!(!apc.is_enqueued());
        });
    }

    #[test]
    fn test_double_insert_fails() {
        kernel_test(|| unsafe {
            take_deliveries();
            let thread = ke_get_current_thread();
            let apc = KApc::new();
            apc.init(thread, Some(note_kernel), None, 0, ProcessorMode::Kernel);

            // Hold the level at APC so the insert cannot deliver.
            let old = ke_raise_ipl(Ipl::Apc);
            assert!(apc.insert(0, 0));
            assert!(!apc.insert(0, 0));
            ke_lower_ipl(old);

            assert_eq!(take_deliveries(), vec!["kernel-routine"]);
        });
    }

    #[test]
    fn test_kernel_apc_runs_both_routines() {
        kernel_test(|| unsafe {
            take_deliveries();
            let thread = ke_get_current_thread();
            let apc = KApc::new();
            apc.init(thread, Some(note_kernel), Some(note_normal), 0, ProcessorMode::Kernel);
            assert!(apc.insert(0, 0));
            assert_eq!(take_deliveries(), vec!["kernel-routine", "normal-routine"]);
        });
    }

    #[test]
    fn test_critical_region_defers_kernel_apcs() {
        kernel_test(|| unsafe {
            take_deliveries();
            let thread = ke_get_current_thread();
            let apc = KApc::new();
            apc.init(thread, Some(note_kernel), Some(note_normal), 0, ProcessorMode::Kernel);

            ke_enter_critical_region();
            assert!(apc.insert(0, 0));
            assert!(apc.is_enqueued());
            assert!(take_deliveries().is_empty());
            ke_leave_critical_region();

            assert_eq!(take_deliveries(), vec!["kernel-routine", "normal-routine"]);
        });
    }

    // Alertable wait interrupted by a user APC.
    static mut ALERT_EVENT: KEvent = KEvent::new(EventType::Notification);
    static ALERT_RESULT: AtomicUsize = AtomicUsize::new(0);
    static ALERT_APC: KApc = KApc::new();
    static USER_RAN: AtomicUsize = AtomicUsize::new(0);

    fn user_normal(_ctx: usize, _a1: usize, _a2: usize) {
        USER_RAN.fetch_add(1, AO::SeqCst);
    }

    fn alertable_waiter(_context: *mut u8) {
        unsafe {
            let status = ke_wait_for_single_object(
                &ALERT_EVENT.header as *const _ as *mut DispatcherHeader,
                true,
                TIMEOUT_INFINITE,
                ProcessorMode::Kernel,
            );
            ALERT_RESULT.store(
                match status {
                    KStatus::Alerted => 1,
                    KStatus::Success => 2,
                    _ => 3,
                },
                AO::SeqCst,
            );
        }
    }

    #[test]
    fn test_user_apc_alerts_alertable_wait() {
        kernel_test(|| unsafe {
            let event = core::ptr::addr_of_mut!(ALERT_EVENT);
            (*event).init(EventType::Notification, false);
            ALERT_RESULT.store(0, AO::SeqCst);
            USER_RAN.store(0, AO::SeqCst);

            let waiter = spawn_thread(alertable_waiter, core::ptr::null_mut(), PRIORITY_NORMAL);
            ke_yield_execution();
            assert_eq!((*waiter).state, crate::ke::thread::ThreadState::Waiting);

            ALERT_APC.init(waiter, None, Some(user_normal), 0, ProcessorMode::User);
            assert!(ALERT_APC.insert(0, 0));
            ke_yield_execution();

            // The wait returned Alerted and the user APC ran on the
            // waiter's resumption path.
            assert_eq!(ALERT_RESULT.load(AO::SeqCst), 1);
            assert_eq!(USER_RAN.load(AO::SeqCst), 1);
        });
    }

    static mut NOALERT_EVENT: KEvent = KEvent::new(EventType::Notification);
    static NOALERT_APC: KApc = KApc::new();
    static NOALERT_STATUS: AtomicUsize = AtomicUsize::new(0);

    fn non_alertable_waiter(_context: *mut u8) {
        unsafe {
            let status = ke_wait_for_single_object(
                &NOALERT_EVENT.header as *const _ as *mut DispatcherHeader,
                false,
                TIMEOUT_INFINITE,
                ProcessorMode::Kernel,
            );
            NOALERT_STATUS.store(if status == KStatus::Success { 2 } else { 9 }, AO::SeqCst);
        }
    }

    #[test]
    fn test_user_apc_does_not_interrupt_non_alertable_wait() {
        kernel_test(|| unsafe {
            let event = core::ptr::addr_of_mut!(NOALERT_EVENT);
            (*event).init(EventType::Notification, false);
            NOALERT_STATUS.store(0, AO::SeqCst);
            USER_RAN.store(0, AO::SeqCst);

            let waiter = spawn_thread(non_alertable_waiter, core::ptr::null_mut(), PRIORITY_NORMAL);
            ke_yield_execution();

            NOALERT_APC.init(waiter, None, Some(user_normal), 0, ProcessorMode::User);
            assert!(NOALERT_APC.insert(0, 0));
            ke_yield_execution();

            // Still waiting; the APC stays pending.
            assert_eq!((*waiter).state, crate::ke::thread::ThreadState::Waiting);
            assert_eq!(USER_RAN.load(AO::SeqCst), 0);
            assert!(NOALERT_APC.is_enqueued());

            (*event).set(0);
            ke_yield_execution();
            assert_eq!(NOALERT_STATUS.load(AO::SeqCst), 2);
        });
    }
}
