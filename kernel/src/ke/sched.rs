//! Per-CPU scheduler
//!
//! Eight priority levels, one ready queue per level, and a mask whose
//! set bits name the non-empty queues so picking the next thread is a
//! single bit scan. Every context switch happens at DPC level with the
//! switching processor's scheduler lock held; the processor that resumes
//! a thread releases its own lock immediately after the stack switch, so
//! the lock also serves as the barrier that keeps a waking thread from
//! being run elsewhere before its context is fully saved.
//!
//! Quantum accounting is deadline-based: a thread switched in gets
//! `now + QUANTUM_TICKS`; the clock tick posts a `YIELD` pending event
//! when the deadline passes, and the next drop below DPC requeues the
//! thread at the tail of its priority and picks again.

use core::ptr;
use core::sync::atomic::AtomicU64;

use crate::arch::x86_64::context::ki_switch_stacks;
use crate::hal;
use crate::ke::ipl::{ke_get_ipl, ke_lower_ipl, ke_raise_ipl, Ipl};
use crate::ke::ipi::IPI_VECTOR_RESCHEDULE;
use crate::ke::list::ListEntry;
use crate::ke::prcb::{ke_get_current_prcb, ki_get_prcb, PendingEvents};
use crate::ke::spinlock::KSpinLock;
use crate::ke::thread::{KThread, ThreadState};
use crate::rtl::AvlTree;
use crate::containing_record;

pub const PRIORITY_COUNT: usize = 8;

pub const PRIORITY_IDLE: u8 = 0;
pub const PRIORITY_BACKGROUND: u8 = 1;
pub const PRIORITY_LOWEST: u8 = 2;
pub const PRIORITY_LOW: u8 = 3;
pub const PRIORITY_NORMAL: u8 = 4;
pub const PRIORITY_HIGH: u8 = 5;
pub const PRIORITY_HIGHEST: u8 = 6;
pub const PRIORITY_REALTIME: u8 = 7;

/// Boost applied by dispatcher releases at the moment of unblock.
pub const EX_DISPATCH_BOOST: u8 = 1;

/// Quantum length in clock ticks.
pub const QUANTUM_TICKS: u64 = 6;

/// Per-processor scheduler state, embedded in the PRCB.
#[repr(C)]
pub struct KScheduler {
    pub lock: KSpinLock,
    /// All threads homed on this processor.
    pub thread_list: ListEntry,
    /// One ready queue per priority level.
    pub exec_queue: [ListEntry; PRIORITY_COUNT],
    /// Bit `p` set iff `exec_queue[p]` is non-empty.
    pub exec_queue_mask: u32,
    /// Ready threads on this processor, for least-loaded placement.
    pub ready_count: u32,
    pub current_thread: *mut KThread,
    pub next_thread: *mut KThread,
    pub idle_thread: *mut KThread,
    /// Armed timers ordered by absolute expiry tick.
    pub timer_tree: AvlTree,
    /// Cached earliest expiry, polled by the clock tick.
    pub next_timer_due: AtomicU64,
    /// Copy of the running thread's quantum deadline.
    pub quantum_until: u64,
    pub context_switches: u64,
}

impl KScheduler {
    pub const fn new() -> Self {
        const EMPTY_LIST: ListEntry = ListEntry::new();
        Self {
            lock: KSpinLock::new(),
            thread_list: EMPTY_LIST,
            exec_queue: [EMPTY_LIST; PRIORITY_COUNT],
            exec_queue_mask: 0,
            ready_count: 0,
            current_thread: ptr::null_mut(),
            next_thread: ptr::null_mut(),
            idle_thread: ptr::null_mut(),
            timer_tree: AvlTree::new(),
            next_timer_due: AtomicU64::new(u64::MAX),
            quantum_until: 0,
            context_switches: 0,
        }
    }

    pub fn init(&mut self) {
        self.lock.init();
        self.thread_list.init_head();
        for queue in self.exec_queue.iter_mut() {
            queue.init_head();
        }
        self.exec_queue_mask = 0;
        self.ready_count = 0;
        self.current_thread = ptr::null_mut();
        self.next_thread = ptr::null_mut();
        self.idle_thread = ptr::null_mut();
        self.timer_tree.init();
        self.next_timer_due = AtomicU64::new(u64::MAX);
        self.quantum_until = 0;
        self.context_switches = 0;
    }
}

/// The thread running on the calling processor.
#[inline]
pub fn ke_get_current_thread() -> *mut KThread {
    unsafe { ke_get_current_prcb().sched.current_thread }
}

/// Append `thread` to its ready queue.
///
/// # Safety
/// Scheduler lock held; thread state already set to Ready.
pub(super) unsafe fn ki_insert_ready_locked(sched: &mut KScheduler, thread: *mut KThread) {
    let priority = (*thread).effective_priority();
    (*thread).queued_priority = priority;
    sched.exec_queue[priority as usize].insert_tail(&mut (*thread).queue_entry);
    sched.exec_queue_mask |= 1 << priority;
    sched.ready_count += 1;
}

/// Unlink `thread` from its ready queue.
///
/// # Safety
/// Scheduler lock held; thread is in a ready queue of `sched`.
pub(super) unsafe fn ki_remove_ready_locked(sched: &mut KScheduler, thread: *mut KThread) {
    let priority = (*thread).queued_priority as usize;
    (*thread).queue_entry.remove();
    if sched.exec_queue[priority].is_empty() {
        sched.exec_queue_mask &= !(1 << priority);
    }
    sched.ready_count -= 1;
}

/// Pop the head of the highest non-empty ready queue, or the idle
/// thread.
///
/// # Safety
/// Scheduler lock held.
unsafe fn ki_pick_next_locked(sched: &mut KScheduler) -> *mut KThread {
    if sched.exec_queue_mask == 0 {
        return sched.idle_thread;
    }
    let priority = 31 - sched.exec_queue_mask.leading_zeros();
    let queue = &mut sched.exec_queue[priority as usize];
    let entry = queue.remove_head();
    if queue.is_empty() {
        sched.exec_queue_mask &= !(1 << priority);
    }
    sched.ready_count -= 1;
    containing_record!(entry, KThread, queue_entry)
}

/// Make `thread` runnable on the processor it last ran on (its start
/// placement fixes `last_cpu` for fresh threads). If that processor is
/// running something weaker, provoke a reschedule: a pending yield
/// locally, a reschedule IPI remotely.
///
/// # Safety
/// Caller may hold the dispatcher lock but no scheduler lock.
pub unsafe fn ki_ready_thread(thread: *mut KThread) {
    let cpu = (*thread).last_cpu as usize;
    let prcb = ki_get_prcb(cpu);
    let sched = &mut (*prcb).sched;

    let old_ipl = sched.lock.acquire();
    (*thread).state = ThreadState::Ready;
    ki_insert_ready_locked(sched, thread);

    let current = sched.current_thread;
    let preempt = current.is_null()
        || current == sched.idle_thread
        || (*thread).effective_priority() > (*current).effective_priority();

    // Post the reschedule before the release: releasing may lower the
    // IPL, and the drop is exactly when a local yield must be taken.
    if preempt {
        if cpu == hal::current_processor() {
            (*prcb).set_pending(PendingEvents::YIELD);
        } else {
            hal::send_ipi(1 << cpu, IPI_VECTOR_RESCHEDULE);
        }
    }
    sched.lock.release(old_ipl);
}

/// Switch to the best ready thread.
///
/// # Safety
/// IPL is exactly DPC and the calling processor's scheduler lock is
/// held. The outgoing thread's state must already be its target state
/// (Ready and requeued, Waiting, or Terminated). On return the calling
/// thread has been resumed, possibly on a different processor, and
/// that processor's scheduler lock is held and must be released by the
/// caller.
pub unsafe fn ki_swap_thread() {
    debug_assert!(ke_get_ipl() == Ipl::Dpc);
    let prcb = ke_get_current_prcb();
    let cpu_id = prcb.id;
    let sched = &mut prcb.sched;

    let old_thread = sched.current_thread;
    let new_thread = if !sched.next_thread.is_null() {
        let t = sched.next_thread;
        sched.next_thread = ptr::null_mut();
        t
    } else {
        ki_pick_next_locked(sched)
    };
    debug_assert!(!new_thread.is_null());

    let now = hal::query_tick_count();
    (*new_thread).state = ThreadState::Running;
    (*new_thread).quantum_until = now + QUANTUM_TICKS;
    sched.quantum_until = (*new_thread).quantum_until;

    if new_thread == old_thread {
        return;
    }

    (*new_thread).last_cpu = cpu_id;
    sched.current_thread = new_thread;
    sched.context_switches += 1;

    // Install the incoming address space. CR3 reload flushes non-global
    // translations on this processor; remote processors are handled by
    // explicit shootdown when mappings change.
    let old_map = if old_thread.is_null() || (*old_thread).process.is_null() {
        0
    } else {
        (*(*old_thread).process).page_map
    };
    let new_map = if (*new_thread).process.is_null() {
        0
    } else {
        (*(*new_thread).process).page_map
    };
    if new_map != old_map {
        hal::switch_address_space(new_map);
    }

    debug_assert!(!old_thread.is_null());
    ki_switch_stacks(&mut (*old_thread).kernel_stack, (*new_thread).kernel_stack);
    // Resumed: we are back on this thread's stack, on whichever
    // processor picked us. The caller releases that processor's lock.
}

/// Quantum end: requeue the running thread at the tail of its level and
/// switch. Runs at DPC with no locks held; also the body of an explicit
/// yield.
///
/// # Safety
/// IPL is exactly DPC; no scheduler or dispatcher lock held.
pub unsafe fn ki_end_thread_quantum() {
    let prcb = ke_get_current_prcb();
    let sched = &mut prcb.sched;
    sched.lock.acquire_raw();

    let current = sched.current_thread;
    if current.is_null() {
        sched.lock.release_raw();
        return;
    }

    if current != sched.idle_thread && (*current).state == ThreadState::Running {
        // One-quantum wake boosts decay here.
        (*current).boost = 0;
        (*current).state = ThreadState::Ready;
        ki_insert_ready_locked(sched, current);
    }

    ki_swap_thread();
    ke_get_current_prcb().sched.lock.release_raw();
}

/// Give up the processor without waiting: the thread goes to the tail of
/// its priority queue and the scheduler picks again.
pub unsafe fn ke_yield_execution() {
    let old_ipl = ke_raise_ipl(Ipl::Dpc);
    ki_end_thread_quantum();
    ke_lower_ipl(old_ipl);
}

/// Change a thread's base priority, requeueing it if it is ready and
/// provoking a reschedule if that beats the running thread.
pub unsafe fn ke_set_thread_priority(thread: *mut KThread, priority: u8) {
    debug_assert!(priority < PRIORITY_COUNT as u8);

    let cpu = (*thread).last_cpu as usize;
    let prcb = ki_get_prcb(cpu);
    let sched = &mut (*prcb).sched;

    let old_ipl = sched.lock.acquire();
    (*thread).priority = priority;

    if (*thread).state == ThreadState::Ready && (*thread).queue_entry.is_linked() {
        ki_remove_ready_locked(sched, thread);
        ki_insert_ready_locked(sched, thread);
        let current = sched.current_thread;
        let preempt = current.is_null()
            || current == sched.idle_thread
            || (*thread).effective_priority() > (*current).effective_priority();
        if preempt {
            if cpu == hal::current_processor() {
                (*prcb).set_pending(PendingEvents::YIELD);
            } else {
                hal::send_ipi(1 << cpu, IPI_VECTOR_RESCHEDULE);
            }
        }
    }
    sched.lock.release(old_ipl);
}

/// First code a fresh thread runs, reached by the initial stack frame.
/// Inherits the switching processor's scheduler lock and DPC level.
pub extern "C" fn ki_thread_startup() -> ! {
    unsafe {
        let prcb = ke_get_current_prcb();
        prcb.sched.lock.release_raw();
        ke_lower_ipl(Ipl::Normal);

        let thread = ke_get_current_thread();
        if let Some(routine) = (*thread).start_routine {
            routine((*thread).start_context);
        }
        crate::ke::thread::ke_terminate_thread()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ke::testsup::{collect_log, kernel_test, reset_log, spawn_thread, LOG};

    fn log_and_exit(context: *mut u8) {
        LOG.lock().unwrap().push(context as usize);
    }

    #[test]
    fn test_equal_priority_runs_fifo() {
        kernel_test(|| unsafe {
            reset_log();
            for id in 1..=3usize {
                spawn_thread(log_and_exit, id as *mut u8, PRIORITY_NORMAL);
            }
            // Let them all run: yield until the queue drains.
            for _ in 0..10 {
                ke_yield_execution();
            }
            assert_eq!(collect_log(), vec![1, 2, 3]);
        });
    }

    #[test]
    fn test_higher_priority_runs_first() {
        kernel_test(|| unsafe {
            reset_log();
            spawn_thread(log_and_exit, 1 as *mut u8, PRIORITY_LOW);
            spawn_thread(log_and_exit, 2 as *mut u8, PRIORITY_HIGH);
            spawn_thread(log_and_exit, 3 as *mut u8, PRIORITY_NORMAL);
            // Yielding drains everything at or above our own level; the
            // LOW thread only gets the processor once we sleep.
            for _ in 0..4 {
                ke_yield_execution();
            }
            crate::ke::wait::ke_delay_execution(5);
            assert_eq!(collect_log(), vec![2, 3, 1]);
        });
    }

    #[test]
    fn test_raising_priority_of_ready_thread_preempts() {
        kernel_test(|| unsafe {
            reset_log();
            let thread = spawn_thread(log_and_exit, 7 as *mut u8, PRIORITY_LOW);
            // LOW stays queued behind us.
            assert_eq!((*thread).state, ThreadState::Ready);

            ke_set_thread_priority(thread, PRIORITY_HIGH);
            // The promotion preempted us on the way out of the call.
            LOG.lock().unwrap().push(8);
            assert_eq!(collect_log(), vec![7, 8]);
        });
    }

    fn spin_with_ticks(context: *mut u8) {
        // Increment the shared counter, injecting a clock tick per
        // iteration the way a running thread experiences the timer.
        let counter = context as *const core::sync::atomic::AtomicUsize;
        for _ in 0..100 {
            unsafe { (*counter).fetch_add(1, core::sync::atomic::Ordering::SeqCst) };
            crate::hal::sim::advance_clock(1);
        }
    }

    fn observe_counter(context: *mut u8) {
        let counter = context as *const core::sync::atomic::AtomicUsize;
        unsafe {
            let seen = (*counter).load(core::sync::atomic::Ordering::SeqCst);
            LOG.lock().unwrap().push(seen);
            // The spinner must not run while we hold the processor.
            crate::hal::sim::advance_clock(3);
            assert_eq!((*counter).load(core::sync::atomic::Ordering::SeqCst), seen);
            LOG.lock().unwrap().push((*counter).load(core::sync::atomic::Ordering::SeqCst));
        }
    }

    #[test]
    fn test_quantum_preemption_by_priority() {
        use core::sync::atomic::AtomicUsize;

        kernel_test(|| unsafe {
            reset_log();
            static COUNTER: AtomicUsize = AtomicUsize::new(0);
            COUNTER.store(0, core::sync::atomic::Ordering::SeqCst);
            let ctx = &COUNTER as *const AtomicUsize as *mut u8;

            // A spins at NORMAL; within one quantum of ticks the boot
            // thread (same priority, requeued) gets the processor back,
            // then readies B at HIGH, which preempts A immediately.
            spawn_thread(spin_with_ticks, ctx, PRIORITY_NORMAL);
            ke_yield_execution();
            // A has been preempted by quantum expiry at least once.
            let after_first_quantum = COUNTER.load(core::sync::atomic::Ordering::SeqCst);
            assert!(after_first_quantum >= 1);
            assert!(after_first_quantum <= QUANTUM_TICKS as usize + 1);

            spawn_thread(observe_counter, ctx, PRIORITY_HIGH);
            // B runs to completion before A makes further progress.
            ke_yield_execution();
            let log = collect_log();
            assert_eq!(log.len(), 2);
            assert_eq!(log[0], log[1]);
        });
    }
}
