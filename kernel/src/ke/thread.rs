//! Kernel threads
//!
//! A thread owns its stack pages, carries its saved machine state at the
//! top of that stack while not running, and is itself a dispatcher object
//! that signals on termination. Scheduling state (priority, boost,
//! affinity, quantum deadline), wait state (blocks, timeout timer,
//! alertability) and the three APC tiers all live here.
//!
//! Threads come from a fixed pool; the stack comes from the page
//! allocator and is returned by a rundown DPC queued at termination, so
//! the release happens only after the dying thread's final switch has
//! left the stack.

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::arch::x86_64::context::ki_prepare_initial_stack;
use crate::crash;
use crate::hal;
use crate::ke::dispatcher::{
    DispatcherHeader, DispatcherType, KWaitBlock, WaitType, KI_DISPATCHER_LOCK, THREAD_WAIT_BLOCKS,
};
use crate::ke::dpc::KDpc;
use crate::ke::ipl::{ke_get_ipl, Ipl};
use crate::ke::list::ListEntry;
use crate::ke::prcb::{ke_get_current_prcb, ke_get_processor_count, ki_get_prcb};
use crate::ke::process::KProcess;
use crate::ke::sched;
use crate::ke::timer::{KTimer, TimerType};
use crate::mm::{mm_allocate_pages, mm_free_pages, PAGE_SIZE};
use crate::status::KStatus;

/// Kernel stack: 4 pages (16 KiB).
pub const THREAD_STACK_PAGES: usize = 4;

/// Fixed thread pool size.
pub const MAX_THREADS: usize = 64;

/// Thread start routine.
pub type StartRoutine = fn(context: *mut u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    Initialized = 0,
    Ready = 1,
    Running = 2,
    Waiting = 3,
    Terminated = 4,
}

/// Processor mode a thread arrived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorMode {
    Kernel = 0,
    User = 1,
}

/// Number of APC tiers (special, kernel, user).
pub const APC_TIER_COUNT: usize = 3;

/// Kernel thread object.
#[repr(C)]
pub struct KThread {
    /// Dispatcher header; signals when the thread terminates.
    pub header: DispatcherHeader,

    pub state: ThreadState,
    /// Base priority, 0..7.
    pub priority: u8,
    /// Wake boost on top of the base priority; decays at quantum end.
    pub boost: u8,
    /// Priority the thread was queued at, for ready-queue removal.
    pub queued_priority: u8,
    pub affinity: u64,
    pub thread_id: u32,
    /// Processor the thread last ran on; wakeups rejoin it.
    pub last_cpu: u32,
    /// Processor whose scheduler thread list holds this thread.
    pub home_cpu: u32,

    /// Ready-queue linkage.
    pub queue_entry: ListEntry,
    /// Per-scheduler thread list linkage.
    pub thread_list_entry: ListEntry,
    /// Owning process's thread list linkage.
    pub process_link: ListEntry,

    /// Saved stack pointer while not running.
    pub kernel_stack: *mut u8,
    pub stack_base: *mut u8,
    pub stack_pages: usize,

    pub start_routine: Option<StartRoutine>,
    pub start_context: *mut u8,

    pub previous_mode: ProcessorMode,
    /// Absolute tick at which the quantum expires.
    pub quantum_until: u64,
    pub accumulated_ticks: u64,

    pub process: *mut KProcess,

    // APC state.
    pub apc_queue: [ListEntry; APC_TIER_COUNT],
    pub apc_running: [bool; APC_TIER_COUNT],
    /// Kernel-tier delivery is held off while positive.
    pub apc_disable: i32,
    /// Set when an alertable wait was alerted; user APCs deliver at the
    /// next delivery point while set.
    pub user_apc_deliverable: bool,

    // Wait state.
    pub alertable: bool,
    pub wait_mode: ProcessorMode,
    pub wait_status: KStatus,
    pub wait_type: WaitType,
    pub wait_count: u8,
    pub wait_block_array: *mut KWaitBlock,
    pub wait_blocks: [KWaitBlock; THREAD_WAIT_BLOCKS],
    pub timeout_block: KWaitBlock,
    pub timeout_timer: KTimer,

    /// Mutexes this thread currently owns, for the abandonment sweep.
    pub owned_mutexes: ListEntry,

    /// Releases the stack after the final switch away.
    pub rundown_dpc: KDpc,
}

impl KThread {
    pub const fn new() -> Self {
        const EMPTY_LIST: ListEntry = ListEntry::new();
        const EMPTY_BLOCK: KWaitBlock = KWaitBlock::new();
        Self {
            header: DispatcherHeader::new(DispatcherType::Thread),
            state: ThreadState::Initialized,
            priority: sched::PRIORITY_NORMAL,
            boost: 0,
            queued_priority: 0,
            affinity: u64::MAX,
            thread_id: 0,
            last_cpu: 0,
            home_cpu: 0,
            queue_entry: EMPTY_LIST,
            thread_list_entry: EMPTY_LIST,
            process_link: EMPTY_LIST,
            kernel_stack: ptr::null_mut(),
            stack_base: ptr::null_mut(),
            stack_pages: 0,
            start_routine: None,
            start_context: ptr::null_mut(),
            previous_mode: ProcessorMode::Kernel,
            quantum_until: 0,
            accumulated_ticks: 0,
            process: ptr::null_mut(),
            apc_queue: [EMPTY_LIST; APC_TIER_COUNT],
            apc_running: [false; APC_TIER_COUNT],
            apc_disable: 0,
            user_apc_deliverable: false,
            alertable: false,
            wait_mode: ProcessorMode::Kernel,
            wait_status: KStatus::Success,
            wait_type: WaitType::Any,
            wait_count: 0,
            wait_block_array: ptr::null_mut(),
            wait_blocks: [EMPTY_BLOCK; THREAD_WAIT_BLOCKS],
            timeout_block: EMPTY_BLOCK,
            timeout_timer: KTimer::new(),
            owned_mutexes: EMPTY_LIST,
            rundown_dpc: KDpc::new(),
        }
    }

    /// Effective scheduling priority: base plus wake boost, capped below
    /// the realtime level. Realtime threads are never boosted.
    #[inline]
    pub fn effective_priority(&self) -> u8 {
        if self.priority >= sched::PRIORITY_REALTIME {
            self.priority
        } else {
            (self.priority + self.boost).min(sched::PRIORITY_REALTIME - 1)
        }
    }
}

struct ThreadPool(UnsafeCell<[KThread; MAX_THREADS]>);

unsafe impl Sync for ThreadPool {}

static THREAD_POOL: ThreadPool = {
    const INIT: KThread = KThread::new();
    ThreadPool(UnsafeCell::new([INIT; MAX_THREADS]))
};

static THREAD_POOL_BITMAP: Mutex<u64> = Mutex::new(0);

static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

/// Take an uninitialized thread object from the pool. Null when the pool
/// is exhausted.
pub fn ke_allocate_thread() -> *mut KThread {
    let mut bitmap = THREAD_POOL_BITMAP.lock();
    for slot in 0..MAX_THREADS {
        if *bitmap & (1 << slot) == 0 {
            *bitmap |= 1 << slot;
            let thread = unsafe { (THREAD_POOL.0.get() as *mut KThread).add(slot) };
            unsafe { thread.write(KThread::new()) };
            return thread;
        }
    }
    ptr::null_mut()
}

/// Return a terminated thread object to the pool.
///
/// # Safety
/// The thread must be terminated, with no waiters and no queue
/// membership anywhere.
pub unsafe fn ke_free_thread(thread: *mut KThread) {
    let base = THREAD_POOL.0.get() as usize;
    let slot = (thread as usize - base) / core::mem::size_of::<KThread>();
    debug_assert!(slot < MAX_THREADS);
    let mut bitmap = THREAD_POOL_BITMAP.lock();
    *bitmap &= !(1 << slot);
}

/// Set up an allocated thread: stack, initial frame, lists, identity.
/// The thread stays `Initialized` until `ke_start_thread`.
pub unsafe fn ke_initialize_thread(
    thread: *mut KThread,
    process: *mut KProcess,
    routine: StartRoutine,
    context: *mut u8,
    priority: u8,
    affinity: u64,
) -> KStatus {
    debug_assert!(priority < sched::PRIORITY_COUNT as u8);

    let stack = mm_allocate_pages(THREAD_STACK_PAGES);
    if stack.is_null() {
        return KStatus::InsufficientResources;
    }

    let t = &mut *thread;
    t.header.init(DispatcherType::Thread, 0);
    t.state = ThreadState::Initialized;
    t.priority = priority;
    t.boost = 0;
    t.affinity = affinity;
    t.thread_id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
    t.process = process;
    t.start_routine = Some(routine);
    t.start_context = context;
    t.stack_base = stack;
    t.stack_pages = THREAD_STACK_PAGES;
    let stack_top = stack.add(THREAD_STACK_PAGES * PAGE_SIZE);
    t.kernel_stack = ki_prepare_initial_stack(stack_top, sched::ki_thread_startup);
    for queue in t.apc_queue.iter_mut() {
        queue.init_head();
    }
    t.owned_mutexes.init_head();
    t.timeout_timer.init(TimerType::Notification);
    t.rundown_dpc.init(ki_thread_rundown, thread as usize);

    KStatus::Success
}

/// Allocate and initialize in one step.
pub unsafe fn ke_create_thread(
    process: *mut KProcess,
    routine: StartRoutine,
    context: *mut u8,
    priority: u8,
    affinity: u64,
) -> Result<*mut KThread, KStatus> {
    let thread = ke_allocate_thread();
    if thread.is_null() {
        return Err(KStatus::InsufficientResources);
    }
    let status = ke_initialize_thread(thread, process, routine, context, priority, affinity);
    if status != KStatus::Success {
        ke_free_thread(thread);
        return Err(status);
    }
    Ok(thread)
}

/// Transition Initialized -> Ready, placing the thread on the least
/// loaded processor its affinity admits.
pub unsafe fn ke_start_thread(thread: *mut KThread) {
    debug_assert!((*thread).state == ThreadState::Initialized);

    let old_ipl = KI_DISPATCHER_LOCK.acquire();

    let target = ki_pick_start_processor((*thread).affinity);
    (*thread).last_cpu = target as u32;
    (*thread).home_cpu = target as u32;

    let process = (*thread).process;
    if !process.is_null() {
        (*process).thread_list.insert_tail(&mut (*thread).process_link);
    }

    let prcb = ki_get_prcb(target);
    let sched_lock_ipl = (*prcb).sched.lock.acquire();
    (*prcb)
        .sched
        .thread_list
        .insert_tail(&mut (*thread).thread_list_entry);
    (*prcb).sched.lock.release(sched_lock_ipl);

    log::trace!(
        "starting thread {} at priority {} on cpu {}",
        (*thread).thread_id,
        (*thread).priority,
        target
    );
    sched::ki_ready_thread(thread);

    KI_DISPATCHER_LOCK.release(old_ipl);
}

/// Least-loaded online processor within `affinity`; ties go to the
/// calling processor.
unsafe fn ki_pick_start_processor(affinity: u64) -> usize {
    let own = hal::current_processor();
    let count = ke_get_processor_count();
    let mut best = usize::MAX;
    let mut best_load = u32::MAX;

    for cpu in 0..count {
        if affinity & (1 << cpu) == 0 {
            continue;
        }
        let load = (*ki_get_prcb(cpu)).sched.ready_count;
        if load < best_load || (load == best_load && cpu == own) {
            best = cpu;
            best_load = load;
        }
    }

    if best == usize::MAX {
        // Affinity excludes every online processor; fall back to the
        // caller rather than stranding the thread.
        own
    } else {
        best
    }
}

/// Terminate the calling thread. Signals the thread object, abandons
/// held mutexes, discards pending APCs, signals the owning process if
/// this was its last thread, queues the stack rundown, and switches away
/// for good.
pub unsafe fn ke_terminate_thread() -> ! {
    debug_assert!(ke_get_ipl() <= Ipl::Apc);

    let _ = KI_DISPATCHER_LOCK.acquire();
    let prcb = ke_get_current_prcb();
    let thread = prcb.sched.current_thread;

    log::trace!("thread {} terminating", (*thread).thread_id);

    (*thread).state = ThreadState::Terminated;
    crate::ke::apc::ki_rundown_apcs(thread);
    crate::ke::mutex::ki_abandon_owned_mutexes(thread);

    (*thread).header.set_signal_state(1);
    crate::ke::wait::ki_signal_object(&mut (*thread).header, 0);

    let process = (*thread).process;
    if !process.is_null() {
        (*process).accumulated_ticks += (*thread).accumulated_ticks;
        (*thread).process_link.remove();
        if (*process).thread_list.is_empty() {
            (*process).header.set_signal_state(1);
            crate::ke::wait::ki_signal_object(&mut (*process).header, 0);
        }
    }

    let home = ki_get_prcb((*thread).home_cpu as usize);
    (*home).sched.lock.acquire_raw();
    (*thread).thread_list_entry.remove();
    (*home).sched.lock.release_raw();

    // Stay at DPC: the rundown DPC must not run until the final switch
    // has left this stack.
    KI_DISPATCHER_LOCK.release_raw();
    (*thread).rundown_dpc.enqueue(0, 0);

    ke_get_current_prcb().sched.lock.acquire_raw();
    sched::ki_swap_thread();
    crash!("terminated thread was rescheduled");
}

/// Rundown DPC: return the dead thread's stack to the page allocator.
/// The object itself stays valid for joiners until `ke_free_thread`.
fn ki_thread_rundown(_dpc: *mut KDpc, context: usize, _arg1: usize, _arg2: usize) {
    unsafe {
        let thread = context as *mut KThread;
        debug_assert!((*thread).state == ThreadState::Terminated);
        if !(*thread).stack_base.is_null() {
            mm_free_pages((*thread).stack_base, (*thread).stack_pages);
            (*thread).stack_base = ptr::null_mut();
        }
    }
}

/// Mode the current thread most recently entered the kernel from.
pub fn ke_get_previous_mode() -> ProcessorMode {
    let thread = sched::ke_get_current_thread();
    if thread.is_null() {
        ProcessorMode::Kernel
    } else {
        unsafe { (*thread).previous_mode }
    }
}

/// Release every pool slot. Test support.
#[cfg(test)]
pub(crate) fn ki_reset_thread_pool() {
    *THREAD_POOL_BITMAP.lock() = 0;
    NEXT_THREAD_ID.store(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ke::testsup::kernel_test;

    #[test]
    fn test_pool_allocate_free() {
        kernel_test(|| unsafe {
            let a = ke_allocate_thread();
            let b = ke_allocate_thread();
            assert!(!a.is_null());
            assert!(!b.is_null());
            assert_ne!(a, b);
            ke_free_thread(a);
            let c = ke_allocate_thread();
            assert_eq!(a, c);
            ke_free_thread(b);
            ke_free_thread(c);
        });
    }

    #[test]
    fn test_effective_priority_caps() {
        let mut thread = KThread::new();
        thread.priority = sched::PRIORITY_NORMAL;
        thread.boost = 1;
        assert_eq!(thread.effective_priority(), sched::PRIORITY_NORMAL + 1);

        thread.boost = 40;
        assert_eq!(thread.effective_priority(), sched::PRIORITY_REALTIME - 1);

        thread.priority = sched::PRIORITY_REALTIME;
        thread.boost = 1;
        assert_eq!(thread.effective_priority(), sched::PRIORITY_REALTIME);
    }
}
