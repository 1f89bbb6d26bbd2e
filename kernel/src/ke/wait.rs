//! The wait engine
//!
//! `ke_wait_for_multiple_objects` is the single entry point for blocking
//! on dispatcher objects; everything else (single waits, sleeps, mutex
//! acquisition) is a shape of it. The protocol, entirely under the
//! dispatcher lock:
//!
//! 1. Fast path: if the satisfaction predicate already holds, consume
//!    the signals atomically and return without blocking.
//! 2. Slow path: link one wait block per object into the objects' waiter
//!    lists, arm the timeout timer if finite, mark the thread Waiting,
//!    and switch away. Whoever later satisfies the wait consumes the
//!    signals on the waiter's behalf, records the status in the thread,
//!    unlinks every block, and hands the thread to its scheduler.
//!
//! Signalling (`ki_signal_object`) walks the waiter list in FIFO order
//! and wakes every waiter the object's semantics still cover: all of
//! them for notification semantics, one per available unit for
//! semaphores and auto-reset semantics. Waking applies the release's
//! priority boost, which lasts until the woken thread's next quantum
//! end.

use crate::containing_record;
use crate::hal;
use crate::ke::dispatcher::{
    DispatcherHeader, DispatcherType, KWaitBlock, WaitType, KI_DISPATCHER_LOCK,
    THREAD_WAIT_BLOCKS, WAIT_TIMEOUT_INDEX,
};
use crate::ke::ipl::{ke_get_ipl, ke_lower_ipl, Ipl};
use crate::ke::mutex::{ki_acquire_mutex, KMutex};
use crate::ke::prcb::ke_get_current_prcb;
use crate::ke::sched::{self, ke_get_current_thread, PRIORITY_REALTIME};
use crate::ke::thread::{KThread, ProcessorMode, ThreadState};
use crate::ke::timer::{KTimer, TimerType};
use crate::status::{KStatus, MAXIMUM_WAIT_OBJECTS};

/// Disables the wait timeout.
pub const TIMEOUT_INFINITE: u64 = u64::MAX;

/// Wait on a single object. `Success` when the object satisfied the
/// wait; `RangeAbandonedWait(0)` when it was an abandoned mutex.
pub unsafe fn ke_wait_for_single_object(
    object: *mut DispatcherHeader,
    alertable: bool,
    timeout_ms: u64,
    wait_mode: ProcessorMode,
) -> KStatus {
    let objects = [object];
    let status = ke_wait_for_multiple_objects(
        &objects,
        WaitType::Any,
        alertable,
        timeout_ms,
        core::ptr::null_mut(),
        wait_mode,
    );
    match status {
        KStatus::RangeWait(_) => KStatus::Success,
        other => other,
    }
}

/// Wait on up to `MAXIMUM_WAIT_OBJECTS` objects. Waits on more objects
/// than the thread's built-in blocks require a caller-provided block
/// array. Timeout zero polls.
pub unsafe fn ke_wait_for_multiple_objects(
    objects: &[*mut DispatcherHeader],
    wait_type: WaitType,
    alertable: bool,
    timeout_ms: u64,
    wait_block_array: *mut KWaitBlock,
    wait_mode: ProcessorMode,
) -> KStatus {
    let count = objects.len();
    if count == 0 || count > MAXIMUM_WAIT_OBJECTS {
        return KStatus::InvalidParameter;
    }
    if count > THREAD_WAIT_BLOCKS && wait_block_array.is_null() {
        return KStatus::InvalidParameter;
    }
    if ke_get_ipl() > Ipl::Apc {
        crate::crash!("wait entered at {:?}", ke_get_ipl());
    }

    let thread = ke_get_current_thread();
    debug_assert!(!thread.is_null());

    let blocks = if wait_block_array.is_null() {
        (*thread).wait_blocks.as_mut_ptr()
    } else {
        wait_block_array
    };

    let old_ipl = KI_DISPATCHER_LOCK.acquire();

    // Fast path: satisfied right now?
    match wait_type {
        WaitType::Any => {
            for (index, &object) in objects.iter().enumerate() {
                if ki_is_signaled(object, thread) {
                    let abandoned = ki_consume_signal(object, thread);
                    KI_DISPATCHER_LOCK.release(old_ipl);
                    return if abandoned {
                        KStatus::RangeAbandonedWait(index as u8)
                    } else {
                        KStatus::RangeWait(index as u8)
                    };
                }
            }
        }
        WaitType::All => {
            if objects.iter().all(|&o| ki_is_signaled(o, thread)) {
                let mut abandoned_index = None;
                for (index, &object) in objects.iter().enumerate() {
                    if ki_consume_signal(object, thread) && abandoned_index.is_none() {
                        abandoned_index = Some(index as u8);
                    }
                }
                KI_DISPATCHER_LOCK.release(old_ipl);
                return match abandoned_index {
                    Some(i) => KStatus::RangeAbandonedWait(i),
                    None => KStatus::RangeWait(0),
                };
            }
        }
    }

    // An alertable wait with a user APC already pending does not block.
    if alertable && crate::ke::apc::ki_user_apcs_pending(thread) {
        (*thread).user_apc_deliverable = true;
        KI_DISPATCHER_LOCK.release(old_ipl);
        return KStatus::Alerted;
    }

    if timeout_ms == 0 {
        KI_DISPATCHER_LOCK.release(old_ipl);
        return KStatus::Timeout;
    }

    // Commit: link the wait blocks and park the thread.
    for (index, &object) in objects.iter().enumerate() {
        let block = blocks.add(index);
        (*block).thread = thread;
        (*block).object = object;
        (*block).wait_type = wait_type;
        (*block).index = index as u8;
        (*object)
            .waiter_list()
            .insert_tail(&mut (*block).wait_list_entry);
    }
    (*thread).wait_block_array = blocks;
    (*thread).wait_count = count as u8;
    (*thread).wait_type = wait_type;
    (*thread).wait_mode = wait_mode;
    (*thread).alertable = alertable;
    (*thread).wait_status = KStatus::Waiting;

    if timeout_ms != TIMEOUT_INFINITE {
        let timer = &(*thread).timeout_timer;
        timer.arm_locked(hal::milliseconds_to_ticks(timeout_ms));
        let block = &mut (*thread).timeout_block;
        block.thread = thread;
        block.object = &(*thread).timeout_timer.header as *const _ as *mut DispatcherHeader;
        block.wait_type = WaitType::Any;
        block.index = WAIT_TIMEOUT_INDEX;
        timer
            .header
            .waiter_list()
            .insert_tail(&mut block.wait_list_entry);
    }

    (*thread).state = ThreadState::Waiting;

    // Hand the processor over. The scheduler lock is taken before the
    // dispatcher lock drops so a waker that targets this processor
    // cannot slip in until our context is parked.
    let prcb = ke_get_current_prcb();
    prcb.sched.lock.acquire_raw();
    KI_DISPATCHER_LOCK.release_raw();
    sched::ki_swap_thread();
    ke_get_current_prcb().sched.lock.release_raw();

    let status = (*thread).wait_status;
    debug_assert!(status != KStatus::Waiting);
    ke_lower_ipl(old_ipl);
    status
}

/// Put the calling thread to sleep for `ms` milliseconds. Zero yields.
pub unsafe fn ke_delay_execution(ms: u64) -> KStatus {
    if ms == 0 {
        sched::ke_yield_execution();
        return KStatus::Success;
    }

    let mut timer = KTimer::new();
    timer.init(TimerType::Notification);
    timer.set(ms, 0, None);
    ke_wait_for_single_object(
        &timer.header as *const _ as *mut DispatcherHeader,
        false,
        TIMEOUT_INFINITE,
        ProcessorMode::Kernel,
    )
}

/// Whether `object` would satisfy a wait by `thread` right now.
///
/// # Safety
/// Dispatcher lock held.
pub(super) unsafe fn ki_is_signaled(object: *mut DispatcherHeader, thread: *mut KThread) -> bool {
    match (*object).object_type {
        DispatcherType::Mutex => {
            (*object).signal_state() > 0 || {
                let mutex = object as *mut KMutex;
                (*mutex).owner() == thread
            }
        }
        _ => (*object).signal_state() > 0,
    }
}

/// Consume one signal of `object` on behalf of `thread`. Returns whether
/// the consumed signal was an abandoned mutex.
///
/// # Safety
/// Dispatcher lock held; `ki_is_signaled` was true.
pub(super) unsafe fn ki_consume_signal(object: *mut DispatcherHeader, thread: *mut KThread) -> bool {
    match (*object).object_type {
        DispatcherType::EventSynchronization => {
            (*object).set_signal_state(0);
            false
        }
        DispatcherType::Semaphore => {
            let count = (*object).signal_state();
            debug_assert!(count > 0);
            (*object).set_signal_state(count - 1);
            false
        }
        DispatcherType::Mutex => ki_acquire_mutex(object as *mut KMutex, thread),
        DispatcherType::Timer => {
            let timer = object as *mut KTimer;
            if (*timer).timer_type() == TimerType::Synchronization {
                (*object).set_signal_state(0);
            }
            false
        }
        // Notification events, threads and processes stay signalled.
        DispatcherType::EventNotification
        | DispatcherType::Thread
        | DispatcherType::Process => false,
    }
}

/// Whether every object in `thread`'s wait set is signalled.
///
/// # Safety
/// Dispatcher lock held; thread is Waiting.
pub(super) unsafe fn ki_check_wait_all(thread: *mut KThread) -> bool {
    let blocks = (*thread).wait_block_array;
    let count = (*thread).wait_count as usize;
    (0..count).all(|i| {
        let block = blocks.add(i);
        ki_is_signaled((*block).object, thread)
    })
}

/// Consume every object in a satisfied ALL wait. Returns the status to
/// report: index 0, or the first abandoned index.
unsafe fn ki_consume_wait_all(thread: *mut KThread) -> KStatus {
    let blocks = (*thread).wait_block_array;
    let count = (*thread).wait_count as usize;
    let mut abandoned_index = None;
    for i in 0..count {
        let block = blocks.add(i);
        if ki_consume_signal((*block).object, thread) && abandoned_index.is_none() {
            abandoned_index = Some(i as u8);
        }
    }
    match abandoned_index {
        Some(i) => KStatus::RangeAbandonedWait(i),
        None => KStatus::RangeWait(0),
    }
}

/// Wake waiters of a just-signalled object, consuming signals for as
/// long as the object keeps covering them. FIFO over the waiter list;
/// ALL waiters wake only when their whole set is signalled.
///
/// # Safety
/// Dispatcher lock held; the object's signal state reflects the signal.
pub unsafe fn ki_signal_object(object: *mut DispatcherHeader, boost: u8) {
    let head = (*object).waiter_list() as *mut crate::ke::list::ListEntry;
    let mut entry = (*head).flink;

    while entry != head {
        if (*object).signal_state() <= 0 {
            break;
        }
        let next = (*entry).flink;
        let block = containing_record!(entry, KWaitBlock, wait_list_entry);
        let thread = (*block).thread;
        debug_assert!((*thread).state == ThreadState::Waiting);

        match (*block).wait_type {
            WaitType::Any => {
                let status = if (*block).index == WAIT_TIMEOUT_INDEX {
                    KStatus::Timeout
                } else if ki_consume_signal(object, thread) {
                    KStatus::RangeAbandonedWait((*block).index)
                } else {
                    KStatus::RangeWait((*block).index)
                };
                ki_unwait_thread(thread, status, boost);
            }
            WaitType::All => {
                if ki_check_wait_all(thread) {
                    let status = ki_consume_wait_all(thread);
                    ki_unwait_thread(thread, status, boost);
                }
            }
        }

        entry = next;
    }
}

/// Pull a waiting thread out of all its wait lists and make it ready
/// with `status` as the wait's result. Applies the wake boost.
///
/// # Safety
/// Dispatcher lock held; thread is Waiting.
pub(super) unsafe fn ki_unwait_thread(thread: *mut KThread, status: KStatus, boost: u8) {
    debug_assert!((*thread).state == ThreadState::Waiting);

    let blocks = (*thread).wait_block_array;
    let count = (*thread).wait_count as usize;
    for i in 0..count {
        let block = blocks.add(i);
        if (*block).wait_list_entry.is_linked() {
            (*block).wait_list_entry.remove();
        }
    }
    if (*thread).timeout_block.wait_list_entry.is_linked() {
        (*thread).timeout_block.wait_list_entry.remove();
    }
    (*thread).timeout_timer.cancel_locked();
    (*thread).wait_count = 0;
    (*thread).alertable = false;
    (*thread).wait_status = status;

    if boost > 0 && (*thread).priority < PRIORITY_REALTIME && boost > (*thread).boost {
        (*thread).boost = boost;
    }

    sched::ki_ready_thread(thread);
}
