//! Mutex objects
//!
//! A mutex is signalled exactly when it has no owner. Acquisition goes
//! through the wait engine, which assigns ownership as it consumes the
//! signal; re-acquisition by the owner bumps a recursion count instead of
//! blocking. If the owner terminates while holding the mutex, waiters are
//! released with an abandoned status and the next one acquires.

use core::cell::UnsafeCell;
use core::ptr;

use crate::containing_record;
use crate::ke::dispatcher::{DispatcherHeader, DispatcherType, KI_DISPATCHER_LOCK};
use crate::ke::list::ListEntry;
use crate::ke::sched::{ke_get_current_thread, EX_DISPATCH_BOOST};
use crate::ke::thread::KThread;
use crate::ke::wait::ki_signal_object;
use crate::status::KStatus;

/// Kernel mutex.
#[repr(C)]
pub struct KMutex {
    pub header: DispatcherHeader,
    owner: UnsafeCell<*mut KThread>,
    recursion: UnsafeCell<u32>,
    abandoned: UnsafeCell<bool>,
    /// Link in the owner's held-mutex list, used for the abandonment
    /// sweep at thread termination.
    owner_link: UnsafeCell<ListEntry>,
}

unsafe impl Sync for KMutex {}
unsafe impl Send for KMutex {}

impl KMutex {
    pub const fn new() -> Self {
        Self {
            header: DispatcherHeader::new(DispatcherType::Mutex),
            owner: UnsafeCell::new(ptr::null_mut()),
            recursion: UnsafeCell::new(0),
            abandoned: UnsafeCell::new(false),
            owner_link: UnsafeCell::new(ListEntry::new()),
        }
    }

    /// Initialize unowned (signalled).
    pub fn init(&mut self) {
        self.header.init(DispatcherType::Mutex, 1);
        unsafe {
            *self.owner.get() = ptr::null_mut();
            *self.recursion.get() = 0;
            *self.abandoned.get() = false;
        }
    }

    #[inline]
    pub fn owner(&self) -> *mut KThread {
        unsafe { *self.owner.get() }
    }

    /// Signal state: 1 when unowned.
    #[inline]
    pub fn read_state(&self) -> i32 {
        self.header.signal_state()
    }

    /// Release one level of ownership. The final release signals the
    /// mutex and wakes the next waiter. Releasing a mutex the calling
    /// thread does not own is a caller error, not a crash.
    pub unsafe fn release(&self) -> KStatus {
        let current = ke_get_current_thread();
        let old_ipl = KI_DISPATCHER_LOCK.acquire();

        if self.owner() != current || *self.recursion.get() == 0 {
            KI_DISPATCHER_LOCK.release(old_ipl);
            return KStatus::InvalidParameter;
        }

        *self.recursion.get() -= 1;
        if *self.recursion.get() == 0 {
            *self.owner.get() = ptr::null_mut();
            (*self.owner_link.get()).remove();
            self.header.set_signal_state(1);
            ki_signal_object(
                &self.header as *const _ as *mut DispatcherHeader,
                EX_DISPATCH_BOOST,
            );
        }

        KI_DISPATCHER_LOCK.release(old_ipl);
        KStatus::Success
    }
}

impl Default for KMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Assign ownership to `thread` as part of wait satisfaction. Returns
/// whether the acquisition observed an abandoned mutex.
///
/// # Safety
/// Dispatcher lock held; the mutex is signalled or already owned by
/// `thread`.
pub(super) unsafe fn ki_acquire_mutex(mutex: *mut KMutex, thread: *mut KThread) -> bool {
    if (*mutex).owner() == thread {
        *(*mutex).recursion.get() += 1;
        return false;
    }

    debug_assert!((*mutex).header.is_signaled());
    (*mutex).header.set_signal_state(0);
    *(*mutex).owner.get() = thread;
    *(*mutex).recursion.get() = 1;
    (*thread)
        .owned_mutexes
        .insert_tail((*mutex).owner_link.get());

    let was_abandoned = *(*mutex).abandoned.get();
    *(*mutex).abandoned.get() = false;
    was_abandoned
}

/// Strip ownership from a terminating thread. The next waiter (if any)
/// acquires immediately and observes the abandoned status.
///
/// # Safety
/// Dispatcher lock held; the mutex is owned by the terminating thread.
pub(super) unsafe fn ki_abandon_mutex(mutex: *mut KMutex) {
    (*(*mutex).owner_link.get()).remove();
    *(*mutex).owner.get() = ptr::null_mut();
    *(*mutex).recursion.get() = 0;
    *(*mutex).abandoned.get() = true;
    (*mutex).header.set_signal_state(1);
    ki_signal_object(
        &(*mutex).header as *const _ as *mut DispatcherHeader,
        EX_DISPATCH_BOOST,
    );
}

/// Abandon every mutex in a terminating thread's held list.
///
/// # Safety
/// Dispatcher lock held; `thread` is the terminating thread.
pub(super) unsafe fn ki_abandon_owned_mutexes(thread: *mut KThread) {
    while !(*thread).owned_mutexes.is_empty() {
        let entry = (*thread).owned_mutexes.flink;
        let mutex = containing_record!(entry, KMutex, owner_link);
        ki_abandon_mutex(mutex);
    }
}
