//! Dispatcher object header and wait blocks
//!
//! Every waitable object begins with a `DispatcherHeader`: a type tag, a
//! signal-state integer whose meaning depends on the type, and the list
//! of wait blocks parked on the object. The header and waiter list are
//! consistent only under the global dispatcher lock; every signal,
//! consume, and wait-commit happens with it held.
//!
//! Lock ordering: the dispatcher lock is the highest-order lock in the
//! kernel. Scheduler locks nest inside it; nothing is acquired after a
//! scheduler lock except the PRCB TLB guards.

use core::cell::UnsafeCell;
use core::ptr;

use crate::ke::list::ListEntry;
use crate::ke::spinlock::KSpinLock;

/// The global dispatcher lock. A single lock is deliberate at this
/// machine scale; partitioning it is a future optimization that must
/// preserve the signal/wake happens-before edges.
pub static KI_DISPATCHER_LOCK: KSpinLock = KSpinLock::new();

/// Dispatcher object type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DispatcherType {
    /// Manual-reset event: stays signalled, wakes every waiter.
    EventNotification = 0,
    /// Auto-reset event: wakes one waiter and resets.
    EventSynchronization = 1,
    Mutex = 2,
    Semaphore = 3,
    Timer = 4,
    Thread = 5,
    Process = 6,
}

/// Common header embedded first in every waitable object.
#[repr(C)]
pub struct DispatcherHeader {
    pub object_type: DispatcherType,
    signal_state: UnsafeCell<i32>,
    waiter_list: UnsafeCell<ListEntry>,
}

// Guarded by the dispatcher lock.
unsafe impl Sync for DispatcherHeader {}
unsafe impl Send for DispatcherHeader {}

impl DispatcherHeader {
    pub const fn new(object_type: DispatcherType) -> Self {
        Self {
            object_type,
            signal_state: UnsafeCell::new(0),
            waiter_list: UnsafeCell::new(ListEntry::new()),
        }
    }

    pub fn init(&mut self, object_type: DispatcherType, signal_state: i32) {
        self.object_type = object_type;
        unsafe {
            *self.signal_state.get() = signal_state;
            (*self.waiter_list.get()).init_head();
        }
    }

    #[inline]
    pub fn signal_state(&self) -> i32 {
        unsafe { *self.signal_state.get() }
    }

    /// # Safety
    /// Dispatcher lock held.
    #[inline]
    pub unsafe fn set_signal_state(&self, state: i32) {
        *self.signal_state.get() = state;
    }

    #[inline]
    pub fn is_signaled(&self) -> bool {
        self.signal_state() > 0
    }

    /// # Safety
    /// Dispatcher lock held.
    #[inline]
    pub unsafe fn waiter_list(&self) -> &mut ListEntry {
        &mut *self.waiter_list.get()
    }

    #[inline]
    pub fn has_waiters(&self) -> bool {
        unsafe { !(*self.waiter_list.get()).is_empty() }
    }
}

/// ANY: the wait completes when one object signals. ALL: only when every
/// object in the set signals at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WaitType {
    Any = 0,
    All = 1,
}

/// Wait blocks built into each thread; larger waits need a caller array.
pub const THREAD_WAIT_BLOCKS: usize = 4;

/// Block index reserved for the internal timeout timer.
pub const WAIT_TIMEOUT_INDEX: u8 = 0xFF;

/// One (thread, object) link, alive while the thread waits on the object.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct KWaitBlock {
    /// Link in the object's waiter list.
    pub wait_list_entry: ListEntry,
    pub thread: *mut crate::ke::thread::KThread,
    pub object: *mut DispatcherHeader,
    pub wait_type: WaitType,
    /// Position in the caller's object array; `WAIT_TIMEOUT_INDEX` marks
    /// the timeout block.
    pub index: u8,
}

impl KWaitBlock {
    pub const fn new() -> Self {
        Self {
            wait_list_entry: ListEntry::new(),
            thread: ptr::null_mut(),
            object: ptr::null_mut(),
            wait_type: WaitType::Any,
            index: 0,
        }
    }
}

impl Default for KWaitBlock {
    fn default() -> Self {
        Self::new()
    }
}
