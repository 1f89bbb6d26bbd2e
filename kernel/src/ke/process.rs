//! Kernel processes
//!
//! A process aggregates an address-space handle, scheduling defaults for
//! its threads, and the thread list. Processes are dispatcher objects:
//! the header signals when the last thread terminates. A thread belongs
//! to exactly one process for life.

use core::cell::UnsafeCell;

use crate::ke::dispatcher::{DispatcherHeader, DispatcherType};
use crate::ke::list::ListEntry;
use crate::ke::sched;
use crate::mm::PageMapHandle;

/// Kernel process object.
#[repr(C)]
pub struct KProcess {
    /// Dispatcher header; signals on termination of the last thread.
    pub header: DispatcherHeader,
    /// Address-space handle installed on switches into this process's
    /// threads. Zero is the shared kernel address space.
    pub page_map: PageMapHandle,
    /// Threads belonging to this process.
    pub thread_list: ListEntry,
    /// Ticks accumulated by terminated threads.
    pub accumulated_ticks: u64,
    /// Default priority for new threads.
    pub default_priority: u8,
    /// Default affinity for new threads.
    pub default_affinity: u64,
    /// Detached processes are reaped by the system at termination
    /// instead of being joined.
    pub detached: bool,
}

impl KProcess {
    pub const fn new() -> Self {
        Self {
            header: DispatcherHeader::new(DispatcherType::Process),
            page_map: 0,
            thread_list: ListEntry::new(),
            accumulated_ticks: 0,
            default_priority: sched::PRIORITY_NORMAL,
            default_affinity: u64::MAX,
            detached: false,
        }
    }

    pub fn init(&mut self, page_map: PageMapHandle, default_priority: u8, default_affinity: u64) {
        self.header.init(DispatcherType::Process, 0);
        self.page_map = page_map;
        self.thread_list.init_head();
        self.accumulated_ticks = 0;
        self.default_priority = default_priority;
        self.default_affinity = default_affinity;
        self.detached = false;
    }

    #[inline]
    pub fn read_state(&self) -> i32 {
        self.header.signal_state()
    }
}

struct SystemProcess(UnsafeCell<KProcess>);

unsafe impl Sync for SystemProcess {}

static SYSTEM_PROCESS: SystemProcess = SystemProcess(UnsafeCell::new(KProcess::new()));

/// The process that owns kernel-only threads (idle, boot, workers).
pub fn ke_get_system_process() -> *mut KProcess {
    SYSTEM_PROCESS.0.get()
}

/// Initialize the system process at bring-up.
pub(super) unsafe fn ki_initialize_system_process() {
    (*ke_get_system_process()).init(0, sched::PRIORITY_NORMAL, u64::MAX);
}

/// The process owning the calling thread.
pub fn ke_get_current_process() -> *mut KProcess {
    let thread = sched::ke_get_current_thread();
    if thread.is_null() {
        ke_get_system_process()
    } else {
        unsafe { (*thread).process }
    }
}
