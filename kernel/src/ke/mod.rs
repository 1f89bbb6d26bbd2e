//! Kernel executive (ke)
//!
//! The dispatcher core: everything between the interrupt layer and
//! ordinary thread code.
//!
//! - **IPL machine** (`ipl`): per-CPU interrupt priority levels; the
//!   ordering primitive everything else leans on
//! - **Locks** (`spinlock`): IPL-raising spinlocks and FIFO ticket locks
//! - **DPC** (`dpc`): per-CPU deferred procedure calls
//! - **APC** (`apc`): per-thread asynchronous procedure calls, three
//!   tiers
//! - **Dispatcher objects** (`dispatcher`, `event`, `mutex`,
//!   `semaphore`, `timer`): waitable objects behind a common header
//! - **Wait engine** (`wait`): multi-object waits with timeouts,
//!   alertability, and priority boosting
//! - **Scheduler** (`sched`): 8-level per-CPU ready queues, quantum
//!   accounting, context switching
//! - **Threads & processes** (`thread`, `process`)
//! - **IPIs** (`ipi`): reschedule requests and TLB shootdown
//!
//! The PRCB (`prcb`) ties the per-CPU pieces together; `init` brings
//! processors up; `idle` parks them when there is nothing to run.

pub mod list;
pub mod ipl;
pub mod spinlock;
pub mod prcb;
pub mod crash;

pub mod dpc;
pub mod apc;

pub mod dispatcher;
pub mod event;
pub mod mutex;
pub mod semaphore;
pub mod timer;

pub mod thread;
pub mod process;
pub mod sched;
pub mod wait;

pub mod ipi;
pub mod idle;
pub mod init;

#[cfg(test)]
pub mod testsup;

pub use crate::status::{KStatus, MAXIMUM_WAIT_OBJECTS};
pub use dispatcher::{DispatcherHeader, DispatcherType, KWaitBlock, WaitType};
pub use event::{EventType, KEvent};
pub use ipl::{ke_get_ipl, ke_lower_ipl, ke_raise_ipl, ke_raise_ipl_if_needed, Ipl};
pub use list::ListEntry;
pub use mutex::KMutex;
pub use prcb::{ke_get_current_prcb, ke_get_processor_count, KPrcb, PendingEvents};
pub use process::{ke_get_current_process, ke_get_system_process, KProcess};
pub use sched::{ke_get_current_thread, ke_set_thread_priority, ke_yield_execution, KScheduler};
pub use semaphore::{KSemaphore, SEMAPHORE_LIMIT_NONE};
pub use spinlock::{KSpinLock, KTicketLock};
pub use thread::{
    ke_create_thread, ke_get_previous_mode, ke_start_thread, ke_terminate_thread, KThread,
    ProcessorMode, ThreadState,
};
pub use timer::{KTimer, TimerType};
pub use wait::{
    ke_delay_execution, ke_wait_for_multiple_objects, ke_wait_for_single_object, TIMEOUT_INFINITE,
};
pub use dpc::{DpcRoutine, KDpc};
pub use apc::{ApcTier, KApc};
pub use ipi::ke_issue_tlb_shootdown;
