//! Simulated hardware backend (test builds only)
//!
//! Models the hardware surface the executive consumes: a virtual clock
//! tick counter, per-CPU IPI queues, and a per-CPU log of page
//! invalidations. "Which CPU am I" is a thread-local, so a host thread
//! impersonates one simulated processor for its lifetime.
//!
//! Interrupt delivery points mirror the hardware: the clock "fires" when
//! the idle loop halts (or when a test advances the clock explicitly), and
//! IPIs are delivered inside `spin_wait_hint`, which is exactly where a
//! spinning CPU with a partially raised IPL would take them.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::ke::ipl::Ipl;
use crate::ke::prcb::MAX_PROCESSORS;
use crate::mm::PageMapHandle;

thread_local! {
    static CURRENT_CPU: Cell<usize> = const { Cell::new(0) };
}

static TICK: AtomicU64 = AtomicU64::new(0);

const EMPTY_QUEUE: Mutex<VecDeque<u8>> = Mutex::new(VecDeque::new());
static IPI_QUEUES: [Mutex<VecDeque<u8>>; MAX_PROCESSORS] = [EMPTY_QUEUE; MAX_PROCESSORS];

const EMPTY_LOG: Mutex<Vec<usize>> = Mutex::new(Vec::new());
static INVALIDATION_LOG: [Mutex<Vec<usize>>; MAX_PROCESSORS] = [EMPTY_LOG; MAX_PROCESSORS];

/// Bind the calling host thread to a simulated processor index.
pub fn set_current_cpu(index: usize) {
    assert!(index < MAX_PROCESSORS);
    CURRENT_CPU.with(|c| c.set(index));
}

pub fn current_cpu() -> usize {
    CURRENT_CPU.with(|c| c.get())
}

pub(super) fn set_interrupt_gate(_ipl: Ipl) {
    // The simulator has no asynchronous interrupt sources; masking is
    // implicit in where delivery points are placed.
}

pub(super) fn query_tick_count() -> u64 {
    TICK.load(Ordering::SeqCst)
}

pub(super) unsafe fn send_ipi(targets: u64, vector: u8) {
    let own = current_cpu();
    for cpu in 0..MAX_PROCESSORS {
        if cpu != own && targets & (1 << cpu) != 0 {
            IPI_QUEUES[cpu].lock().unwrap().push_back(vector);
        }
    }
}

pub(super) unsafe fn invalidate_page(address: usize) {
    INVALIDATION_LOG[current_cpu()].lock().unwrap().push(address);
}

pub(super) unsafe fn switch_address_space(_map: PageMapHandle) {}

/// Deliver every IPI queued for the calling CPU.
pub fn service_pending_ipis() {
    let cpu = current_cpu();
    loop {
        let vector = IPI_QUEUES[cpu].lock().unwrap().pop_front();
        match vector {
            Some(v) => unsafe { crate::ke::ipi::ki_dispatch_ipi(v) },
            None => break,
        }
    }
}

pub(super) fn spin_wait_hint() {
    service_pending_ipis();
    std::thread::yield_now();
}

/// Advance the virtual clock, taking a clock interrupt per tick exactly
/// the way the hardware tick fires: at CLOCK level, with the lowering
/// back down delivering whatever the tick made pending.
pub fn advance_clock(ticks: u64) {
    for _ in 0..ticks {
        TICK.fetch_add(1, Ordering::SeqCst);
        unsafe {
            let old = crate::ke::ipl::ke_raise_ipl(Ipl::Clock);
            crate::ke::timer::ke_timer_tick();
            crate::ke::ipl::ke_lower_ipl(old);
        }
    }
}

pub(super) unsafe fn wait_for_interrupt() {
    advance_clock(1);
    service_pending_ipis();
}

/// Pages invalidated on a simulated CPU since the last reset.
pub fn invalidations(cpu: usize) -> Vec<usize> {
    INVALIDATION_LOG[cpu].lock().unwrap().clone()
}

/// Clear all simulator state. Called by the test fixture before each
/// kernel scenario.
pub fn reset() {
    TICK.store(0, Ordering::SeqCst);
    for queue in IPI_QUEUES.iter() {
        queue.lock().unwrap().clear();
    }
    for log in INVALIDATION_LOG.iter() {
        log.lock().unwrap().clear();
    }
}
