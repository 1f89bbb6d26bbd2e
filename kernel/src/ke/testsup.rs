//! Shared test fixture
//!
//! Kernel state is global (PRCB table, pools, dispatcher lock), so tests
//! that touch it serialize behind one mutex and rebuild the world from
//! scratch each time: simulator reset, processor 0 online, system
//! process, the test itself adopted as the boot thread, idle thread
//! ready. Green threads spawned by a test run on real pool stacks
//! through the real context switch, driven entirely by the virtual
//! clock, so scenarios are deterministic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::hal::sim;
use crate::ke::init::{ke_initialize_processor, ki_adopt_boot_thread};
use crate::ke::idle::ki_create_idle_thread;
use crate::ke::process::{ke_get_system_process, ki_initialize_system_process};
use crate::ke::thread::{
    ke_create_thread, ke_start_thread, ki_reset_thread_pool, KThread, StartRoutine,
};

/// Scratch log green threads write to and tests assert on.
pub static LOG: Mutex<Vec<usize>> = Mutex::new(Vec::new());

static KERNEL_TEST_LOCK: Mutex<()> = Mutex::new(());

pub fn reset_log() {
    LOG.lock().unwrap().clear();
}

pub fn collect_log() -> Vec<usize> {
    LOG.lock().unwrap().clone()
}

/// Run `body` against a freshly initialized single-processor kernel.
pub fn kernel_test(body: impl FnOnce()) {
    let _guard = KERNEL_TEST_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    sim::reset();
    sim::set_current_cpu(0);
    crate::mm::page::mm_reset_pool();
    ki_reset_thread_pool();

    unsafe {
        ke_initialize_processor(0, 0, true);
        ki_initialize_system_process();
        ki_adopt_boot_thread();
        assert_eq!(
            ki_create_idle_thread(0),
            crate::status::KStatus::Success
        );
    }

    body();
}

/// Create and start a system thread.
pub fn spawn_thread(routine: StartRoutine, context: *mut u8, priority: u8) -> *mut KThread {
    unsafe {
        let thread = ke_create_thread(ke_get_system_process(), routine, context, priority, u64::MAX)
            .expect("thread pool exhausted");
        ke_start_thread(thread);
        thread
    }
}

/// Handle to simulated secondary processors running on host threads.
pub struct SecondaryCpus {
    stop: Arc<AtomicBool>,
    shootdown_request: Arc<Mutex<Option<(usize, usize, usize)>>>,
    shootdown_done: Arc<AtomicBool>,
}

impl SecondaryCpus {
    /// Ask secondary `cpu` to initiate its own TLB shootdown.
    pub fn initiate_shootdown(&self, cpu: usize, address: usize, pages: usize) {
        self.shootdown_done.store(false, Ordering::SeqCst);
        *self.shootdown_request.lock().unwrap() = Some((cpu, address, pages));
    }

    /// Wait for a previously requested remote shootdown, servicing this
    /// processor's own IPIs meanwhile.
    pub fn wait_remote_shootdown(&self) {
        while !self.shootdown_done.load(Ordering::SeqCst) {
            sim::service_pending_ipis();
            std::thread::yield_now();
        }
    }
}

/// Bring processors `1..total` online as host threads that service
/// their IPI queues, run `body` on processor 0, then take them down.
pub fn with_secondary_cpus(total: usize, body: impl FnOnce(&SecondaryCpus)) {
    assert!(total >= 2);

    unsafe {
        for cpu in 1..total {
            ke_initialize_processor(cpu, cpu as u32, false);
        }
    }

    let stop = Arc::new(AtomicBool::new(false));
    let shootdown_request: Arc<Mutex<Option<(usize, usize, usize)>>> = Arc::new(Mutex::new(None));
    let shootdown_done = Arc::new(AtomicBool::new(true));

    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    for cpu in 1..total {
        let stop = Arc::clone(&stop);
        let shootdown_request = Arc::clone(&shootdown_request);
        let shootdown_done = Arc::clone(&shootdown_done);
        handles.push(std::thread::spawn(move || {
            sim::set_current_cpu(cpu);
            while !stop.load(Ordering::SeqCst) {
                let request = {
                    let mut slot = shootdown_request.lock().unwrap();
                    match *slot {
                        Some((target, address, pages)) if target == cpu => {
                            *slot = None;
                            Some((address, pages))
                        }
                        _ => None,
                    }
                };
                if let Some((address, pages)) = request {
                    unsafe { crate::ke::ipi::ke_issue_tlb_shootdown(address, pages) };
                    shootdown_done.store(true, Ordering::SeqCst);
                }
                sim::service_pending_ipis();
                std::thread::yield_now();
            }
        }));
    }

    let cpus = SecondaryCpus {
        stop: Arc::clone(&stop),
        shootdown_request,
        shootdown_done,
    };
    body(&cpus);

    cpus.stop.store(true, Ordering::SeqCst);
    for handle in handles {
        handle.join().expect("secondary cpu thread panicked");
    }
}
