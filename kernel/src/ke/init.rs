//! Executive bring-up
//!
//! Phase 0 runs single-threaded on the bootstrap processor: PRCB, system
//! process, adoption of the boot context as the first thread, idle
//! thread. Secondary processors run the same per-processor pieces from
//! their own startup stubs.

use crate::hal;
use crate::ke::idle::ki_create_idle_thread;
use crate::ke::prcb::{ke_get_current_prcb, ki_get_prcb, ki_set_processor_count, KPrcb};
use crate::ke::process::{ke_get_system_process, ki_initialize_system_process};
use crate::ke::sched::{PRIORITY_NORMAL, QUANTUM_TICKS};
use crate::ke::thread::{ke_allocate_thread, KThread, ThreadState};
use crate::ke::timer::ki_expire_timers;
use crate::status::KStatus;

/// Reset and initialize processor `index`'s PRCB. `bootstrap` restarts
/// the online count at one.
pub unsafe fn ke_initialize_processor(index: usize, hardware_id: u32, bootstrap: bool) {
    let prcb = ki_get_prcb(index);
    prcb.write(KPrcb::new());
    (*prcb).id = index as u32;
    (*prcb).hardware_id = hardware_id;
    (*prcb).bootstrap = bootstrap;
    (*prcb).dpc_queue.init_head();
    (*prcb).sched.init();
    (*prcb).clock_dpc.init(ki_expire_timers, index);

    if bootstrap {
        ki_set_processor_count(1);
    } else if index + 1 > crate::ke::prcb::ke_get_processor_count() {
        ki_set_processor_count(index + 1);
    }

    #[cfg(all(not(test), target_os = "none"))]
    crate::arch::x86_64::set_processor_control_base(prcb);

    log::debug!("processor {} online (hardware id {})", index, hardware_id);
}

/// Bind the currently executing context to a thread object so the
/// scheduler can switch away from it. The boot stack becomes this
/// thread's stack; it owns no pool pages.
pub unsafe fn ki_adopt_boot_thread() -> *mut KThread {
    let thread = ke_allocate_thread();
    debug_assert!(!thread.is_null());

    let t = &mut *thread;
    t.header.init(
        crate::ke::dispatcher::DispatcherType::Thread,
        0,
    );
    t.state = ThreadState::Running;
    t.priority = PRIORITY_NORMAL;
    t.affinity = u64::MAX;
    t.process = ke_get_system_process();
    for queue in t.apc_queue.iter_mut() {
        queue.init_head();
    }
    t.owned_mutexes.init_head();
    t.timeout_timer.init(crate::ke::timer::TimerType::Notification);

    let prcb = ke_get_current_prcb();
    t.last_cpu = prcb.id;
    t.home_cpu = prcb.id;
    t.quantum_until = hal::query_tick_count() + QUANTUM_TICKS;

    (*ke_get_system_process())
        .thread_list
        .insert_tail(&mut t.process_link);
    prcb.sched
        .thread_list
        .insert_tail(&mut t.thread_list_entry);
    prcb.sched.current_thread = thread;
    prcb.sched.quantum_until = t.quantum_until;

    thread
}

/// Phase-0 bring-up of the bootstrap processor.
pub unsafe fn ke_system_startup(hardware_id: u32) -> KStatus {
    ke_initialize_processor(0, hardware_id, true);
    ki_initialize_system_process();
    ki_adopt_boot_thread();
    let status = ki_create_idle_thread(0);
    if status != KStatus::Success {
        return status;
    }
    log::info!("kernel executive initialized");
    KStatus::Success
}
