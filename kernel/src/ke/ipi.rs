//! Inter-processor interrupts: reschedule requests and TLB shootdown
//!
//! The shootdown protocol, in full:
//!
//! 1. The initiator serializes against other initiators on a global
//!    lock, then invalidates the range locally.
//! 2. It takes every other processor's TLB guard in id order and writes
//!    the (address, page count) staging fields.
//! 3. It broadcasts the shootdown vector. Each recipient invalidates
//!    the staged range and releases its own guard, a guard the
//!    initiator locked. That release is the completion signal.
//! 4. The initiator re-takes and releases each guard as a barrier, so
//!    returning from the issue means every processor has invalidated.
//!
//! Recipients run the handler at the shootdown interrupt level, above
//! DPC, so an initiator spinning in step 4 still services incoming
//! shootdowns from a competing initiator; the two serialize on the
//! global lock without deadlock.

use crate::hal;
use crate::ke::ipl::ke_get_ipl;
use crate::ke::prcb::{
    ke_get_current_prcb, ke_get_processor_count, ke_online_processor_mask, ki_get_prcb,
    PendingEvents,
};
use crate::ke::spinlock::KSpinLock;
use crate::mm::PAGE_SIZE;

/// Provokes a reschedule pass on the target processor.
pub const IPI_VECTOR_RESCHEDULE: u8 = 0xFD;

/// TLB shootdown request.
pub const IPI_VECTOR_TLB_SHOOTDOWN: u8 = 0xFE;

/// Serializes shootdown initiators machine-wide.
static KI_TLBS_INITIATOR_LOCK: KSpinLock = KSpinLock::new();

/// Invalidate `page_count` pages starting at `address` on every online
/// processor. Returns once all processors have done so.
pub unsafe fn ke_issue_tlb_shootdown(address: usize, page_count: usize) {
    let old_ipl = KI_TLBS_INITIATOR_LOCK.acquire();

    for page in 0..page_count {
        hal::invalidate_page(address + page * PAGE_SIZE);
    }

    let count = ke_get_processor_count();
    if count > 1 {
        let own = hal::current_processor();

        // Stage the range under every other processor's guard, id order.
        for cpu in 0..count {
            if cpu == own {
                continue;
            }
            let prcb = ki_get_prcb(cpu);
            (*prcb).tlbs_lock.acquire_raw();
            (*prcb).tlbs_address = address;
            (*prcb).tlbs_page_count = page_count;
        }

        hal::send_ipi(ke_online_processor_mask(), IPI_VECTOR_TLB_SHOOTDOWN);

        // Barrier: each guard can only be re-taken after its recipient
        // released it in the handler.
        for cpu in 0..count {
            if cpu == own {
                continue;
            }
            let prcb = ki_get_prcb(cpu);
            (*prcb).tlbs_lock.acquire_raw();
            (*prcb).tlbs_lock.release_raw();
        }
    }

    KI_TLBS_INITIATOR_LOCK.release(old_ipl);
}

/// Shootdown recipient: invalidate the staged range and signal
/// completion by releasing this processor's guard.
pub unsafe fn ki_handle_tlb_shootdown_ipi() {
    let prcb = ke_get_current_prcb();
    let address = prcb.tlbs_address;
    let pages = prcb.tlbs_page_count;
    for page in 0..pages {
        hal::invalidate_page(address + page * PAGE_SIZE);
    }
    prcb.tlbs_lock.release_raw();
}

/// Reschedule recipient: note the yield; the next drop below DPC on
/// this processor re-runs the scheduler.
pub unsafe fn ki_handle_reschedule_ipi() {
    ke_get_current_prcb().set_pending(PendingEvents::YIELD);
}

/// Vector dispatch for the interrupt layer (and the simulator).
pub unsafe fn ki_dispatch_ipi(vector: u8) {
    match vector {
        IPI_VECTOR_TLB_SHOOTDOWN => ki_handle_tlb_shootdown_ipi(),
        IPI_VECTOR_RESCHEDULE => ki_handle_reschedule_ipi(),
        _ => log::warn!("spurious IPI vector {:#x} at {:?}", vector, ke_get_ipl()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim;
    use crate::ke::testsup::{kernel_test, with_secondary_cpus};

    #[test]
    fn test_shootdown_reaches_every_cpu() {
        kernel_test(|| unsafe {
            with_secondary_cpus(4, |_| {
                ke_issue_tlb_shootdown(0x4000_0000, 4);
            });

            for cpu in 0..4 {
                let seen = sim::invalidations(cpu);
                let expected: Vec<usize> = (0..4).map(|p| 0x4000_0000 + p * PAGE_SIZE).collect();
                assert_eq!(seen, expected, "cpu {} invalidations", cpu);
            }
        });
    }

    #[test]
    fn test_concurrent_shootdowns_serialize() {
        kernel_test(|| unsafe {
            with_secondary_cpus(4, |secondaries| {
                // CPU 1 initiates concurrently with CPU 0.
                secondaries.initiate_shootdown(1, 0x5000_0000, 2);
                ke_issue_tlb_shootdown(0x6000_0000, 2);
                secondaries.wait_remote_shootdown();
            });

            // Every CPU saw both ranges, each exactly once.
            for cpu in 0..4 {
                let mut seen = sim::invalidations(cpu);
                seen.sort();
                let mut expected = vec![
                    0x5000_0000usize,
                    0x5000_0000 + PAGE_SIZE,
                    0x6000_0000,
                    0x6000_0000 + PAGE_SIZE,
                ];
                expected.sort();
                assert_eq!(seen, expected, "cpu {} invalidations", cpu);
            }
        });
    }
}
