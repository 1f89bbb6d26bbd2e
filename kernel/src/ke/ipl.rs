//! Interrupt Priority Level machine
//!
//! Each processor runs at one of sixteen IPLs. The current IPL gates
//! hardware interrupt delivery (anything at or below it stays masked) and
//! selects which software workloads may run:
//!
//! - dropping strictly below `Dpc` drains the processor's DPC queue and
//!   handles a pending quantum-end yield
//! - dropping below `Apc` delivers the running thread's deliverable APCs
//!
//! Raising is cheap and must nest: `Raise(a); ...; Lower(a)` restores the
//! caller's level exactly. Raising to a lower level than the current one
//! is a fatal bug, as is lowering to a higher one.

use crate::crash;
use crate::hal;
use crate::ke::prcb::{ke_get_current_prcb, PendingEvents};

/// Interrupt priority level, in ascending mask order.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Ipl {
    /// Ordinary thread execution.
    Normal = 0,
    /// Asynchronous procedure call delivery. Page faults are serviceable
    /// only at or below this level.
    Apc = 3,
    /// Deferred procedure calls and the scheduler.
    Dpc = 4,
    Device0 = 5,
    Device1 = 6,
    Device2 = 7,
    Device3 = 8,
    Device4 = 9,
    Device5 = 10,
    Device6 = 11,
    Device7 = 12,
    Device8 = 13,
    /// The clock tick.
    Clock = 14,
    /// Interrupts fully disabled; this level only.
    NoInterrupts = 15,
}

/// Read the current processor's IPL.
#[inline]
pub fn ke_get_ipl() -> Ipl {
    unsafe { ke_get_current_prcb().ipl }
}

/// Raise the current processor's IPL to `new` and return the old level.
/// `new` below the current level is a fatal bug.
pub unsafe fn ke_raise_ipl(new: Ipl) -> Ipl {
    let prcb = ke_get_current_prcb();
    let old = prcb.ipl;
    if new < old {
        crash!("IPL raise to {:?} from higher level {:?}", new, old);
    }
    if new != old {
        hal::set_interrupt_gate(new);
        prcb.ipl = new;
    }
    old
}

/// Raise to `new` unless already at or above it. Always returns the old
/// level, which is what `ke_lower_ipl` wants back.
pub unsafe fn ke_raise_ipl_if_needed(new: Ipl) -> Ipl {
    let old = ke_get_ipl();
    if old >= new {
        old
    } else {
        ke_raise_ipl(new)
    }
}

/// Lower the current processor's IPL to `new`, delivering any software
/// work that the drop exposes. `new` above the current level is a fatal
/// bug. Returns the level before the call.
pub unsafe fn ke_lower_ipl(new: Ipl) -> Ipl {
    let prcb = ke_get_current_prcb();
    let old = prcb.ipl;
    if new > old {
        crash!("IPL lower to {:?} from lower level {:?}", new, old);
    }
    prcb.ipl = new;
    hal::set_interrupt_gate(new);
    if new < Ipl::Dpc {
        ki_dispatch_software_interrupts(new);
    }
    old
}

/// Deliver pending DPC-level and APC-level work after the IPL dropped to
/// `target` (< DPC). Each delivery runs at its own level with the PRCB
/// IPL adjusted in place; using the public raise/lower here would recurse.
unsafe fn ki_dispatch_software_interrupts(target: Ipl) {
    loop {
        let prcb = ke_get_current_prcb();
        let pending = prcb.pending_events();

        if pending.contains(PendingEvents::DPCS) {
            prcb.ipl = Ipl::Dpc;
            hal::set_interrupt_gate(Ipl::Dpc);
            crate::ke::dpc::ki_retire_dpcs();
            let prcb = ke_get_current_prcb();
            prcb.ipl = target;
            hal::set_interrupt_gate(target);
            continue;
        }

        if pending.contains(PendingEvents::YIELD) {
            prcb.clear_pending(PendingEvents::YIELD);
            prcb.ipl = Ipl::Dpc;
            hal::set_interrupt_gate(Ipl::Dpc);
            crate::ke::sched::ki_end_thread_quantum();
            // The thread may have resumed on a different processor.
            let prcb = ke_get_current_prcb();
            prcb.ipl = target;
            hal::set_interrupt_gate(target);
            continue;
        }

        // DPC-level work is drained; now APC-level work, which may in
        // turn make more DPC-level work pending, so loop again after.
        if target < Ipl::Apc {
            let prcb = ke_get_current_prcb();
            let thread = prcb.sched.current_thread;
            if !thread.is_null() && crate::ke::apc::ki_apcs_deliverable(thread) {
                prcb.ipl = Ipl::Apc;
                hal::set_interrupt_gate(Ipl::Apc);
                crate::ke::apc::ki_deliver_apcs();
                let prcb = ke_get_current_prcb();
                prcb.ipl = target;
                hal::set_interrupt_gate(target);
                continue;
            }
        }

        break;
    }
}
