//! Hardware abstraction seam (hal)
//!
//! The dispatcher core consumes a small set of hardware services and
//! nothing else below them:
//!
//! - program the per-CPU interrupt gate for an IPL
//! - emit an IPI to a set of processors
//! - invalidate one page of the translation cache
//! - read the clock tick counter
//! - halt until the next interrupt
//!
//! On bare metal these bind to the x86_64 backend (`arch::x86_64`). Under
//! `cfg(test)` they bind to a deterministic simulator with a virtual tick
//! counter and per-CPU IPI queues, which is how the executive's test suite
//! drives multi-CPU protocols on a development host.

use crate::ke::ipl::Ipl;
use crate::mm::PageMapHandle;

#[cfg(test)]
pub mod sim;

/// Clock tick frequency. One tick per millisecond keeps tick arithmetic
/// and millisecond timeouts in the same unit.
pub const TICK_HZ: u64 = 1000;

/// Convert a millisecond interval to clock ticks, rounding up.
#[inline]
pub fn milliseconds_to_ticks(ms: u64) -> u64 {
    ms.saturating_mul(TICK_HZ).div_ceil(1000)
}

/// Index of the processor executing the caller.
#[inline]
pub fn current_processor() -> usize {
    #[cfg(test)]
    {
        sim::current_cpu()
    }
    #[cfg(all(not(test), target_os = "none"))]
    {
        unsafe { crate::arch::x86_64::current_processor_index() }
    }
    #[cfg(all(not(test), not(target_os = "none")))]
    {
        0
    }
}

/// Program the hardware interrupt gate so that interrupts at or below
/// `ipl` are masked.
#[inline]
pub unsafe fn set_interrupt_gate(ipl: Ipl) {
    #[cfg(test)]
    {
        sim::set_interrupt_gate(ipl);
    }
    #[cfg(all(not(test), target_os = "none"))]
    {
        crate::arch::x86_64::set_interrupt_gate(ipl);
    }
    #[cfg(all(not(test), not(target_os = "none")))]
    {
        let _ = ipl;
    }
}

/// Emit an IPI with `vector` to every processor whose bit is set in
/// `targets`. The caller's own bit is ignored.
pub unsafe fn send_ipi(targets: u64, vector: u8) {
    #[cfg(test)]
    {
        sim::send_ipi(targets, vector);
    }
    #[cfg(all(not(test), target_os = "none"))]
    {
        crate::arch::x86_64::send_ipi(targets, vector);
    }
    #[cfg(all(not(test), not(target_os = "none")))]
    {
        let _ = (targets, vector);
    }
}

/// Invalidate the translation cache entry covering `address` on the
/// calling processor.
pub unsafe fn invalidate_page(address: usize) {
    #[cfg(test)]
    {
        sim::invalidate_page(address);
    }
    #[cfg(all(not(test), target_os = "none"))]
    {
        crate::arch::x86_64::invalidate_page(address);
    }
    #[cfg(all(not(test), not(target_os = "none")))]
    {
        let _ = address;
    }
}

/// Current clock tick count.
#[inline]
pub fn query_tick_count() -> u64 {
    #[cfg(test)]
    {
        sim::query_tick_count()
    }
    #[cfg(all(not(test), target_os = "none"))]
    {
        crate::arch::x86_64::query_tick_count()
    }
    #[cfg(all(not(test), not(target_os = "none")))]
    {
        0
    }
}

/// Halt the processor until the next interrupt. The idle loop lives here;
/// under simulation this advances the virtual clock by one tick and
/// services pending simulated interrupts.
pub unsafe fn wait_for_interrupt() {
    #[cfg(test)]
    {
        sim::wait_for_interrupt();
    }
    #[cfg(all(not(test), target_os = "none"))]
    {
        crate::arch::x86_64::wait_for_interrupt();
    }
}

/// Hint issued inside spin loops. Interrupts above the spinning IPL can
/// fire here; the simulator uses this point to deliver pending IPIs.
#[inline]
pub fn spin_wait_hint() {
    #[cfg(test)]
    {
        sim::spin_wait_hint();
    }
    #[cfg(not(test))]
    {
        core::hint::spin_loop();
    }
}

/// Install a process page map. Handle 0 denotes the kernel-only address
/// space and is a no-op.
pub unsafe fn switch_address_space(map: PageMapHandle) {
    #[cfg(test)]
    {
        sim::switch_address_space(map);
    }
    #[cfg(all(not(test), target_os = "none"))]
    {
        crate::arch::x86_64::switch_address_space(map);
    }
    #[cfg(all(not(test), not(target_os = "none")))]
    {
        let _ = map;
    }
}

/// Stop making progress forever. Terminal state of a crashed processor.
pub fn halt_forever() -> ! {
    #[cfg(all(not(test), target_os = "none"))]
    loop {
        unsafe { crate::arch::x86_64::wait_for_interrupt() };
    }
    #[cfg(any(test, not(target_os = "none")))]
    loop {
        core::hint::spin_loop();
    }
}
