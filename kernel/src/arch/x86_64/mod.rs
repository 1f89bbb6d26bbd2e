//! x86_64 processor support
//!
//! The IPL gate maps directly onto the task priority register: CR8 holds
//! values 0..15, and the local APIC masks any interrupt whose priority
//! class is at or below it. That makes `set_interrupt_gate` a single
//! register write.
//!
//! The privileged pieces only compile for bare-metal targets; the context
//! switch (`context`) is plain user-visible ISA and is also exercised by
//! the host test suite.

pub mod context;

#[cfg(target_os = "none")]
mod privileged {
    use crate::ke::ipl::Ipl;
    use crate::ke::prcb::KPrcb;
    use crate::mm::PageMapHandle;
    use core::arch::asm;
    use x86_64::VirtAddr;

    /// xAPIC register block in the direct map.
    const LAPIC_BASE: usize = 0xFEE0_0000;
    const LAPIC_ICR_LOW: usize = 0x300;
    const LAPIC_ICR_HIGH: usize = 0x310;
    const ICR_DELIVERY_PENDING: u32 = 1 << 12;

    const MSR_GS_BASE: u32 = 0xC000_0101;

    /// Clock ticks accumulated by the timer interrupt handler.
    pub static TICK_COUNT: core::sync::atomic::AtomicU64 =
        core::sync::atomic::AtomicU64::new(0);

    /// Point GS at this processor's control block. Bring-up only.
    pub unsafe fn set_processor_control_base(prcb: *mut KPrcb) {
        let value = prcb as u64;
        asm!(
            "wrmsr",
            in("ecx") MSR_GS_BASE,
            in("eax") value as u32,
            in("edx") (value >> 32) as u32,
            options(nostack, preserves_flags),
        );
    }

    /// Index of the executing processor, read from the PRCB that GS
    /// points at. The `id` field is first in `KPrcb`.
    pub unsafe fn current_processor_index() -> usize {
        let id: u32;
        asm!("mov {0:e}, gs:[0]", out(reg) id, options(nostack, preserves_flags));
        id as usize
    }

    pub unsafe fn set_interrupt_gate(ipl: Ipl) {
        asm!("mov cr8, {}", in(reg) ipl as u64, options(nostack, preserves_flags));
    }

    pub unsafe fn invalidate_page(address: usize) {
        x86_64::instructions::tlb::flush(VirtAddr::new(address as u64));
    }

    pub unsafe fn wait_for_interrupt() {
        x86_64::instructions::interrupts::enable_and_hlt();
    }

    pub fn query_tick_count() -> u64 {
        TICK_COUNT.load(core::sync::atomic::Ordering::Relaxed)
    }

    unsafe fn lapic_write(offset: usize, value: u32) {
        core::ptr::write_volatile((LAPIC_BASE + offset) as *mut u32, value);
    }

    unsafe fn lapic_read(offset: usize) -> u32 {
        core::ptr::read_volatile((LAPIC_BASE + offset) as *const u32)
    }

    /// Emit a fixed-delivery IPI to every processor in `targets` other
    /// than the caller.
    pub unsafe fn send_ipi(targets: u64, vector: u8) {
        let own = current_processor_index();
        let count = crate::ke::prcb::ke_get_processor_count();
        for cpu in 0..count {
            if cpu == own || targets & (1 << cpu) == 0 {
                continue;
            }
            let prcb = crate::ke::prcb::ki_get_prcb(cpu);
            while lapic_read(LAPIC_ICR_LOW) & ICR_DELIVERY_PENDING != 0 {
                core::hint::spin_loop();
            }
            lapic_write(LAPIC_ICR_HIGH, (*prcb).hardware_id << 24);
            lapic_write(LAPIC_ICR_LOW, vector as u32);
        }
    }

    pub unsafe fn switch_address_space(map: PageMapHandle) {
        if map != 0 {
            asm!("mov cr3, {}", in(reg) map as u64, options(nostack, preserves_flags));
        }
    }
}

#[cfg(target_os = "none")]
pub use privileged::*;
