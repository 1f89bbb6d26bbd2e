//! Thread context switching for x86_64
//!
//! The switch saves the callee-saved register set and RFLAGS on the
//! outgoing thread's stack, parks the resulting stack pointer in a slot
//! the scheduler owns, and resumes the incoming thread by restoring its
//! parked stack pointer. Everything else a thread holds lives on its
//! stack already, so the saved state is exactly seven registers plus the
//! return address the `call` pushed.

use core::arch::naked_asm;

/// Swap stacks: park the current stack pointer in `*old_stack_slot` and
/// continue on `new_stack`. Returns when some other switch parks back
/// onto the old stack.
///
/// # Safety
/// - `old_stack_slot` must stay valid until the outgoing thread resumes.
/// - `new_stack` must hold a frame built by this function or by
///   `ki_prepare_initial_stack`.
/// - The caller must be at DPC level holding its scheduler lock; the
///   resumed side inherits and releases that lock.
#[unsafe(naked)]
pub unsafe extern "C" fn ki_switch_stacks(_old_stack_slot: *mut *mut u8, _new_stack: *mut u8) {
    naked_asm!(
        "push rbx",
        "push rbp",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "pushfq",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "popfq",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbp",
        "pop rbx",
        "ret",
    )
}

/// Build the initial stack frame for a thread that has never run, so the
/// first `ki_switch_stacks` into it "returns" into `entry`. Returns the
/// stack pointer to park in the thread.
///
/// # Safety
/// `stack_top` must be the highest address of a writable stack at least
/// one page deep.
pub unsafe fn ki_prepare_initial_stack(stack_top: *mut u8, entry: extern "C" fn() -> !) -> *mut u8 {
    // Keep the entry frame aligned the way a `call` would have left it:
    // RSP % 16 == 8 when control reaches the entry point.
    let mut sp = ((stack_top as usize) & !0xF) - 8;

    // Return address.
    sp -= 8;
    *(sp as *mut u64) = entry as usize as u64;

    // rbx, rbp, r12, r13, r14, r15, all zero for a fresh thread.
    for _ in 0..6 {
        sp -= 8;
        *(sp as *mut u64) = 0;
    }

    // RFLAGS: reserved bit 1 set, interrupts enabled.
    sp -= 8;
    *(sp as *mut u64) = 0x202;

    sp as *mut u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_stack_layout() {
        extern "C" fn never_runs() -> ! {
            unreachable!()
        }

        let mut stack = vec![0u8; 4096];
        let top = unsafe { stack.as_mut_ptr().add(4096) };
        let sp = unsafe { ki_prepare_initial_stack(top, never_runs) };

        // Seven saved slots plus the return address below the alignment
        // padding.
        let aligned_top = ((top as usize) & !0xF) - 8;
        assert_eq!(aligned_top - sp as usize, 8 * 8);
        unsafe {
            let words = sp as *const u64;
            assert_eq!(*words, 0x202); // rflags popped first
            assert_eq!(*words.add(7), never_runs as usize as u64);
        }
    }
}
