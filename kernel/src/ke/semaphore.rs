//! Semaphore objects
//!
//! The signal state is the available count; a satisfied wait consumes
//! one. A release may add more than one unit but may not push the count
//! past the limit fixed at initialization; the attempt is refused with
//! the state untouched.

use core::cell::UnsafeCell;

use crate::ke::dispatcher::{DispatcherHeader, DispatcherType, KI_DISPATCHER_LOCK};
use crate::ke::wait::ki_signal_object;
use crate::status::KStatus;

/// No practical ceiling.
pub const SEMAPHORE_LIMIT_NONE: i32 = 0x7FFF_FFFE;

/// Counted semaphore.
#[repr(C)]
pub struct KSemaphore {
    pub header: DispatcherHeader,
    limit: UnsafeCell<i32>,
}

unsafe impl Sync for KSemaphore {}
unsafe impl Send for KSemaphore {}

impl KSemaphore {
    pub const fn new() -> Self {
        Self {
            header: DispatcherHeader::new(DispatcherType::Semaphore),
            limit: UnsafeCell::new(SEMAPHORE_LIMIT_NONE),
        }
    }

    pub fn init(&mut self, count: i32, limit: i32) {
        debug_assert!(count >= 0 && count <= limit);
        self.header.init(DispatcherType::Semaphore, count);
        unsafe {
            *self.limit.get() = limit;
        }
    }

    /// Current count without consuming. Zero means unsignalled.
    #[inline]
    pub fn read_state(&self) -> i32 {
        self.header.signal_state()
    }

    /// Add `adjustment` units and wake as many waiters as the new count
    /// covers. Fails without side effects if the adjustment is not
    /// positive or would exceed the limit.
    pub unsafe fn release(&self, adjustment: i32, boost: u8) -> KStatus {
        if adjustment <= 0 {
            return KStatus::InvalidParameter;
        }

        let old_ipl = KI_DISPATCHER_LOCK.acquire();
        let count = self.header.signal_state();
        if count > *self.limit.get() - adjustment {
            KI_DISPATCHER_LOCK.release(old_ipl);
            return KStatus::InvalidParameter;
        }

        self.header.set_signal_state(count + adjustment);
        ki_signal_object(&self.header as *const _ as *mut DispatcherHeader, boost);
        KI_DISPATCHER_LOCK.release(old_ipl);
        KStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ke::testsup::kernel_test;

    #[test]
    fn test_release_accumulates() {
        kernel_test(|| unsafe {
            let mut sem = KSemaphore::new();
            sem.init(0, 10);
            assert_eq!(sem.read_state(), 0);

            assert_eq!(sem.release(1, 0), KStatus::Success);
            assert_eq!(sem.release(3, 0), KStatus::Success);
            assert_eq!(sem.read_state(), 4);
        });
    }

    #[test]
    fn test_limit_is_enforced() {
        kernel_test(|| unsafe {
            let mut sem = KSemaphore::new();
            sem.init(2, 3);

            assert_eq!(sem.release(2, 0), KStatus::InvalidParameter);
            // The refused release left the count alone.
            assert_eq!(sem.read_state(), 2);
            assert_eq!(sem.release(1, 0), KStatus::Success);
            assert_eq!(sem.read_state(), 3);

            assert_eq!(sem.release(0, 0), KStatus::InvalidParameter);
            assert_eq!(sem.release(-1, 0), KStatus::InvalidParameter);
        });
    }
}
