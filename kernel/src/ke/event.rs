//! Event objects
//!
//! Two flavors share one implementation: a notification (manual-reset)
//! event stays signalled and wakes every waiter; a synchronization
//! (auto-reset) event wakes exactly one waiter and rearms itself. The
//! flavor is the dispatcher type tag, so the wait engine needs no extra
//! state to pick the wake rule.

use crate::ke::dispatcher::{DispatcherHeader, DispatcherType, KI_DISPATCHER_LOCK};
use crate::ke::wait::ki_signal_object;

/// Event flavor, fixed at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Notification,
    Synchronization,
}

impl EventType {
    const fn dispatcher_type(self) -> DispatcherType {
        match self {
            EventType::Notification => DispatcherType::EventNotification,
            EventType::Synchronization => DispatcherType::EventSynchronization,
        }
    }
}

/// Kernel event.
#[repr(C)]
pub struct KEvent {
    pub header: DispatcherHeader,
}

unsafe impl Sync for KEvent {}
unsafe impl Send for KEvent {}

impl KEvent {
    pub const fn new(event_type: EventType) -> Self {
        Self {
            header: DispatcherHeader::new(event_type.dispatcher_type()),
        }
    }

    /// Initialize with a flavor and initial signal state.
    pub fn init(&mut self, event_type: EventType, signaled: bool) {
        self.header
            .init(event_type.dispatcher_type(), if signaled { 1 } else { 0 });
    }

    /// Signal the event, waking waiters per the flavor. Returns the
    /// previous signal state. `boost` is applied to woken threads.
    pub unsafe fn set(&self, boost: u8) -> i32 {
        let old_ipl = KI_DISPATCHER_LOCK.acquire();
        let previous = self.header.signal_state();
        self.header.set_signal_state(1);
        ki_signal_object(&self.header as *const _ as *mut DispatcherHeader, boost);
        KI_DISPATCHER_LOCK.release(old_ipl);
        previous
    }

    /// Clear the signal state. Returns the previous state.
    pub unsafe fn reset(&self) -> i32 {
        let old_ipl = KI_DISPATCHER_LOCK.acquire();
        let previous = self.header.signal_state();
        self.header.set_signal_state(0);
        KI_DISPATCHER_LOCK.release(old_ipl);
        previous
    }

    /// Signal, wake per the flavor, then leave the event unsignalled
    /// regardless of flavor. Returns the previous state.
    pub unsafe fn pulse(&self, boost: u8) -> i32 {
        let old_ipl = KI_DISPATCHER_LOCK.acquire();
        let previous = self.header.signal_state();
        self.header.set_signal_state(1);
        ki_signal_object(&self.header as *const _ as *mut DispatcherHeader, boost);
        self.header.set_signal_state(0);
        KI_DISPATCHER_LOCK.release(old_ipl);
        previous
    }

    /// Current signal state without consuming it.
    #[inline]
    pub fn read_state(&self) -> i32 {
        self.header.signal_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ke::testsup::kernel_test;

    #[test]
    fn test_set_reset_pulse_states() {
        kernel_test(|| unsafe {
            let mut event = KEvent::new(EventType::Notification);
            event.init(EventType::Notification, false);
            assert_eq!(event.read_state(), 0);

            assert_eq!(event.set(0), 0);
            assert_eq!(event.read_state(), 1);
            // Setting an already-set event reports the old state.
            assert_eq!(event.set(0), 1);

            assert_eq!(event.reset(), 1);
            assert_eq!(event.read_state(), 0);

            // Pulse with no waiters leaves the event unsignalled.
            assert_eq!(event.pulse(0), 0);
            assert_eq!(event.read_state(), 0);
        });
    }

    #[test]
    fn test_initially_signaled() {
        kernel_test(|| unsafe {
            let mut event = KEvent::new(EventType::Synchronization);
            event.init(EventType::Synchronization, true);
            assert_eq!(event.read_state(), 1);
            assert_eq!(event.reset(), 1);
        });
    }
}
