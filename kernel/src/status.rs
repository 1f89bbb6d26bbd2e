//! Kernel status codes
//!
//! Status codes are returned by value throughout the executive; there are
//! no kernel exceptions. `Success` is the zero sentinel. The two `Range*`
//! variants carry the index of the object that satisfied a multi-object
//! wait.

/// Maximum number of objects a single wait may reference.
pub const MAXIMUM_WAIT_OBJECTS: usize = 64;

/// Kernel status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KStatus {
    /// The operation completed.
    Success,
    /// Caller error reachable from user mode; returned, never fatal.
    InvalidParameter,
    /// The thread is parked on its wait blocks (internal marker; never
    /// returned to a caller).
    Waiting,
    /// An alertable wait was interrupted by a user APC.
    Alerted,
    /// The wait timed out.
    Timeout,
    /// An allocation was refused.
    InsufficientResources,
    /// The mapping already exists; idempotent success.
    NoRemap,
    /// A multi-object wait was satisfied by the object at this index.
    RangeWait(u8),
    /// The wait was satisfied by an abandoned mutex at this index.
    RangeAbandonedWait(u8),
}

impl KStatus {
    /// Whether this status represents a satisfied wait or plain success.
    #[inline]
    pub fn is_success(self) -> bool {
        matches!(
            self,
            KStatus::Success | KStatus::RangeWait(_) | KStatus::RangeAbandonedWait(_)
        )
    }

    /// The satisfying object index, if this is a wait-range status.
    #[inline]
    pub fn wait_index(self) -> Option<u8> {
        match self {
            KStatus::RangeWait(i) | KStatus::RangeAbandonedWait(i) => Some(i),
            _ => None,
        }
    }

    /// Whether the satisfying object was an abandoned mutex.
    #[inline]
    pub fn is_abandoned(self) -> bool {
        matches!(self, KStatus::RangeAbandonedWait(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_classification() {
        assert!(KStatus::Success.is_success());
        assert!(KStatus::RangeWait(3).is_success());
        assert!(KStatus::RangeAbandonedWait(0).is_success());
        assert!(!KStatus::Timeout.is_success());
        assert!(!KStatus::Alerted.is_success());
        assert!(!KStatus::InvalidParameter.is_success());
    }

    #[test]
    fn test_wait_index() {
        assert_eq!(KStatus::RangeWait(5).wait_index(), Some(5));
        assert_eq!(KStatus::RangeAbandonedWait(2).wait_index(), Some(2));
        assert_eq!(KStatus::Timeout.wait_index(), None);
        assert!(KStatus::RangeAbandonedWait(2).is_abandoned());
        assert!(!KStatus::RangeWait(2).is_abandoned());
    }
}
