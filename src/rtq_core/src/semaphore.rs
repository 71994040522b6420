//! Semaphores
//!
//! A semaphore is a queue of zero-sized items whose count is the semaphore
//! value and whose capacity is the maximum value.
use core::fmt;

use crate::{
    error::{ReceiveError, SendError},
    klock,
    queue::{Queue, QueueKind},
    Port, UTicks,
};

/// A handle to a counting or binary semaphore.
pub struct Semaphore<Traits: Port>(Queue<Traits>);

impl<Traits: Port> Clone for Semaphore<Traits> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: Port> Copy for Semaphore<Traits> {}

impl<Traits: Port> PartialEq for Semaphore<Traits> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<Traits: Port> Eq for Semaphore<Traits> {}

impl<Traits: Port> fmt::Debug for Semaphore<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Semaphore")
            .field(&(self.0.cb as *const _))
            .finish()
    }
}

impl<Traits: Port> From<Semaphore<Traits>> for Queue<Traits> {
    #[inline]
    fn from(x: Semaphore<Traits>) -> Self {
        x.0
    }
}

impl<Traits: Port> Semaphore<Traits> {
    /// Create a counting semaphore with the maximum value `max_count` and the
    /// initial value `initial_count`.
    ///
    /// Panics if `max_count` is zero or `initial_count` exceeds it.
    pub fn new_counting(max_count: usize, initial_count: usize) -> Self {
        assert_ne!(max_count, 0, "a semaphore's maximum count must be non-zero");
        assert!(
            initial_count <= max_count,
            "the initial count {initial_count} exceeds the maximum count {max_count}"
        );

        let queue = Queue::with_kind(QueueKind::CountingSemaphore, max_count, 0);
        {
            let _lock = klock::enter_critical::<Traits>();
            queue.cb.set_count(initial_count);
        }
        Self(queue)
    }

    /// Create a binary semaphore, initially available if
    /// `initially_available` is `true`.
    pub fn new_binary(initially_available: bool) -> Self {
        let queue = Queue::with_kind(QueueKind::BinarySemaphore, 1, 0);
        if initially_available {
            let _lock = klock::enter_critical::<Traits>();
            queue.cb.set_count(1);
        }
        Self(queue)
    }

    /// Get the underlying queue.
    #[inline]
    pub fn as_queue(self) -> Queue<Traits> {
        self.0
    }

    /// Increment the value. Fails with `Full` if it's already at the maximum.
    #[inline]
    pub fn give(self) -> Result<(), SendError> {
        self.0.send_to_back(&[], 0)
    }

    /// Decrement the value, waiting for up to `ticks_to_wait` ticks for it
    /// to become non-zero.
    #[inline]
    pub fn take(self, ticks_to_wait: UTicks) -> Result<(), ReceiveError> {
        self.0.receive(&mut [], ticks_to_wait)
    }

    /// [`Self::give`] for interrupt handlers. Returns `true` if a
    /// higher-priority task was woken up.
    #[inline]
    pub fn give_from_isr(self) -> Result<bool, SendError> {
        self.0.send_from_isr(&[], crate::SendPosition::Back)
    }

    /// [`Self::take`] for interrupt handlers without waiting. Returns `true`
    /// if a higher-priority task was woken up.
    #[inline]
    pub fn take_from_isr(self) -> Result<bool, ReceiveError> {
        self.0.receive_from_isr(&mut [])
    }

    /// Get the current value.
    #[inline]
    pub fn count(self) -> usize {
        self.0.messages_waiting()
    }

    /// Destroy the semaphore.
    ///
    /// # Safety
    ///
    /// See [`Queue::delete`].
    pub unsafe fn delete(self) {
        // Safety: Upheld by the caller
        unsafe { self.0.delete() }
    }
}
