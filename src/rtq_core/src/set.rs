//! Queue sets
//!
//! A queue set lets a task wait on several queues at once. Every item that
//! arrives at a member queue posts that member's handle to the set, so
//! receiving from the set tells which member to receive from next.
use core::{fmt, mem};

use crate::{
    error::{AddToSetError, RemoveFromSetError},
    klock,
    queue::{self, Queue, QueueKind},
    Port, UTicks,
};

/// A handle to a queue set.
///
/// <center>
///
#[doc = svgbobdoc::transform!(
/// ```svgbob
///            send                      relay
///   task ----------> member queue A ---------+
///                                            |      select
///   ISR  ----------> member queue B ---------+---> queue set -----> task
///        send_from_isr                relay  |
///                                            |
///   task ----------> member semaphore -------+
///            give
/// ```
)]
///
/// </center>
///
/// The capacity of the set must cover the combined capacity of its members.
/// A member must be empty when it's added to or removed from a set.
pub struct QueueSet<Traits: Port>(Queue<Traits>);

impl<Traits: Port> Clone for QueueSet<Traits> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: Port> Copy for QueueSet<Traits> {}

impl<Traits: Port> PartialEq for QueueSet<Traits> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<Traits: Port> Eq for QueueSet<Traits> {}

impl<Traits: Port> fmt::Debug for QueueSet<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("QueueSet")
            .field(&(self.0.cb as *const _))
            .finish()
    }
}

impl<Traits: Port> From<QueueSet<Traits>> for Queue<Traits> {
    #[inline]
    fn from(x: QueueSet<Traits>) -> Self {
        x.0
    }
}

impl<Traits: Port> QueueSet<Traits> {
    /// Create an empty queue set that can hold `capacity` notifications.
    pub fn new(capacity: usize) -> Self {
        Self(Queue::with_kind(
            QueueKind::Set,
            capacity,
            mem::size_of::<usize>(),
        ))
    }

    /// Get the underlying queue.
    #[inline]
    pub fn as_queue(self) -> Queue<Traits> {
        self.0
    }

    /// Add a queue or semaphore to the set.
    ///
    /// Fails with `AlreadyMember` if it already belongs to a set. Panics if
    /// it isn't empty.
    pub fn add(self, member: impl Into<Queue<Traits>>) -> Result<(), AddToSetError> {
        let member = member.into();
        assert!(member != self.0, "a queue set can't contain itself");

        let mut lock = klock::enter_critical::<Traits>();
        let st = member.cb.st.write(&mut *lock);
        if st.set_container.is_some() {
            return Err(AddToSetError::AlreadyMember);
        }
        assert_eq!(
            member.cb.count(),
            0,
            "a queue must be empty when it's added to a queue set"
        );
        st.set_container = Some(self.0.cb);

        log::trace!(
            "add {:?} #{} to set #{}",
            member.kind(),
            member.trace_number(),
            self.0.trace_number()
        );
        Ok(())
    }

    /// Remove a queue or semaphore from the set.
    ///
    /// Fails with `NotMember` if it doesn't belong to this set, or with
    /// `NotEmpty` if it still holds items.
    pub fn remove(self, member: impl Into<Queue<Traits>>) -> Result<(), RemoveFromSetError> {
        let member = member.into();

        let mut lock = klock::enter_critical::<Traits>();
        let st = member.cb.st.write(&mut *lock);
        if !matches!(st.set_container, Some(set) if core::ptr::eq(set, self.0.cb)) {
            return Err(RemoveFromSetError::NotMember);
        }
        if member.cb.count() != 0 {
            return Err(RemoveFromSetError::NotEmpty);
        }
        st.set_container = None;

        log::trace!(
            "remove {:?} #{} from set #{}",
            member.kind(),
            member.trace_number(),
            self.0.trace_number()
        );
        Ok(())
    }

    /// Wait for up to `ticks_to_wait` ticks for a member to receive an item,
    /// and return that member. Returns `None` on timeout.
    ///
    /// The item is still in the member. The caller is expected to receive
    /// it from there.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn select(self, ticks_to_wait: UTicks) -> Option<Queue<Traits>> {
        let mut item = [0u8; mem::size_of::<usize>()];
        self.0.receive(&mut item, ticks_to_wait).ok()?;
        Some(Self::decode(item))
    }

    /// [`Self::select`] for interrupt handlers without waiting.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn select_from_isr(self) -> Option<Queue<Traits>> {
        let mut item = [0u8; mem::size_of::<usize>()];
        self.0.receive_from_isr(&mut item).ok()?;
        Some(Self::decode(item))
    }

    fn decode(item: [u8; mem::size_of::<usize>()]) -> Queue<Traits> {
        Queue {
            // Safety: Only `queue::notify_set_container` posts to a set, and
            //         a member can't be deleted while it belongs to a set
            cb: unsafe { queue::member_from_set_item(item) },
        }
    }

    /// Destroy the queue set.
    ///
    /// # Safety
    ///
    /// See [`Queue::delete`]. In addition, the set must have no members.
    pub unsafe fn delete(self) {
        // Safety: Upheld by the caller
        unsafe { self.0.delete() }
    }
}
