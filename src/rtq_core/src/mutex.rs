//! Mutexes
//!
//! A mutex is a queue of capacity one without item storage. Taking it
//! receives the only "item" and records the receiver as the holder; giving it
//! sends the item back. A task blocked on a mutex lends its priority to the
//! holder until the mutex is given.
use core::fmt;

use crate::{
    error::{GiveMutexError, ReceiveError},
    klock,
    queue::{Payload, Queue, QueueKind},
    Port, UTicks,
};

/// A handle to a mutex.
pub struct Mutex<Traits: Port>(Queue<Traits>);

impl<Traits: Port> Clone for Mutex<Traits> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: Port> Copy for Mutex<Traits> {}

impl<Traits: Port> PartialEq for Mutex<Traits> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<Traits: Port> Eq for Mutex<Traits> {}

impl<Traits: Port> fmt::Debug for Mutex<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Mutex").field(&(self.0.cb as *const _)).finish()
    }
}

impl<Traits: Port> From<Mutex<Traits>> for Queue<Traits> {
    #[inline]
    fn from(x: Mutex<Traits>) -> Self {
        x.0
    }
}

impl<Traits: Port> Mutex<Traits> {
    /// Create an available mutex.
    pub fn new() -> Self {
        Self(Queue::with_kind(QueueKind::Mutex, 1, 0))
    }

    /// Get the underlying queue.
    #[inline]
    pub fn as_queue(self) -> Queue<Traits> {
        self.0
    }

    /// Take the mutex, waiting for up to `ticks_to_wait` ticks for the
    /// current holder to give it.
    ///
    /// Taking a mutex the current task already holds deadlocks. Use
    /// [`RecursiveMutex`] if that's needed.
    #[inline]
    pub fn take(self, ticks_to_wait: UTicks) -> Result<(), ReceiveError> {
        self.0.receive(&mut [], ticks_to_wait)
    }

    /// Give the mutex. Fails with `NotOwner` unless the current task holds
    /// it.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn give(self) -> Result<(), GiveMutexError> {
        if self.holder() != Some(Traits::current_task()) {
            return Err(GiveMutexError::NotOwner);
        }

        // A held mutex is empty, so this can't fail
        let result = self.0.send_to_back(&[], 0);
        debug_assert!(result.is_ok());
        Ok(())
    }

    /// Get the task holding the mutex.
    #[inline]
    pub fn holder(self) -> Option<Traits::TaskId> {
        self.0.mutex_holder()
    }

    /// Destroy the mutex.
    ///
    /// # Safety
    ///
    /// See [`Queue::delete`].
    pub unsafe fn delete(self) {
        // Safety: Upheld by the caller
        unsafe { self.0.delete() }
    }
}

impl<Traits: Port> Default for Mutex<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle to a mutex that its holder can take again.
///
/// The mutex is released when it has been given as many times as it was
/// taken.
#[cfg(feature = "recursive_mutex")]
pub struct RecursiveMutex<Traits: Port>(Queue<Traits>);

#[cfg(feature = "recursive_mutex")]
impl<Traits: Port> Clone for RecursiveMutex<Traits> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

#[cfg(feature = "recursive_mutex")]
impl<Traits: Port> Copy for RecursiveMutex<Traits> {}

#[cfg(feature = "recursive_mutex")]
impl<Traits: Port> fmt::Debug for RecursiveMutex<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("RecursiveMutex")
            .field(&(self.0.cb as *const _))
            .finish()
    }
}

#[cfg(feature = "recursive_mutex")]
impl<Traits: Port> From<RecursiveMutex<Traits>> for Queue<Traits> {
    #[inline]
    fn from(x: RecursiveMutex<Traits>) -> Self {
        x.0
    }
}

#[cfg(feature = "recursive_mutex")]
impl<Traits: Port> RecursiveMutex<Traits> {
    /// Create an available recursive mutex.
    pub fn new() -> Self {
        Self(Queue::with_kind(QueueKind::RecursiveMutex, 1, 0))
    }

    /// Get the underlying queue.
    #[inline]
    pub fn as_queue(self) -> Queue<Traits> {
        self.0
    }

    /// Take the mutex. If the current task already holds it, this succeeds
    /// immediately and increments the hold count.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn take(self, ticks_to_wait: UTicks) -> Result<(), ReceiveError> {
        let current = Traits::current_task();

        {
            let mut lock = klock::enter_critical::<Traits>();
            if let Payload::Mutex(record) = &mut self.0.cb.st.write(&mut *lock).payload {
                if record.holder == Some(current) {
                    record.recursion += 1;
                    return Ok(());
                }
            }
        }

        // Sets the hold count to one
        self.0.receive(&mut [], ticks_to_wait)
    }

    /// Give the mutex once. Fails with `NotOwner` unless the current task
    /// holds it.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn give(self) -> Result<(), GiveMutexError> {
        let current = Traits::current_task();

        let released = {
            let mut lock = klock::enter_critical::<Traits>();
            match &mut self.0.cb.st.write(&mut *lock).payload {
                Payload::Mutex(record) if record.holder == Some(current) => {
                    record.recursion -= 1;
                    record.recursion == 0
                }
                _ => return Err(GiveMutexError::NotOwner),
            }
        };

        if released {
            let result = self.0.send_to_back(&[], 0);
            debug_assert!(result.is_ok());
        }
        Ok(())
    }

    /// Get the task holding the mutex.
    #[inline]
    pub fn holder(self) -> Option<Traits::TaskId> {
        self.0.mutex_holder()
    }

    /// Get how many more times the holder has to give the mutex to release
    /// it.
    pub fn hold_count(self) -> usize {
        let lock = klock::enter_critical::<Traits>();
        match &self.0.cb.st.read(&*lock).payload {
            Payload::Mutex(record) => record.recursion,
            Payload::Ring(_) => 0,
        }
    }

    /// Destroy the mutex.
    ///
    /// # Safety
    ///
    /// See [`Queue::delete`].
    pub unsafe fn delete(self) {
        // Safety: Upheld by the caller
        unsafe { self.0.delete() }
    }
}

#[cfg(feature = "recursive_mutex")]
impl<Traits: Port> Default for RecursiveMutex<Traits> {
    fn default() -> Self {
        Self::new()
    }
}
