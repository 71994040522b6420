//! Blocking queues for a preemptive real-time kernel.
//!
//! This crate provides the generic queue primitive that message queues,
//! counting and binary semaphores, mutexes with priority inheritance and
//! queue sets are all built on. Items are copied by value into a fixed ring
//! buffer. Tasks may block on a queue with a timeout; interrupt handlers use
//! the non-blocking `*_from_isr` variants.
//!
//! # Ports
//!
//! The crate does not schedule tasks by itself. Everything it needs from the
//! scheduler (critical sections, task identity, wait lists, suspension,
//! ticks and priority inheritance) is requested through the `Port*` traits,
//! which a port implements on a *kernel trait type*. Every primitive is
//! parameterized by that type:
//!
//! ```rust,ignore
//! let queue = rtq_core::Queue::<SystemTraits>::new(4, 8);
//! queue.send(&[0; 8], 10, rtq_core::SendPosition::Back)?;
//! ```
//!
//! # Contexts
//!
//! Operations with a non-zero timeout may only be called from a task
//! context. Calling one from an interrupt handler, or calling any operation
//! while a critical section is already active in the current context, is a
//! programming error and causes a panic.
//!
//! The `*_from_isr` operations can be called from a task as well. They never
//! block there either. Like an interrupt handler, the caller is responsible
//! for yielding when one of them reports that it woke up a task with a
//! higher priority.
#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

extern crate alloc;

#[cfg(test)]
extern crate std;

use core::fmt;

mod error;
mod klock;
mod mutex;
mod queue;
mod ring;
mod semaphore;
#[cfg(feature = "queue_set")]
mod set;
mod timeout;

#[cfg(test)]
mod tests;

#[cfg(feature = "queue_set")]
pub use self::set::*;
pub use self::{
    error::*,
    mutex::*,
    queue::{Queue, QueueKind, SendPosition},
    semaphore::*,
    timeout::MAX_DELAY,
};

/// Unsigned integer type representing a tick count and a number of ticks
/// to wait.
pub type UTicks = u32;

/// Implemented by a port. This trait contains items related to critical
/// sections and execution contexts.
///
/// # Safety
///
/// The implementation must be correct.
///
/// CPU Lock must provide mutual exclusion against every other context that
/// may call into this crate, including interrupt handlers that use
/// [`set_interrupt_mask_from_isr`]. In other words, at most one context can
/// be in a CPU Lock state at any point of time.
///
/// [`set_interrupt_mask_from_isr`]: Self::set_interrupt_mask_from_isr
pub unsafe trait PortThreading: 'static + Sized {
    /// The interrupt mask saved by [`Self::set_interrupt_mask_from_isr`].
    type InterruptMask: Copy;

    /// Enter a CPU Lock state. Return `false` if the current context is
    /// already in a CPU Lock state.
    ///
    /// # Safety
    ///
    /// Only meant to be called by this crate.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Leave a CPU Lock state entered by [`Self::try_enter_cpu_lock`].
    ///
    /// A port may perform a pending context switch here.
    ///
    /// # Safety
    ///
    /// Only meant to be called by this crate. The current context must be in
    /// a CPU Lock state entered by `try_enter_cpu_lock`.
    unsafe fn leave_cpu_lock();

    /// Return a flag indicating whether the current context is in a CPU Lock
    /// state.
    fn is_cpu_lock_active() -> bool;

    /// Return a flag indicating whether the current context is a task
    /// context.
    fn is_task_context() -> bool;

    /// Raise the interrupt mask to the kernel's priority ceiling, entering a
    /// CPU Lock state from an interrupt handler. Return the previous mask.
    ///
    /// This is only called from an interrupt context. When a `*_from_isr`
    /// operation is called from a task, [`Self::try_enter_cpu_lock`] is used
    /// instead.
    ///
    /// Unlike [`Self::try_enter_cpu_lock`], this must never perform a
    /// context switch when the state is left.
    ///
    /// # Safety
    ///
    /// Only meant to be called by this crate. The current context must not
    /// be in a CPU Lock state.
    unsafe fn set_interrupt_mask_from_isr() -> Self::InterruptMask;

    /// Restore the interrupt mask saved by
    /// [`Self::set_interrupt_mask_from_isr`].
    ///
    /// # Safety
    ///
    /// Only meant to be called by this crate with the value returned by the
    /// matching call to `set_interrupt_mask_from_isr`.
    unsafe fn clear_interrupt_mask_from_isr(mask: Self::InterruptMask);
}

/// Implemented by a port. This trait contains items related to task
/// scheduling.
///
/// # Safety
///
/// The implementation must be correct. In particular, [`Self::WaitList`]
/// must hand out waiters in the order of their effective priorities (highest
/// first) and in FIFO order among waiters of equal priority.
pub unsafe trait PortScheduler: PortThreading {
    /// Identifies a task.
    type TaskId: Copy + Eq + fmt::Debug + Send + Sync + 'static;

    /// A collection of tasks waiting for an event on a queue. Every queue
    /// owns two of them.
    type WaitList: Default + Send + Sync + 'static;

    /// Get the currently running task.
    ///
    /// Panics if the current context is not a task context.
    fn current_task() -> Self::TaskId;

    /// Suspend task switching. Interrupts stay enabled. Calls may nest.
    fn suspend_scheduler();

    /// Undo one [`Self::suspend_scheduler`]. Return `true` if this call
    /// already switched to another task and back.
    fn resume_scheduler() -> bool;

    /// Request a context switch from inside an operation. This is called
    /// when a task with a higher priority than the caller became ready.
    fn yield_within_api();

    /// Record that a context switch was needed while the scheduler was
    /// suspended. It must be performed when the scheduler resumes.
    fn missed_yield();

    /// Move the current task to `list` and arrange for it to be woken after
    /// `ticks_to_wait` ticks unless [`Self::wake_from_wait_list`] wakes it
    /// first. [`MAX_DELAY`] means no timeout. The actual switch happens in
    /// the next [`Self::resume_scheduler`] or [`Self::yield_within_api`].
    ///
    /// # Safety
    ///
    /// The scheduler must be suspended by the current task.
    unsafe fn place_on_wait_list(list: &Self::WaitList, ticks_to_wait: UTicks);

    /// Remove the first waiter from `list` and make it ready. Return `true`
    /// if it has a higher priority than the current task.
    ///
    /// # Safety
    ///
    /// CPU Lock must be active and `list` must not be empty.
    unsafe fn wake_from_wait_list(list: &Self::WaitList) -> bool;

    /// Return a flag indicating whether `list` has no waiters.
    fn is_wait_list_empty(list: &Self::WaitList) -> bool;

    /// Raise `holder`'s effective priority to the current task's priority if
    /// it is lower.
    ///
    /// # Safety
    ///
    /// CPU Lock must be active.
    unsafe fn priority_inherit(holder: Self::TaskId);

    /// Restore `holder`'s base priority. Return `true` if a context switch
    /// is required as a result.
    ///
    /// # Safety
    ///
    /// CPU Lock must be active.
    unsafe fn priority_disinherit(holder: Self::TaskId) -> bool;
}

/// Implemented by a port. This trait contains items related to the system
/// tick.
pub trait PortTimer {
    /// Get the current tick count.
    fn tick_count() -> UTicks;

    /// Get the number of times [`Self::tick_count`] has wrapped around.
    fn tick_overflow_count() -> UTicks;
}

/// Represents a complete port. Implemented automatically for every type
/// implementing all `Port*` traits.
pub trait Port: PortThreading + PortScheduler + PortTimer {}
impl<T: PortThreading + PortScheduler + PortTimer> Port for T {}
