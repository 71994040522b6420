//! Critical sections
//!
//! Every piece of mutable queue state is stored in a [`CpuLockCell`], which
//! can only be accessed through the singleton [`CpuLockToken`]. The token is
//! obtained by entering a CPU Lock state, either from a task ([`lock_cpu`])
//! or from an interrupt handler ([`mask_interrupts_from_isr`]). Both return
//! the same guard type, which releases the state in the way it was entered.
use core::{fmt, ops};
use tokenlock::UnsyncTokenLock;

use crate::{error::BadContextError, PortThreading};

pub(super) struct CpuLockTag<Traits>(Traits);

/// The key that "unlocks" [`CpuLockCell`].
pub(super) type CpuLockToken<Traits> = tokenlock::UnsyncSingletonToken<CpuLockTag<Traits>>;

/// The keyhole type for [`UnsyncTokenLock`] that can be "unlocked" by
/// [`CpuLockToken`].
pub(super) type CpuLockKeyhole<Traits> = tokenlock::SingletonTokenId<CpuLockTag<Traits>>;

/// Cell type that can be accessed by [`CpuLockToken`] (which can be obtained
/// by [`lock_cpu`]).
pub(super) struct CpuLockCell<Traits, T: ?Sized>(UnsyncTokenLock<T, CpuLockKeyhole<Traits>>);

impl<Traits, T> CpuLockCell<Traits, T> {
    pub(super) const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(CpuLockKeyhole::new(), x))
    }
}

impl<Traits: PortThreading, T: ?Sized> CpuLockCell<Traits, T> {
    /// Return a debug formatting proxy of the cell. The given closure is used
    /// to format the borrowed contents. Note that CPU Lock is active when the
    /// closure is called.
    pub(super) fn debug_fmt_with_ref<'a, F: 'a + Fn(&T, &mut fmt::Formatter) -> fmt::Result>(
        &'a self,
        f: F,
    ) -> impl fmt::Debug + 'a {
        struct DebugFmtWithRef<'a, Traits, T: ?Sized, F> {
            cell: &'a CpuLockCell<Traits, T>,
            f: F,
        }

        impl<Traits: PortThreading, T: ?Sized, F: Fn(&T, &mut fmt::Formatter) -> fmt::Result>
            fmt::Debug for DebugFmtWithRef<'_, Traits, T, F>
        {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if let Ok(lock) = lock_cpu() {
                    (self.f)(self.cell.0.read(&*lock), f)
                } else {
                    f.write_str("< locked >")
                }
            }
        }

        DebugFmtWithRef { cell: self, f }
    }
}

impl<Traits, T> ops::Deref for CpuLockCell<Traits, T> {
    type Target = UnsyncTokenLock<T, CpuLockKeyhole<Traits>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<Traits, T> ops::DerefMut for CpuLockCell<Traits, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Attempt to enter a CPU Lock state from a task context and get an RAII
/// guard. Return `BadContext` if the current context is already in a CPU
/// Lock state.
pub(super) fn lock_cpu<Traits: PortThreading>() -> Result<CpuLockGuard<Traits>, BadContextError> {
    // Safety: `try_enter_cpu_lock` is only meant to be called by us
    if unsafe { Traits::try_enter_cpu_lock() } {
        Ok(CpuLockGuard {
            // Safety: We just entered a CPU Lock state. This also means there
            //         are no instances of `CpuLockToken` existing at this
            //         point.
            token: unsafe { CpuLockToken::new_unchecked() },
            exit: Exit::LeaveCpuLock,
        })
    } else {
        Err(BadContextError::BadContext)
    }
}

/// Attempt to raise the interrupt mask from an interrupt handler and get an
/// RAII guard. Return `BadContext` if the current context is already in a
/// CPU Lock state.
///
/// In a task context, this is equivalent to [`lock_cpu`].
pub(super) fn mask_interrupts_from_isr<Traits: PortThreading>(
) -> Result<CpuLockGuard<Traits>, BadContextError> {
    if Traits::is_task_context() {
        return lock_cpu();
    }

    if Traits::is_cpu_lock_active() {
        return Err(BadContextError::BadContext);
    }

    // Safety: CPU Lock is inactive, and `set_interrupt_mask_from_isr` is only
    //         meant to be called by us
    let mask = unsafe { Traits::set_interrupt_mask_from_isr() };

    Ok(CpuLockGuard {
        // Safety: The interrupt mask now excludes every other context that
        //         could hold `CpuLockToken`
        token: unsafe { CpuLockToken::new_unchecked() },
        exit: Exit::RestoreMask(mask),
    })
}

/// [`lock_cpu`], panicking on failure. Nested critical sections are a
/// programming error.
#[track_caller]
pub(super) fn enter_critical<Traits: PortThreading>() -> CpuLockGuard<Traits> {
    match lock_cpu() {
        Ok(lock) => lock,
        Err(e) => panic!("can't enter a critical section: {e:?}"),
    }
}

/// [`mask_interrupts_from_isr`], panicking on failure.
#[track_caller]
pub(super) fn enter_critical_from_isr<Traits: PortThreading>() -> CpuLockGuard<Traits> {
    match mask_interrupts_from_isr() {
        Ok(lock) => lock,
        Err(e) => panic!("can't mask interrupts: {e:?}"),
    }
}

/// How a [`CpuLockGuard`] leaves the CPU Lock state.
enum Exit<Mask> {
    LeaveCpuLock,
    RestoreMask(Mask),
}

/// RAII guard for a CPU Lock state.
///
/// [`CpuLockToken`] can be borrowed from this type.
pub(super) struct CpuLockGuard<Traits: PortThreading> {
    token: CpuLockToken<Traits>,
    exit: Exit<Traits::InterruptMask>,
}

impl<Traits: PortThreading> CpuLockGuard<Traits> {
    /// Construct a [`CpuLockTokenRefMut`] by borrowing `self`.
    pub(super) fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_, Traits> {
        self.token.borrow_mut()
    }
}

impl<Traits: PortThreading> Drop for CpuLockGuard<Traits> {
    fn drop(&mut self) {
        // Safety: CPU Lock is currently active, and it's us who entered it in
        //         the way recorded by `exit`
        match self.exit {
            Exit::LeaveCpuLock => unsafe { Traits::leave_cpu_lock() },
            Exit::RestoreMask(mask) => unsafe { Traits::clear_interrupt_mask_from_isr(mask) },
        }
    }
}

impl<Traits: PortThreading> ops::Deref for CpuLockGuard<Traits> {
    type Target = CpuLockToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: PortThreading> ops::DerefMut for CpuLockGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

/// Borrowed version of [`CpuLockGuard`]. This is equivalent to
/// `&'a mut CpuLockGuard` but does not consume memory.
///
///  - Always prefer this over `&mut CpuLockGuard` in function parameters.
///  - When you pass `&'a mut _` to a function, the compiler automatically
///    reborrows it as `&'b mut _` so that the original `&'a mut _` remains
///    accessible after the function call. This does not happen with
///    `CpuLockTokenRefMut`. You have to call [`borrow_mut`] manually.
///
/// [`borrow_mut`]: tokenlock::UnsyncSingletonTokenRefMut::borrow_mut
pub(super) type CpuLockTokenRefMut<'a, Traits> =
    tokenlock::UnsyncSingletonTokenRefMut<'a, CpuLockTag<Traits>>;
