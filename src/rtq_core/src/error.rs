//! Result codes and error types
use core::{fmt, mem::transmute};

/// The macro to define [`ResultCode`].
macro_rules! define_result_code {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// Get the short name of the result code.
            ///
            /// # Examples
            ///
            /// ```
            /// use rtq_core::ResultCode;
            /// assert_eq!(ResultCode::Full.as_str(), "Full");
            /// ```
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }

            fn fmt(self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Debug for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                (*self).fmt(f)
            }
        }

        impl fmt::Display for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                (*self).fmt(f)
            }
        }
    };
}

define_result_code! {
    /// All result codes (including success) that the operations of this crate
    /// can produce.
    ///
    /// None of these represents a programming error. Misuse, such as passing
    /// a buffer of the wrong size, causes a panic instead.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The operation was successful.
        Success = 0,
        /// The queue had no room for an item, and the timeout elapsed before
        /// any became available.
        Full = -1,
        /// The queue had no item, and the timeout elapsed before any became
        /// available.
        Empty = -2,
        /// The caller does not hold the mutex.
        NotOwner = -3,
        /// The queue is not a member of the queue set.
        NotMember = -4,
        /// The queue is already a member of a queue set.
        AlreadyMember = -5,
        /// The queue still contains items.
        NotEmpty = -6,
        /// The current context disallows the operation.
        BadContext = -25,
    }
}

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    ///
    /// Failure codes have negative values.
    #[inline]
    pub fn is_err(self) -> bool {
        (self as i8) < 0
    }

    /// Get a flag indicating whether the code represents a success.
    ///
    /// Success codes have non-negative values.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }
}

macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes and generic descriptions.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i8)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                // Use the same discriminants as `ResultCode` for cost-free
                // conversion
                $vname = ResultCode::$vname as i8
            ),*
        }

        impl fmt::Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl fmt::Display for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => Self::Success,
                    Err(e) => Self::from(e),
                }
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                // Safety: `ResultCode` and `$name` has the same representation
                //         type, and the representation of `ResultCode` is a
                //         superset of `x`.
                unsafe { transmute(x) }
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from($name::$vname),
                    );
                )*
            }

            #[test]
            fn result_to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from(Err($name::$vname)),
                    );
                    assert!(ResultCode::from(Err($name::$vname)).is_err());
                )*
                assert_eq!(
                    ResultCode::Success,
                    ResultCode::from(Result::<(), $name>::Ok(())),
                );
            }
        }
    };
}

define_error! {
    mod bad_context_error {}
    /// Returned when a critical section can't be entered because the current
    /// context is already in one.
    pub enum BadContextError {
        BadContext,
    }
}

define_error! {
    mod send_error {}
    /// Error type for [`Queue::send`] and its variants.
    ///
    /// [`Queue::send`]: crate::Queue::send
    pub enum SendError {
        /// The queue is full.
        Full,
    }
}

define_error! {
    mod receive_error {}
    /// Error type for [`Queue::receive`] and its variants.
    ///
    /// [`Queue::receive`]: crate::Queue::receive
    pub enum ReceiveError {
        /// The queue is empty.
        Empty,
    }
}

define_error! {
    mod give_mutex_error {}
    /// Error type for [`Mutex::give`] and [`RecursiveMutex::give`].
    ///
    /// [`Mutex::give`]: crate::Mutex::give
    /// [`RecursiveMutex::give`]: crate::RecursiveMutex::give
    pub enum GiveMutexError {
        /// The current task is not the holder.
        NotOwner,
    }
}

define_error! {
    mod add_to_set_error {}
    /// Error type for `QueueSet::add`.
    pub enum AddToSetError {
        /// The queue is already a member of a queue set.
        AlreadyMember,
    }
}

define_error! {
    mod remove_from_set_error {}
    /// Error type for `QueueSet::remove`.
    pub enum RemoveFromSetError {
        /// The queue is not a member of this queue set.
        NotMember,
        /// The queue still contains items, each of which has a pending
        /// notification in the set.
        NotEmpty,
    }
}
