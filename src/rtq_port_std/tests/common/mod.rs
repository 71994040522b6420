use std::sync::atomic::{AtomicUsize, Ordering};

/// Define a test that boots its own simulated system and runs the given body
/// as the main task with priority 1. The kernel trait type is named
/// `System`.
macro_rules! system_test {
    (
        $(#[$meta:meta])*
        fn $name:ident() $body:block
    ) => {
        mod $name {
            #[allow(unused_imports)]
            use super::*;

            rtq_port_std::use_port!(unsafe struct System);

            #[test]
            $(#[$meta])*
            fn run() {
                rtq_port_std::run::<System>(1, || $body);
            }
        }
    };
}

pub(crate) use system_test;

/// Tracks the progress of a test across tasks.
pub struct SeqTracker {
    counter: AtomicUsize,
}

impl SeqTracker {
    pub const fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }

    /// Assert that the counter is equal to `old` and then replace it with
    /// `new`.
    #[track_caller]
    pub fn expect_and_replace(&self, old: usize, new: usize) {
        let got = self.counter.load(Ordering::Relaxed);
        log::debug!("{} (expected: {}) → {}", got, old, new);
        assert_eq!(got, old, "expected {}, got {}", old, got);
        self.counter.store(new, Ordering::Relaxed);
    }
}
