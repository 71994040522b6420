#![doc = include_str!("./lib.md")]
#![deny(unsafe_op_in_unsafe_fn)]
use std::{
    cell::Cell,
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    sync::{Condvar, Mutex as StdMutex, MutexGuard, OnceLock},
    thread,
    time::{Duration, Instant},
};

use rtq_core::UTicks;

mod sched;

pub use self::sched::{Priority, TaskId, WaitList};
use self::sched::{Outcome, Sched, TaskSt};

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate rtq_core;

/// The real time between two ticks.
pub const TICK_PERIOD: Duration = Duration::from_millis(1);

/// The tick count at boot time.
pub const INITIAL_TICK_COUNT: UTicks = UTicks::MAX - 300;

/// [`run`] fails if the main task doesn't complete within this duration.
pub const DEADLOCK_TIMEOUT: Duration = Duration::from_secs(20);

/// Implemented on a kernel trait type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
#[doc(hidden)]
pub unsafe trait PortInstance: rtq_core::Port {
    fn port_state() -> &'static State;
}

/// The internal state of the port.
///
/// # Safety
///
/// For the safety information of this type's methods, see the documentation of
/// the corresponding trait methods of `Port*`.
#[doc(hidden)]
pub struct State {
    inner: OnceLock<Inner>,
}

struct Inner {
    sched: StdMutex<Sched>,
    /// Notified whenever `Sched` changes in a way another thread might be
    /// waiting for
    cond: Condvar,
}

/// The role of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    /// The backing thread for an interrupt context.
    Interrupt,
    /// The backing thread for a task.
    Task,
}

thread_local! {
    /// The current thread's role. It's automatically assigned after the
    /// creation of a thread managed by the port.
    static THREAD_ROLE: Cell<ThreadRole> = const { Cell::new(ThreadRole::Unknown) };

    static CURRENT_TASK: Cell<Option<TaskId>> = const { Cell::new(None) };
}

/// The panic payload used to unwind task threads on shutdown.
struct Shutdown;

fn thread_role() -> ThreadRole {
    THREAD_ROLE.with(|r| r.get())
}

#[allow(clippy::missing_safety_doc)]
impl State {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            inner: OnceLock::new(),
        }
    }

    fn inner(&self) -> &Inner {
        self.inner
            .get()
            .expect("the simulated system hasn't been started")
    }

    fn lock(&self) -> MutexGuard<'_, Sched> {
        // A poisoned lock only means that a task panicked, which `run`
        // reports by itself
        self.inner()
            .sched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self) {
        self.inner().cond.notify_all();
    }

    /// Wait for a change of `Sched`. Unwinds the current thread if the
    /// system is shutting down.
    fn wait<'a>(&self, guard: MutexGuard<'a, Sched>) -> MutexGuard<'a, Sched> {
        let guard = self
            .inner()
            .cond
            .wait(guard)
            .unwrap_or_else(|e| e.into_inner());
        if guard.shutdown {
            drop(guard);
            resume_unwind(Box::new(Shutdown));
        }
        guard
    }

    /// Boot the system with a main task and return when the main task
    /// completes.
    fn boot(&'static self, priority: Priority, f: Box<dyn FnOnce() + Send>) {
        self.inner
            .set(Inner {
                sched: StdMutex::new(Sched::new()),
                cond: Condvar::new(),
            })
            .ok()
            .expect("a kernel trait type can only boot once");

        let main_task = self.spawn(priority, f);
        {
            let mut lock = self.lock();
            lock.main_task = Some(main_task);
            lock.request_dispatch();
        }
        self.notify();

        log::trace!("starting the timer thread");
        let timer_join_handle = thread::Builder::new()
            .name("timer".to_owned())
            .spawn(move || self.timer_loop())
            .unwrap();

        // Wait until the main task completes or something goes wrong
        let deadline = Instant::now() + DEADLOCK_TIMEOUT;
        let mut lock = self.lock();
        let outcome = loop {
            if let Some(outcome) = lock.outcome.take() {
                break outcome;
            }
            let now = Instant::now();
            if now >= deadline {
                break Outcome::Deadlocked;
            }
            lock = self
                .inner()
                .cond
                .wait_timeout(lock, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        };

        // Remaining task threads unwind as soon as they wake up
        lock.shutdown = true;
        drop(lock);
        self.notify();

        log::trace!("stopping the timer thread");
        timer_join_handle.join().unwrap();
        log::trace!("stopped the timer thread");

        match outcome {
            Outcome::Finished => {}
            // Propagate any panic that occured in a task
            Outcome::Panicked(e) => resume_unwind(e),
            Outcome::Deadlocked => {
                panic!("the main task didn't complete within {DEADLOCK_TIMEOUT:?}")
            }
        }
    }

    fn timer_loop(&'static self) {
        loop {
            thread::sleep(TICK_PERIOD);

            let mut lock = self.lock();

            // The tick interrupt is masked by CPU Lock and other interrupts
            while !lock.shutdown && (lock.cpu_lock.is_some() || lock.isr_active.is_some()) {
                lock = self
                    .inner()
                    .cond
                    .wait_timeout(lock, TICK_PERIOD)
                    .unwrap_or_else(|e| e.into_inner())
                    .0;
            }
            if lock.shutdown {
                break;
            }

            if lock.suspended > 0 {
                lock.pended_ticks += 1;
                continue;
            }

            lock.advance(1);
            lock.request_dispatch();
            drop(lock);
            self.notify();
        }
    }

    fn spawn(&'static self, priority: Priority, f: Box<dyn FnOnce() + Send>) -> TaskId {
        let task = self.lock().add_task(priority);

        thread::Builder::new()
            .name(format!("task {}", task.0))
            .spawn(move || self.task_main(task, f))
            .unwrap();

        log::trace!("spawned {task:?} with priority {priority}");
        task
    }

    fn task_main(&'static self, task: TaskId, f: Box<dyn FnOnce() + Send>) {
        THREAD_ROLE.with(|role| role.set(ThreadRole::Task));
        CURRENT_TASK.with(|t| t.set(Some(task)));

        let result = catch_unwind(AssertUnwindSafe(|| {
            let mut lock = self.lock();
            while lock.running != Some(task) {
                lock = self.wait(lock);
            }
            drop(lock);

            log::debug!("{task:?} is now running");
            f();
        }));

        let mut lock = self.lock();
        lock.tasks[task.0].st = TaskSt::Finished;
        if lock.cpu_lock == Some(thread::current().id()) {
            lock.cpu_lock = None;
        }

        match result {
            Ok(()) => {
                log::debug!("{task:?} completed");
                if lock.main_task == Some(task) && lock.outcome.is_none() {
                    lock.outcome = Some(Outcome::Finished);
                }
            }
            Err(e) if e.is::<Shutdown>() => {}
            Err(e) => {
                log::debug!("{task:?} panicked");
                if lock.outcome.is_none() {
                    lock.outcome = Some(Outcome::Panicked(e));
                }
            }
        }

        if lock.running == Some(task) {
            lock.running = None;
            lock.yield_pending = false;
            lock.request_dispatch();
        }
        drop(lock);
        self.notify();
    }

    fn current_task_id(&self) -> TaskId {
        match CURRENT_TASK.with(|t| t.get()) {
            Some(task) => task,
            None => panic!("the current thread is not a task"),
        }
    }

    /// Give up the processor if another task should be running, and wait
    /// until the current task is chosen again. Return `true` if a switch
    /// happened.
    fn reschedule(&self, mut lock: MutexGuard<'_, Sched>, me: TaskId) -> bool {
        debug_assert_eq!(lock.running, Some(me));
        debug_assert_eq!(lock.suspended, 0);

        lock.yield_pending = false;
        let next = lock.pick();
        if next == Some(me) {
            return false;
        }

        log::trace!("switching from {me:?} to {next:?}");
        lock.running = next;
        self.notify();
        while lock.running != Some(me) {
            lock = self.wait(lock);
        }
        log::trace!("{me:?} resumed");
        true
    }

    pub unsafe fn try_enter_cpu_lock(&self) -> bool {
        let me = thread::current().id();
        let mut lock = self.lock();
        if lock.cpu_lock == Some(me) {
            return false;
        }
        while lock.cpu_lock.is_some() || lock.isr_active.map_or(false, |t| t != me) {
            lock = self.wait(lock);
        }
        lock.cpu_lock = Some(me);
        true
    }

    pub unsafe fn leave_cpu_lock(&self) {
        let me = thread::current().id();
        let mut lock = self.lock();
        assert_eq!(lock.cpu_lock, Some(me));
        lock.cpu_lock = None;
        self.notify();

        if thread::panicking() || thread_role() != ThreadRole::Task {
            return;
        }

        // Perform the context switch requested by an interrupt or a timeout
        let task = self.current_task_id();
        if lock.yield_pending && lock.suspended == 0 && lock.running == Some(task) {
            self.reschedule(lock, task);
        }
    }

    pub fn is_cpu_lock_active(&self) -> bool {
        self.lock().cpu_lock == Some(thread::current().id())
    }

    pub fn is_task_context(&self) -> bool {
        thread_role() == ThreadRole::Task
    }

    pub unsafe fn set_interrupt_mask_from_isr(&self) {
        assert_eq!(
            thread_role(),
            ThreadRole::Interrupt,
            "interrupt mask raised outside an interrupt handler"
        );

        let me = thread::current().id();
        let mut lock = self.lock();
        debug_assert_eq!(lock.isr_active, Some(me));
        while lock.cpu_lock.is_some() {
            lock = self.wait(lock);
        }
        lock.cpu_lock = Some(me);
    }

    pub unsafe fn clear_interrupt_mask_from_isr(&self) {
        let mut lock = self.lock();
        assert_eq!(lock.cpu_lock, Some(thread::current().id()));
        lock.cpu_lock = None;
        drop(lock);
        self.notify();
    }

    pub fn current_task(&self) -> TaskId {
        self.current_task_id()
    }

    pub fn suspend_scheduler(&self) {
        self.lock().suspended += 1;
    }

    pub fn resume_scheduler(&self) -> bool {
        let mut lock = self.lock();
        assert_ne!(lock.suspended, 0, "the scheduler isn't suspended");
        lock.suspended -= 1;
        if lock.suspended > 0 {
            return false;
        }

        let pended_ticks = std::mem::take(&mut lock.pended_ticks);
        if pended_ticks > 0 {
            log::trace!("catching up {pended_ticks} ticks");
            lock.advance(pended_ticks);
        }

        // The current task might have blocked itself
        let task = self.current_task_id();
        if lock.yield_pending || lock.pick() != Some(task) {
            self.reschedule(lock, task)
        } else {
            false
        }
    }

    pub fn yield_within_api(&self) {
        let mut lock = self.lock();
        if lock.suspended > 0 {
            lock.yield_pending = true;
            return;
        }
        let task = self.current_task_id();
        self.reschedule(lock, task);
    }

    pub fn missed_yield(&self) {
        self.lock().yield_pending = true;
    }

    pub unsafe fn place_on_wait_list(&self, list: &WaitList, ticks_to_wait: UTicks) {
        let task = self.current_task_id();
        let mut lock = self.lock();
        assert_ne!(lock.suspended, 0, "the scheduler isn't suspended");
        log::trace!("{task:?} waits for {ticks_to_wait} ticks");
        lock.block(task, Some(list), ticks_to_wait);
    }

    pub unsafe fn wake_from_wait_list(&self, list: &WaitList) -> bool {
        let mut lock = self.lock();
        match lock.wake_one(list) {
            Some(task) => {
                log::trace!("woke up {task:?}");
                lock.outranks_running(task)
            }
            None => false,
        }
    }

    pub fn is_wait_list_empty(&self, list: &WaitList) -> bool {
        list.is_empty()
    }

    pub unsafe fn priority_inherit(&self, holder: TaskId) {
        let task = self.current_task_id();
        let mut lock = self.lock();
        let priority = lock.tasks[task.0].priority;
        lock.raise_priority(holder, priority);
    }

    pub unsafe fn priority_disinherit(&self, holder: TaskId) -> bool {
        self.lock().restore_priority(holder)
    }

    pub fn tick_count(&self) -> UTicks {
        self.lock().tick_count()
    }

    pub fn tick_overflow_count(&self) -> UTicks {
        self.lock().tick_overflow_count()
    }
}

/// Boot the simulated system and run `f` as its main task with the specified
/// priority. Returns when `f` returns.
///
/// A panic in any task is propagated to the caller. If `f` doesn't complete
/// within [`DEADLOCK_TIMEOUT`], this function panics.
pub fn run<Traits: PortInstance>(priority: Priority, f: impl FnOnce() + Send + 'static) {
    // `is_test(true)` would drop log messages from other threads
    let _ = env_logger::try_init();

    Traits::port_state().boot(priority, Box::new(f));
}

/// Create a task with the specified priority. If it has a higher priority
/// than the calling task, it starts running immediately.
///
/// Must be called from a task.
pub fn spawn_task<Traits: PortInstance>(
    priority: Priority,
    f: impl FnOnce() + Send + 'static,
) -> TaskId {
    let state = Traits::port_state();
    let me = state.current_task_id();
    let task = state.spawn(priority, Box::new(f));

    let lock = state.lock();
    if lock.suspended == 0 && lock.pick() != Some(me) {
        state.reschedule(lock, me);
    }
    task
}

/// Run `f` as an interrupt handler.
///
/// `f` runs on a separate thread, excluding tasks from critical sections
/// until it returns. It should return `true` if it woke up a task that should
/// preempt the interrupted one, as reported by the `*_from_isr` operations.
///
/// Must not be called inside a critical section.
pub fn interrupt<Traits: PortInstance>(f: impl FnOnce() -> bool + Send) {
    let state = Traits::port_state();

    let result = thread::scope(|s| {
        s.spawn(|| {
            THREAD_ROLE.with(|role| role.set(ThreadRole::Interrupt));
            let me = thread::current().id();

            {
                let mut lock = state.lock();
                while lock.cpu_lock.is_some() || lock.isr_active.is_some() {
                    lock = state.wait(lock);
                }
                lock.isr_active = Some(me);
            }
            log::trace!("interrupt handler start");

            let result = catch_unwind(AssertUnwindSafe(f));

            let mut lock = state.lock();
            lock.isr_active = None;
            if let Ok(true) = result {
                log::trace!("interrupt handler requests a context switch");
                lock.request_dispatch();
            }
            drop(lock);
            state.notify();
            log::trace!("interrupt handler end");

            if let Err(e) = result {
                resume_unwind(e);
            }
        })
        .join()
    });

    if let Err(e) = result {
        resume_unwind(e);
    }

    // Return to the interrupted task, or to another one
    if thread_role() == ThreadRole::Task {
        let me = state.current_task_id();
        let lock = state.lock();
        if lock.yield_pending && lock.suspended == 0 && lock.cpu_lock.is_none() {
            state.reschedule(lock, me);
        }
    }
}

/// Block the current task for the specified number of ticks.
pub fn delay<Traits: PortInstance>(ticks: UTicks) {
    let state = Traits::port_state();
    let me = state.current_task_id();
    let mut lock = state.lock();
    assert_eq!(lock.suspended, 0, "the scheduler is suspended");
    if ticks > 0 {
        lock.block(me, None, ticks);
    }
    state.reschedule(lock, me);
}

/// Get the currently running task.
pub fn current_task<Traits: PortInstance>() -> TaskId {
    Traits::port_state().current_task_id()
}

/// Get the effective priority of a task.
pub fn task_priority<Traits: PortInstance>(task: TaskId) -> Priority {
    Traits::port_state().lock().tasks[task.0].priority
}

/// Get the number of ticks since boot. Unlike the tick count seen by
/// `rtq_core`, this never wraps around.
pub fn elapsed_ticks<Traits: PortInstance>() -> u64 {
    Traits::port_state().lock().elapsed
}

/// Define a kernel trait type implementing the `Port*` traits of `rtq_core`
/// with a simulated system.
#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident) => {
        $vis struct $SystemTraits;

        mod port_std_impl {
            use super::$SystemTraits;
            use $crate::rtq_core::{PortScheduler, PortThreading, PortTimer, UTicks};
            use $crate::{PortInstance, State, TaskId, WaitList};

            pub(super) static PORT_STATE: State = State::new();

            unsafe impl PortInstance for $SystemTraits {
                #[inline]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }

            unsafe impl PortThreading for $SystemTraits {
                type InterruptMask = ();

                unsafe fn try_enter_cpu_lock() -> bool {
                    unsafe { PORT_STATE.try_enter_cpu_lock() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { PORT_STATE.leave_cpu_lock() }
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active()
                }

                fn is_task_context() -> bool {
                    PORT_STATE.is_task_context()
                }

                unsafe fn set_interrupt_mask_from_isr() {
                    unsafe { PORT_STATE.set_interrupt_mask_from_isr() }
                }

                unsafe fn clear_interrupt_mask_from_isr(_: ()) {
                    unsafe { PORT_STATE.clear_interrupt_mask_from_isr() }
                }
            }

            unsafe impl PortScheduler for $SystemTraits {
                type TaskId = TaskId;
                type WaitList = WaitList;

                fn current_task() -> TaskId {
                    PORT_STATE.current_task()
                }

                fn suspend_scheduler() {
                    PORT_STATE.suspend_scheduler()
                }

                fn resume_scheduler() -> bool {
                    PORT_STATE.resume_scheduler()
                }

                fn yield_within_api() {
                    PORT_STATE.yield_within_api()
                }

                fn missed_yield() {
                    PORT_STATE.missed_yield()
                }

                unsafe fn place_on_wait_list(list: &WaitList, ticks_to_wait: UTicks) {
                    unsafe { PORT_STATE.place_on_wait_list(list, ticks_to_wait) }
                }

                unsafe fn wake_from_wait_list(list: &WaitList) -> bool {
                    unsafe { PORT_STATE.wake_from_wait_list(list) }
                }

                fn is_wait_list_empty(list: &WaitList) -> bool {
                    PORT_STATE.is_wait_list_empty(list)
                }

                unsafe fn priority_inherit(holder: TaskId) {
                    unsafe { PORT_STATE.priority_inherit(holder) }
                }

                unsafe fn priority_disinherit(holder: TaskId) -> bool {
                    unsafe { PORT_STATE.priority_disinherit(holder) }
                }
            }

            impl PortTimer for $SystemTraits {
                fn tick_count() -> UTicks {
                    PORT_STATE.tick_count()
                }

                fn tick_overflow_count() -> UTicks {
                    PORT_STATE.tick_overflow_count()
                }
            }
        }
    };
}
