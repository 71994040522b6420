//! The simulated scheduler's state
use slab::Slab;
use spin::Mutex as SpinMutex;
use std::{any::Any, cmp::Reverse, sync::Arc, thread::ThreadId};

use crate::INITIAL_TICK_COUNT;
use rtq_core::{UTicks, MAX_DELAY};

/// Task priority. Larger values are higher priorities.
pub type Priority = u8;

/// Identifies a task of the simulated system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) usize);

#[derive(Debug)]
pub(crate) struct Waiter {
    task: TaskId,
    /// Arrival order
    seq: u64,
}

/// Tasks waiting for a queue event.
#[derive(Debug, Default, Clone)]
pub struct WaitList(Arc<SpinMutex<Vec<Waiter>>>);

impl WaitList {
    pub(crate) fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskSt {
    Ready,
    Blocked,
    Finished,
}

#[derive(Debug)]
struct Wait {
    list: Option<WaitList>,
    /// The value of `Sched::elapsed` at which the wait times out
    wake_at: Option<u64>,
}

#[derive(Debug)]
pub(crate) struct Tcb {
    base_priority: Priority,
    /// The effective priority, possibly raised by priority inheritance
    pub(crate) priority: Priority,
    pub(crate) st: TaskSt,
    /// When this task last became ready. Ready tasks of equal priority run
    /// in this order.
    seq: u64,
    wait: Option<Wait>,
}

/// Why a simulation ended.
pub(crate) enum Outcome {
    Finished,
    Panicked(Box<dyn Any + Send>),
    Deadlocked,
}

pub(crate) struct Sched {
    /// The thread in a CPU Lock state
    pub(crate) cpu_lock: Option<ThreadId>,
    /// The thread running an interrupt handler
    pub(crate) isr_active: Option<ThreadId>,
    pub(crate) tasks: Slab<Tcb>,
    /// The task whose thread is allowed to proceed
    pub(crate) running: Option<TaskId>,
    pub(crate) main_task: Option<TaskId>,
    /// Scheduler suspension depth
    pub(crate) suspended: usize,
    /// A context switch was requested while it couldn't be performed
    pub(crate) yield_pending: bool,
    /// Ticks since boot
    pub(crate) elapsed: u64,
    /// Ticks that occurred while the scheduler was suspended
    pub(crate) pended_ticks: u64,
    seq: u64,
    pub(crate) outcome: Option<Outcome>,
    pub(crate) shutdown: bool,
}

impl Sched {
    pub(crate) fn new() -> Self {
        Self {
            cpu_lock: None,
            isr_active: None,
            tasks: Slab::new(),
            running: None,
            main_task: None,
            suspended: 0,
            yield_pending: false,
            elapsed: 0,
            pended_ticks: 0,
            seq: 0,
            outcome: None,
            shutdown: false,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    pub(crate) fn add_task(&mut self, priority: Priority) -> TaskId {
        let seq = self.next_seq();
        TaskId(self.tasks.insert(Tcb {
            base_priority: priority,
            priority,
            st: TaskSt::Ready,
            seq,
            wait: None,
        }))
    }

    fn make_ready(&mut self, task: TaskId) {
        let seq = self.next_seq();
        let tcb = &mut self.tasks[task.0];
        tcb.st = TaskSt::Ready;
        tcb.seq = seq;
        tcb.wait = None;
    }

    /// Choose the task that should be running. The running task keeps the
    /// processor against ready tasks of the same priority.
    pub(crate) fn pick(&self) -> Option<TaskId> {
        let best = self
            .tasks
            .iter()
            .filter(|(_, tcb)| tcb.st == TaskSt::Ready)
            .max_by_key(|(_, tcb)| (tcb.priority, Reverse(tcb.seq)))
            .map(|(i, tcb)| (TaskId(i), tcb.priority));

        match (self.running, best) {
            (Some(cur), Some((_, priority)))
                if self.tasks[cur.0].st == TaskSt::Ready
                    && self.tasks[cur.0].priority >= priority =>
            {
                Some(cur)
            }
            (_, best) => best.map(|(task, _)| task),
        }
    }

    /// Return `true` if `task` should preempt the running task.
    pub(crate) fn outranks_running(&self, task: TaskId) -> bool {
        match self.running {
            Some(cur) => self.tasks[task.0].priority > self.tasks[cur.0].priority,
            None => true,
        }
    }

    /// Block `task` on `list` (or on nothing but the timeout).
    pub(crate) fn block(&mut self, task: TaskId, list: Option<&WaitList>, ticks_to_wait: UTicks) {
        let wake_at = (ticks_to_wait != MAX_DELAY).then(|| self.elapsed + u64::from(ticks_to_wait));
        if let Some(list) = list {
            let seq = self.next_seq();
            list.0.lock().push(Waiter { task, seq });
        }

        let tcb = &mut self.tasks[task.0];
        debug_assert_eq!(tcb.st, TaskSt::Ready);
        tcb.st = TaskSt::Blocked;
        tcb.wait = Some(Wait {
            list: list.cloned(),
            wake_at,
        });
    }

    /// Remove the waiter with the highest priority from `list`, oldest first
    /// among equals, and make it ready.
    pub(crate) fn wake_one(&mut self, list: &WaitList) -> Option<TaskId> {
        let mut waiters = list.0.lock();
        let (i, _) = waiters
            .iter()
            .enumerate()
            .max_by_key(|(_, w)| (self.tasks[w.task.0].priority, Reverse(w.seq)))?;
        let task = waiters.remove(i).task;
        drop(waiters);

        debug_assert!(matches!(
            &self.tasks[task.0].wait,
            Some(Wait { list: Some(l), .. }) if l.same_as(list)
        ));
        self.make_ready(task);
        Some(task)
    }

    /// Advance the tick count and wake up the tasks whose timeouts expired.
    pub(crate) fn advance(&mut self, ticks: u64) {
        self.elapsed += ticks;
        let now = self.elapsed;

        let expired: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|(_, tcb)| {
                tcb.st == TaskSt::Blocked
                    && matches!(tcb.wait, Some(Wait { wake_at: Some(t), .. }) if t <= now)
            })
            .map(|(i, _)| TaskId(i))
            .collect();

        for task in expired {
            log::trace!("{task:?} timed out");
            if let Some(Wait { list: Some(list), .. }) = &self.tasks[task.0].wait {
                list.0.lock().retain(|w| w.task != task);
            }
            self.make_ready(task);
        }
    }

    /// Let a newly ready task run. Dispatch it if the processor is idle;
    /// otherwise ask the running task to yield if it's outranked.
    pub(crate) fn request_dispatch(&mut self) {
        if self.running.is_none() {
            self.running = self.pick();
            if let Some(task) = self.running {
                log::trace!("dispatching {task:?}");
            }
        } else if self.pick() != self.running {
            self.yield_pending = true;
        }
    }

    pub(crate) fn raise_priority(&mut self, task: TaskId, priority: Priority) {
        let tcb = &mut self.tasks[task.0];
        if tcb.priority < priority {
            log::debug!("{task:?} inherits priority {priority}");
            tcb.priority = priority;
        }
    }

    /// Restore the base priority of `task`. Return `true` if it was raised.
    pub(crate) fn restore_priority(&mut self, task: TaskId) -> bool {
        let tcb = &mut self.tasks[task.0];
        if tcb.priority == tcb.base_priority {
            false
        } else {
            log::debug!("{task:?} returns to priority {}", tcb.base_priority);
            tcb.priority = tcb.base_priority;
            true
        }
    }

    fn wide_tick_count(&self) -> u64 {
        u64::from(INITIAL_TICK_COUNT) + self.elapsed
    }

    pub(crate) fn tick_count(&self) -> UTicks {
        self.wide_tick_count() as UTicks
    }

    pub(crate) fn tick_overflow_count(&self) -> UTicks {
        (self.wide_tick_count() >> UTicks::BITS) as UTicks
    }
}
