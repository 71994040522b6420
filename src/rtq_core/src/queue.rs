//! Queues
use alloc::boxed::Box;
use core::{
    fmt, mem, ptr,
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};

use crate::{
    error::{ReceiveError, SendError},
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    ring::RingBuffer,
    timeout::TimeOut,
    Port, UTicks,
};

/// The primitive a queue implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// A message queue.
    Queue,
    /// A mutex.
    Mutex,
    /// A mutex that its holder may take again.
    RecursiveMutex,
    /// A counting semaphore.
    CountingSemaphore,
    /// A semaphore with a maximum count of one.
    BinarySemaphore,
    /// A queue set.
    Set,
}

impl QueueKind {
    #[inline]
    pub(super) fn is_mutex(self) -> bool {
        matches!(self, Self::Mutex | Self::RecursiveMutex)
    }
}

/// Where a sent item is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendPosition {
    /// After the last item. The item is received last.
    Back,
    /// Before the first item. The item is received next.
    Front,
    /// Replace the item a queue of capacity one holds, or store it if the
    /// queue is empty. The send always succeeds.
    Overwrite,
}

/// The soft lock of one direction of a queue.
///
/// While a task examines a queue with the scheduler suspended, the queue is
/// locked. Interrupt handlers may still move items in and out, but instead of
/// waking waiting tasks they count the wake-ups they owe, which the task
/// performs when it unlocks the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum SoftLock {
    Unlocked,
    /// Locked, with the number of items moved while locked.
    Locked(usize),
}

impl SoftLock {
    /// Record an item movement that couldn't notify anyone. Return `false` if
    /// the lock isn't held and the caller has to notify by itself.
    #[inline]
    fn defer(&mut self) -> bool {
        match self {
            Self::Unlocked => false,
            Self::Locked(n) => {
                *n += 1;
                true
            }
        }
    }
}

/// The state a mutex keeps instead of a ring buffer.
#[derive(Debug)]
pub(super) struct MutexRecord<TaskId> {
    /// The task that currently holds the mutex.
    pub(super) holder: Option<TaskId>,
    /// How many times the holder has taken a recursive mutex.
    pub(super) recursion: usize,
}

/// What a queue stores, depending on its [`QueueKind`].
pub(super) enum Payload<TaskId> {
    Ring(RingBuffer),
    Mutex(MutexRecord<TaskId>),
}

pub(super) struct QueueState<Traits: Port> {
    pub(super) payload: Payload<Traits::TaskId>,
    pub(super) rx_lock: SoftLock,
    pub(super) tx_lock: SoftLock,
    /// The queue set this queue belongs to.
    pub(super) set_container: Option<&'static QueueCb<Traits>>,
}

/// *Queue control block* - the state data of a queue.
pub struct QueueCb<Traits: Port> {
    pub(super) kind: QueueKind,
    pub(super) capacity: usize,
    pub(super) item_size: usize,

    /// The number of items in the queue. Only modified in a CPU Lock state,
    /// but can be read at any time.
    messages_waiting: AtomicUsize,

    pub(super) st: CpuLockCell<Traits, QueueState<Traits>>,

    /// Tasks blocked until they can send.
    pub(super) wait_to_send: Traits::WaitList,
    /// Tasks blocked until they can receive.
    pub(super) wait_to_receive: Traits::WaitList,

    trace_number: AtomicU8,
}

impl<Traits: Port> QueueCb<Traits> {
    fn new(kind: QueueKind, capacity: usize, item_size: usize) -> Self {
        let (payload, messages_waiting) = if kind.is_mutex() {
            assert!(
                capacity == 1 && item_size == 0,
                "a mutex has a capacity of one and no item storage",
            );
            // A mutex starts available
            let record = MutexRecord {
                holder: None,
                recursion: 0,
            };
            (Payload::Mutex(record), 1)
        } else {
            (Payload::Ring(RingBuffer::new(capacity, item_size)), 0)
        };

        Self {
            kind,
            capacity,
            item_size,
            messages_waiting: AtomicUsize::new(messages_waiting),
            st: CpuLockCell::new(QueueState {
                payload,
                rx_lock: SoftLock::Unlocked,
                tx_lock: SoftLock::Unlocked,
                set_container: None,
            }),
            wait_to_send: Traits::WaitList::default(),
            wait_to_receive: Traits::WaitList::default(),
            trace_number: AtomicU8::new(0),
        }
    }

    #[inline]
    pub(super) fn count(&self) -> usize {
        self.messages_waiting.load(Ordering::Relaxed)
    }

    /// Update the item count. CPU Lock must be active.
    #[inline]
    pub(super) fn set_count(&self, count: usize) {
        debug_assert!(count <= self.capacity);
        self.messages_waiting.store(count, Ordering::Relaxed);
    }

    #[inline]
    pub(super) fn trace_number(&self) -> u8 {
        self.trace_number.load(Ordering::Relaxed)
    }
}

impl<Traits: Port> fmt::Debug for QueueCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("QueueCb")
            .field("self", &(self as *const _))
            .field("kind", &self.kind)
            .field("capacity", &self.capacity)
            .field("item_size", &self.item_size)
            .field("messages_waiting", &self.count())
            .field(
                "st",
                &self.st.debug_fmt_with_ref(|st, f| {
                    let mut f = f.debug_struct("QueueState");
                    if let Payload::Mutex(record) = &st.payload {
                        f.field("mutex", record);
                    }
                    f.field("rx_lock", &st.rx_lock)
                        .field("tx_lock", &st.tx_lock)
                        .field(
                            "set_container",
                            &st.set_container.map(|c| c as *const QueueCb<Traits>),
                        )
                        .finish()
                }),
            )
            .field("trace_number", &self.trace_number())
            .finish()
    }
}

/// A handle to a queue.
///
/// This is a copyable reference to a control block allocated by [`Self::new`]
/// and freed by [`Self::delete`]. The other primitives of this crate are
/// built on it, and their handles can be converted to this type.
pub struct Queue<Traits: Port> {
    pub(super) cb: &'static QueueCb<Traits>,
}

impl<Traits: Port> Clone for Queue<Traits> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: Port> Copy for Queue<Traits> {}

impl<Traits: Port> PartialEq for Queue<Traits> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.cb, other.cb)
    }
}

impl<Traits: Port> Eq for Queue<Traits> {}

impl<Traits: Port> fmt::Debug for Queue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Queue").field(&(self.cb as *const _)).finish()
    }
}

impl<Traits: Port> Queue<Traits> {
    /// Create a message queue that can hold `capacity` items of `item_size`
    /// bytes each.
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize, item_size: usize) -> Self {
        Self::with_kind(QueueKind::Queue, capacity, item_size)
    }

    /// Create a queue of any kind.
    ///
    /// A mutex must have a capacity of one and an item size of zero, and it
    /// starts available. Every other kind starts empty. Prefer the
    /// constructors of the typed handles, e.g., [`Mutex::new`].
    ///
    /// [`Mutex::new`]: crate::Mutex::new
    pub fn with_kind(kind: QueueKind, capacity: usize, item_size: usize) -> Self {
        let cb: &'static QueueCb<Traits> =
            Box::leak(Box::new(QueueCb::new(kind, capacity, item_size)));
        log::trace!("create {kind:?} {:p} (capacity = {capacity}, item_size = {item_size})", cb);
        Self { cb }
    }

    /// Destroy the queue and free its storage.
    ///
    /// # Safety
    ///
    /// No task or interrupt handler may use the queue (or any copy of this
    /// handle) afterward. No task may be blocked on it, and it must not be a
    /// member of a queue set.
    pub unsafe fn delete(self) {
        log::trace!("delete {:?} #{}", self.cb.kind, self.cb.trace_number());
        debug_assert!(Traits::is_wait_list_empty(&self.cb.wait_to_send));
        debug_assert!(Traits::is_wait_list_empty(&self.cb.wait_to_receive));

        // Safety: `cb` was leaked from a `Box` by `with_kind`, and the caller
        //         guarantees it's no longer referenced
        drop(unsafe { Box::from_raw(self.cb as *const QueueCb<Traits> as *mut QueueCb<Traits>) });
    }

    /// Get the kind of primitive this queue implements.
    #[inline]
    pub fn kind(self) -> QueueKind {
        self.cb.kind
    }

    /// Get the maximum number of items.
    #[inline]
    pub fn capacity(self) -> usize {
        self.cb.capacity
    }

    /// Get the size of an item in bytes.
    #[inline]
    pub fn item_size(self) -> usize {
        self.cb.item_size
    }

    /// Get the number used to identify this queue in log output.
    #[inline]
    pub fn trace_number(self) -> u8 {
        self.cb.trace_number()
    }

    /// Assign a number used to identify this queue in log output.
    pub fn set_trace_number(self, number: u8) {
        self.cb.trace_number.store(number, Ordering::Relaxed);
    }

    /// Send an item, waiting for up to `ticks_to_wait` ticks for room to
    /// become available. The length of `item` must match the item size.
    ///
    /// With a non-zero timeout this can only be called from a task context.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn send(
        self,
        item: &[u8],
        ticks_to_wait: UTicks,
        position: SendPosition,
    ) -> Result<(), SendError> {
        generic_send(self.cb, item, ticks_to_wait, position)
    }

    /// [`Self::send`] with [`SendPosition::Back`].
    #[inline]
    pub fn send_to_back(self, item: &[u8], ticks_to_wait: UTicks) -> Result<(), SendError> {
        self.send(item, ticks_to_wait, SendPosition::Back)
    }

    /// [`Self::send`] with [`SendPosition::Front`].
    #[inline]
    pub fn send_to_front(self, item: &[u8], ticks_to_wait: UTicks) -> Result<(), SendError> {
        self.send(item, ticks_to_wait, SendPosition::Front)
    }

    /// Replace the item held by a queue of capacity one. Never fails.
    #[inline]
    pub fn overwrite(self, item: &[u8]) {
        let result = self.send(item, 0, SendPosition::Overwrite);
        debug_assert!(result.is_ok());
    }

    /// Receive an item into `out`, or copy it without removing it if `peek`
    /// is `true`. Waits for up to `ticks_to_wait` ticks for an item to
    /// become available. The length of `out` must match the item size.
    ///
    /// With a non-zero timeout this can only be called from a task context.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn generic_receive(
        self,
        out: &mut [u8],
        ticks_to_wait: UTicks,
        peek: bool,
    ) -> Result<(), ReceiveError> {
        generic_receive(self.cb, out, ticks_to_wait, peek)
    }

    /// Remove the first item, copying it into `out`.
    #[inline]
    pub fn receive(self, out: &mut [u8], ticks_to_wait: UTicks) -> Result<(), ReceiveError> {
        self.generic_receive(out, ticks_to_wait, false)
    }

    /// Copy the first item into `out` without removing it.
    #[inline]
    pub fn peek(self, out: &mut [u8], ticks_to_wait: UTicks) -> Result<(), ReceiveError> {
        self.generic_receive(out, ticks_to_wait, true)
    }

    /// Send a plain-old-data value. `T` must be exactly as large as the item
    /// size.
    pub fn send_value<T: bytemuck::Pod>(
        self,
        value: &T,
        ticks_to_wait: UTicks,
        position: SendPosition,
    ) -> Result<(), SendError> {
        self.send(bytemuck::bytes_of(value), ticks_to_wait, position)
    }

    /// Receive a plain-old-data value. `T` must be exactly as large as the
    /// item size.
    pub fn receive_value<T: bytemuck::Pod>(self, ticks_to_wait: UTicks) -> Result<T, ReceiveError> {
        let mut value = T::zeroed();
        self.receive(bytemuck::bytes_of_mut(&mut value), ticks_to_wait)?;
        Ok(value)
    }

    /// Send an item from an interrupt handler. Never blocks.
    ///
    /// On success, returns `true` if a task with a higher priority than the
    /// interrupted task was woken up, in which case the handler should
    /// request a context switch on exit.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn send_from_isr(self, item: &[u8], position: SendPosition) -> Result<bool, SendError> {
        send_from_isr(self.cb, item, position)
    }

    /// Receive an item from an interrupt handler. Never blocks.
    ///
    /// On success, returns `true` if a task with a higher priority than the
    /// interrupted task was woken up.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn receive_from_isr(self, out: &mut [u8]) -> Result<bool, ReceiveError> {
        receive_from_isr(self.cb, out)
    }

    /// Copy the first item into `out` from an interrupt handler without
    /// removing it. Never blocks.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn peek_from_isr(self, out: &mut [u8]) -> Result<(), ReceiveError> {
        peek_from_isr(self.cb, out)
    }

    /// Get the number of items in the queue.
    pub fn messages_waiting(self) -> usize {
        let _lock = klock::enter_critical::<Traits>();
        self.cb.count()
    }

    /// Get the number of items that can be sent before the queue is full.
    pub fn spaces_available(self) -> usize {
        let _lock = klock::enter_critical::<Traits>();
        self.cb.capacity - self.cb.count()
    }

    /// Get the number of items without entering a critical section.
    #[inline]
    pub fn messages_waiting_from_isr(self) -> usize {
        self.cb.count()
    }

    /// [`Self::messages_waiting_from_isr`]` == 0`
    #[inline]
    pub fn is_empty_from_isr(self) -> bool {
        self.cb.count() == 0
    }

    /// [`Self::messages_waiting_from_isr`]` == capacity`
    #[inline]
    pub fn is_full_from_isr(self) -> bool {
        self.cb.count() == self.cb.capacity
    }

    /// Get the task holding the mutex. Returns `None` if the queue isn't a
    /// mutex or the mutex is available.
    pub fn mutex_holder(self) -> Option<Traits::TaskId> {
        let lock = klock::enter_critical::<Traits>();
        match &self.cb.st.read(&*lock).payload {
            Payload::Mutex(record) => record.holder,
            Payload::Ring(_) => None,
        }
    }

    /// Discard all items and rewind the queue.
    ///
    /// A task waiting to send is woken up since it can now succeed. Tasks
    /// waiting to receive stay blocked. Can't be used on a mutex.
    pub fn reset(self) {
        let cb = self.cb;
        log::trace!("reset {:?} #{}", cb.kind, cb.trace_number());

        let mut lock = klock::enter_critical::<Traits>();
        let st = cb.st.write(&mut *lock);
        match &mut st.payload {
            Payload::Ring(ring) => ring.reset(),
            Payload::Mutex(_) => panic!("a mutex can't be reset"),
        }
        st.rx_lock = SoftLock::Unlocked;
        st.tx_lock = SoftLock::Unlocked;
        cb.set_count(0);

        let reschedule = !Traits::is_wait_list_empty(&cb.wait_to_send)
            // Safety: CPU Lock active, the list is not empty
            && unsafe { Traits::wake_from_wait_list(&cb.wait_to_send) };
        drop(lock);

        if reschedule {
            Traits::yield_within_api();
        }
    }
}

/// Copy `item` into the queue and update the count. Returns `true` if giving
/// a mutex requires a context switch.
///
/// The caller must have checked that there's room, or `position` must be
/// [`SendPosition::Overwrite`].
fn copy_data_to_queue<Traits: Port>(
    cb: &QueueCb<Traits>,
    st: &mut QueueState<Traits>,
    item: &[u8],
    position: SendPosition,
) -> bool {
    let mut count = cb.count();
    let mut reschedule = false;

    match &mut st.payload {
        Payload::Mutex(record) => {
            record.recursion = 0;
            if let Some(holder) = record.holder.take() {
                // Safety: CPU Lock active
                reschedule = unsafe { Traits::priority_disinherit(holder) };
            }
        }
        Payload::Ring(ring) => match position {
            SendPosition::Back => ring.push_back(item),
            SendPosition::Front => ring.push_front(item),
            SendPosition::Overwrite => {
                ring.push_front(item);
                count = count.saturating_sub(1);
            }
        },
    }

    cb.set_count(count + 1);
    reschedule
}

/// Copy the first item out of the queue, leaving the count and, for a mutex,
/// the holder to the caller.
fn copy_data_from_queue<Traits: Port>(st: &mut QueueState<Traits>, out: &mut [u8], peek: bool) {
    if let Payload::Ring(ring) = &mut st.payload {
        if peek {
            ring.peek_front(out);
        } else {
            ring.pop_front(out);
        }
    }
}

/// Tell a waiting receiver, or the enclosing queue set, that `cb` gained an
/// item placed at `position`. `overwrote` means the item replaced an existing
/// one. Returns `true` if a task with a higher priority than the current one
/// was woken up.
fn notify_item_available<Traits: Port>(
    cb: &'static QueueCb<Traits>,
    position: SendPosition,
    overwrote: bool,
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> bool {
    if let Some(set) = cb.st.read(&*lock).set_container {
        // The set already holds a notification for an overwritten item
        !overwrote && notify_set_container(set, cb, position, lock)
    } else if !Traits::is_wait_list_empty(&cb.wait_to_receive) {
        // Safety: CPU Lock active, the list is not empty
        unsafe { Traits::wake_from_wait_list(&cb.wait_to_receive) }
    } else {
        false
    }
}

/// Wake up a task waiting to send to `cb`, if any. Returns `true` if it has a
/// higher priority than the current one.
fn notify_space_available<Traits: Port>(cb: &QueueCb<Traits>) -> bool {
    // Safety: (for `wake_from_wait_list`) The caller holds CPU Lock
    !Traits::is_wait_list_empty(&cb.wait_to_send)
        && unsafe { Traits::wake_from_wait_list(&cb.wait_to_send) }
}

/// Encode a member queue as a queue set item.
pub(super) fn set_item_from_member<Traits: Port>(
    member: &'static QueueCb<Traits>,
) -> [u8; mem::size_of::<usize>()] {
    (member as *const QueueCb<Traits> as usize).to_ne_bytes()
}

/// Decode a queue set item produced by [`set_item_from_member`].
///
/// # Safety
///
/// `item` must have been produced by `set_item_from_member` for a queue that
/// still exists.
#[cfg(feature = "queue_set")]
pub(super) unsafe fn member_from_set_item<Traits: Port>(
    item: [u8; mem::size_of::<usize>()],
) -> &'static QueueCb<Traits> {
    // Safety: Upheld by the caller
    unsafe { &*(usize::from_ne_bytes(item) as *const QueueCb<Traits>) }
}

/// Post `member` into `set` and wake up a task waiting on the set. Returns
/// `true` if that task has a higher priority than the current one.
///
/// An item sent to the front of the member is announced at the front of the
/// set. Anything else is announced at the back. If the set is soft-locked,
/// the wake-up is deferred to whoever unlocks it.
fn notify_set_container<Traits: Port>(
    set: &'static QueueCb<Traits>,
    member: &'static QueueCb<Traits>,
    position: SendPosition,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) -> bool {
    assert!(
        set.count() < set.capacity,
        "queue set #{} overflowed; its capacity must cover every member's capacity",
        set.trace_number()
    );
    log::trace!(
        "relay {:?} #{} to set #{}",
        member.kind,
        member.trace_number(),
        set.trace_number()
    );

    let position = match position {
        SendPosition::Front => SendPosition::Front,
        SendPosition::Back | SendPosition::Overwrite => SendPosition::Back,
    };
    let st = set.st.write(&mut *lock);
    copy_data_to_queue(set, st, &set_item_from_member(member), position);
    if st.tx_lock.defer() {
        false
    } else {
        notify_item_available(set, position, false, lock)
    }
}

/// Raise the soft locks of `cb`.
pub(super) fn lock_queue<Traits: Port>(cb: &QueueCb<Traits>) {
    let mut lock = klock::enter_critical::<Traits>();
    let st = cb.st.write(&mut *lock);
    if st.rx_lock == SoftLock::Unlocked {
        st.rx_lock = SoftLock::Locked(0);
    }
    if st.tx_lock == SoftLock::Unlocked {
        st.tx_lock = SoftLock::Locked(0);
    }
}

/// Release the soft locks of `cb`, performing the wake-ups that interrupt
/// handlers deferred while it was locked. The scheduler must be suspended,
/// so the wake-ups of higher-priority tasks are reported as missed yields.
pub(super) fn unlock_queue<Traits: Port>(cb: &'static QueueCb<Traits>) {
    {
        let mut lock = klock::enter_critical::<Traits>();
        let st = cb.st.write(&mut *lock);
        let mut deferred = match mem::replace(&mut st.tx_lock, SoftLock::Unlocked) {
            SoftLock::Locked(n) => n,
            SoftLock::Unlocked => 0,
        };
        let set_container = st.set_container;

        while deferred > 0 {
            let woken = if let Some(set) = set_container {
                // The original placement isn't recorded
                notify_set_container(set, cb, SendPosition::Back, lock.borrow_mut())
            } else if Traits::is_wait_list_empty(&cb.wait_to_receive) {
                break;
            } else {
                // Safety: CPU Lock active, the list is not empty
                unsafe { Traits::wake_from_wait_list(&cb.wait_to_receive) }
            };
            if woken {
                Traits::missed_yield();
            }
            deferred -= 1;
        }
    }

    {
        let mut lock = klock::enter_critical::<Traits>();
        let st = cb.st.write(&mut *lock);
        let mut deferred = match mem::replace(&mut st.rx_lock, SoftLock::Unlocked) {
            SoftLock::Locked(n) => n,
            SoftLock::Unlocked => 0,
        };

        while deferred > 0 && !Traits::is_wait_list_empty(&cb.wait_to_send) {
            // Safety: CPU Lock active, the list is not empty
            if unsafe { Traits::wake_from_wait_list(&cb.wait_to_send) } {
                Traits::missed_yield();
            }
            deferred -= 1;
        }
    }
}

/// Check the timeout of a blocked operation. The first call records the
/// starting point.
fn check_timeout<Traits: Port>(timeout: &mut TimeOut, ticks_to_wait: &mut UTicks) -> bool {
    let _lock = klock::enter_critical::<Traits>();
    timeout.check::<Traits>(ticks_to_wait)
}

#[track_caller]
fn expect_blocking_allowed<Traits: Port>(ticks_to_wait: UTicks) {
    assert!(
        ticks_to_wait == 0 || Traits::is_task_context(),
        "only a task can wait on a queue"
    );
}

pub(super) fn generic_send<Traits: Port>(
    cb: &'static QueueCb<Traits>,
    item: &[u8],
    mut ticks_to_wait: UTicks,
    position: SendPosition,
) -> Result<(), SendError> {
    assert_eq!(item.len(), cb.item_size, "item size mismatch");
    assert!(
        position != SendPosition::Overwrite || cb.capacity == 1,
        "only a queue of capacity one can be overwritten"
    );
    expect_blocking_allowed::<Traits>(ticks_to_wait);

    let mut timeout = None;

    loop {
        let mut lock = klock::enter_critical::<Traits>();

        let count = cb.count();
        if count < cb.capacity || position == SendPosition::Overwrite {
            log::trace!("send to {:?} #{}", cb.kind, cb.trace_number());

            let mut reschedule =
                copy_data_to_queue(cb, cb.st.write(&mut *lock), item, position);
            let overwrote = position == SendPosition::Overwrite && count > 0;
            reschedule |= notify_item_available(cb, position, overwrote, lock.borrow_mut());
            drop(lock);

            if reschedule {
                Traits::yield_within_api();
            }
            return Ok(());
        }

        if ticks_to_wait == 0 {
            log::trace!("send to {:?} #{} failed: full", cb.kind, cb.trace_number());
            return Err(SendError::Full);
        }

        let timeout = timeout.get_or_insert_with(TimeOut::now::<Traits>);
        drop(lock);

        // Interrupts may change the queue from here on, but tasks can't
        Traits::suspend_scheduler();
        lock_queue(cb);

        if check_timeout::<Traits>(timeout, &mut ticks_to_wait) {
            unlock_queue(cb);
            Traits::resume_scheduler();
            log::trace!("send to {:?} #{} timed out", cb.kind, cb.trace_number());
            return Err(SendError::Full);
        }

        if cb.count() == cb.capacity {
            log::trace!(
                "block on send to {:?} #{} for {ticks_to_wait} ticks",
                cb.kind,
                cb.trace_number()
            );
            // Safety: The scheduler is suspended
            unsafe { Traits::place_on_wait_list(&cb.wait_to_send, ticks_to_wait) };

            // Room made by interrupts while the queue was locked wakes us up
            // here, before we actually sleep
            unlock_queue(cb);

            if !Traits::resume_scheduler() {
                Traits::yield_within_api();
            }
        } else {
            // Room became available; try again
            unlock_queue(cb);
            Traits::resume_scheduler();
        }
    }
}

pub(super) fn generic_receive<Traits: Port>(
    cb: &'static QueueCb<Traits>,
    out: &mut [u8],
    mut ticks_to_wait: UTicks,
    peek: bool,
) -> Result<(), ReceiveError> {
    assert_eq!(out.len(), cb.item_size, "item size mismatch");
    expect_blocking_allowed::<Traits>(ticks_to_wait);

    let mut timeout = None;

    loop {
        let mut lock = klock::enter_critical::<Traits>();

        let count = cb.count();
        if count > 0 {
            let st = cb.st.write(&mut *lock);
            copy_data_from_queue(st, out, peek);

            let reschedule = if peek {
                log::trace!("peek {:?} #{}", cb.kind, cb.trace_number());
                // The item is still there for other receivers
                notify_item_available_to_task(cb)
            } else {
                log::trace!("receive from {:?} #{}", cb.kind, cb.trace_number());
                if let Payload::Mutex(record) = &mut st.payload {
                    // A recursive mutex taken this way is held once
                    record.holder = Some(Traits::current_task());
                    record.recursion = 1;
                }
                cb.set_count(count - 1);
                notify_space_available(cb)
            };
            drop(lock);

            if reschedule {
                Traits::yield_within_api();
            }
            return Ok(());
        }

        if ticks_to_wait == 0 {
            log::trace!("receive from {:?} #{} failed: empty", cb.kind, cb.trace_number());
            return Err(ReceiveError::Empty);
        }

        let timeout = timeout.get_or_insert_with(TimeOut::now::<Traits>);
        drop(lock);

        Traits::suspend_scheduler();
        lock_queue(cb);

        if check_timeout::<Traits>(timeout, &mut ticks_to_wait) {
            unlock_queue(cb);
            Traits::resume_scheduler();
            if cb.count() == 0 {
                log::trace!("receive from {:?} #{} timed out", cb.kind, cb.trace_number());
                return Err(ReceiveError::Empty);
            }
            // An item arrived just as the timeout elapsed
            continue;
        }

        if cb.count() == 0 {
            if cb.kind.is_mutex() {
                let lock = klock::enter_critical::<Traits>();
                if let Payload::Mutex(MutexRecord {
                    holder: Some(holder),
                    ..
                }) = cb.st.read(&*lock).payload
                {
                    // Safety: CPU Lock active
                    unsafe { Traits::priority_inherit(holder) };
                }
            }

            log::trace!(
                "block on receive from {:?} #{} for {ticks_to_wait} ticks",
                cb.kind,
                cb.trace_number()
            );
            // Safety: The scheduler is suspended
            unsafe { Traits::place_on_wait_list(&cb.wait_to_receive, ticks_to_wait) };
            unlock_queue(cb);

            if !Traits::resume_scheduler() {
                Traits::yield_within_api();
            }
        } else {
            unlock_queue(cb);
            Traits::resume_scheduler();
        }
    }
}

/// Wake up another task waiting to receive from `cb` after a peek. Unlike
/// [`notify_item_available`], this never goes through the queue set since
/// the set already has a notification for the item.
fn notify_item_available_to_task<Traits: Port>(cb: &QueueCb<Traits>) -> bool {
    // Safety: (for `wake_from_wait_list`) The caller holds CPU Lock
    !Traits::is_wait_list_empty(&cb.wait_to_receive)
        && unsafe { Traits::wake_from_wait_list(&cb.wait_to_receive) }
}

#[track_caller]
fn expect_not_mutex<Traits: Port>(cb: &QueueCb<Traits>) {
    assert!(
        !cb.kind.is_mutex(),
        "a mutex can't be used from an interrupt handler"
    );
}

fn send_from_isr<Traits: Port>(
    cb: &'static QueueCb<Traits>,
    item: &[u8],
    position: SendPosition,
) -> Result<bool, SendError> {
    assert_eq!(item.len(), cb.item_size, "item size mismatch");
    assert!(
        position != SendPosition::Overwrite || cb.capacity == 1,
        "only a queue of capacity one can be overwritten"
    );
    expect_not_mutex(cb);

    let mut lock = klock::enter_critical_from_isr::<Traits>();

    let count = cb.count();
    if count < cb.capacity || position == SendPosition::Overwrite {
        log::trace!("send to {:?} #{} from ISR", cb.kind, cb.trace_number());

        let st = cb.st.write(&mut *lock);
        copy_data_to_queue(cb, st, item, position);

        let overwrote = position == SendPosition::Overwrite && count > 0;
        if overwrote && st.set_container.is_some() {
            // The set already holds a notification for this member
            Ok(false)
        } else if st.tx_lock.defer() {
            // The task that locked the queue will notify on our behalf
            Ok(false)
        } else {
            Ok(notify_item_available(cb, position, overwrote, lock.borrow_mut()))
        }
    } else {
        log::trace!("send to {:?} #{} from ISR failed: full", cb.kind, cb.trace_number());
        Err(SendError::Full)
    }
}

fn receive_from_isr<Traits: Port>(
    cb: &'static QueueCb<Traits>,
    out: &mut [u8],
) -> Result<bool, ReceiveError> {
    assert_eq!(out.len(), cb.item_size, "item size mismatch");
    expect_not_mutex(cb);

    let mut lock = klock::enter_critical_from_isr::<Traits>();

    let count = cb.count();
    if count > 0 {
        log::trace!("receive from {:?} #{} from ISR", cb.kind, cb.trace_number());

        let st = cb.st.write(&mut *lock);
        copy_data_from_queue(st, out, false);
        cb.set_count(count - 1);

        if st.rx_lock.defer() {
            Ok(false)
        } else {
            Ok(notify_space_available(cb))
        }
    } else {
        log::trace!("receive from {:?} #{} from ISR failed: empty", cb.kind, cb.trace_number());
        Err(ReceiveError::Empty)
    }
}

fn peek_from_isr<Traits: Port>(
    cb: &'static QueueCb<Traits>,
    out: &mut [u8],
) -> Result<(), ReceiveError> {
    assert_eq!(out.len(), cb.item_size, "item size mismatch");
    expect_not_mutex(cb);

    let mut lock = klock::enter_critical_from_isr::<Traits>();

    if cb.count() > 0 {
        log::trace!("peek {:?} #{} from ISR", cb.kind, cb.trace_number());
        copy_data_from_queue(cb.st.write(&mut *lock), out, true);
        Ok(())
    } else {
        log::trace!("peek {:?} #{} from ISR failed: empty", cb.kind, cb.trace_number());
        Err(ReceiveError::Empty)
    }
}
