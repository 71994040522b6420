//! Queue engine tests driven by a single-threaded mock port
use assert_matches::assert_matches;
use std::{vec, vec::Vec};

use self::mock::{Event, MockTraits};
use crate::{queue, *};


type TestQueue = Queue<MockTraits>;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
    mock::reset();
}

fn receive_u8(queue: TestQueue) -> Result<u8, ReceiveError> {
    let mut out = [0];
    queue.receive(&mut out, 0)?;
    Ok(out[0])
}

#[test]
fn fifo_until_full() {
    init();
    let queue = TestQueue::new(3, 1);

    for x in 1..=3 {
        assert_eq!(queue.send_to_back(&[x], 0), Ok(()));
    }
    assert_eq!(queue.send_to_back(&[4], 0), Err(SendError::Full));
    assert_eq!(queue.messages_waiting(), 3);
    assert_eq!(queue.spaces_available(), 0);

    assert_eq!(receive_u8(queue), Ok(1));
    assert_eq!(queue.send_to_back(&[4], 0), Ok(()));
    assert_eq!(
        (0..3).map(|_| receive_u8(queue).unwrap()).collect::<Vec<_>>(),
        vec![2, 3, 4]
    );
    assert_eq!(receive_u8(queue), Err(ReceiveError::Empty));
    assert!(mock::take_events().is_empty());
}

#[test]
fn send_to_front_jumps_the_line() {
    init();
    let queue = TestQueue::new(4, 1);
    queue.send_to_back(&[1], 0).unwrap();
    queue.send_to_back(&[2], 0).unwrap();
    queue.send_to_front(&[0], 0).unwrap();

    assert_eq!(receive_u8(queue), Ok(0));
    assert_eq!(receive_u8(queue), Ok(1));
    assert_eq!(receive_u8(queue), Ok(2));
}

#[test]
fn full_queue_is_left_unchanged() {
    init();
    let queue = TestQueue::new(2, 2);
    queue.send_to_back(&[1, 2], 0).unwrap();
    queue.send_to_back(&[3, 4], 0).unwrap();

    assert_eq!(queue.send_to_front(&[9, 9], 0), Err(SendError::Full));
    assert!(queue.is_full_from_isr());

    let mut out = [0; 2];
    queue.receive(&mut out, 0).unwrap();
    assert_eq!(out, [1, 2]);
    queue.receive(&mut out, 0).unwrap();
    assert_eq!(out, [3, 4]);
    assert!(queue.is_empty_from_isr());
}

#[test]
fn overwrite_keeps_last_value() {
    init();
    let queue = TestQueue::new(1, 1);
    queue.overwrite(&[5]);
    queue.overwrite(&[5]);
    assert_eq!(queue.messages_waiting(), 1);
    queue.overwrite(&[6]);
    assert_eq!(queue.messages_waiting(), 1);
    assert_eq!(receive_u8(queue), Ok(6));
    assert_eq!(queue.messages_waiting(), 0);
}

#[test]
#[should_panic = "overwritten"]
fn overwrite_needs_capacity_one() {
    TestQueue::new(2, 1).overwrite(&[0]);
}

#[test]
#[should_panic = "item size mismatch"]
fn wrong_item_size() {
    let _ = TestQueue::new(2, 4).send_to_back(&[0; 3], 0);
}

#[test]
fn peek_leaves_item() {
    init();
    let queue = TestQueue::new(2, 1);
    queue.send_to_back(&[7], 0).unwrap();

    let mut out = [0];
    queue.peek(&mut out, 0).unwrap();
    assert_eq!(out, [7]);
    queue.peek(&mut out, 0).unwrap();
    assert_eq!(queue.messages_waiting(), 1);
    assert_eq!(receive_u8(queue), Ok(7));
}

#[test]
fn values() {
    init();
    let queue = TestQueue::new(2, 8);
    queue
        .send_value(&0x0123_4567_89ab_cdefu64, 0, SendPosition::Back)
        .unwrap();
    assert_eq!(queue.receive_value::<u64>(0), Ok(0x0123_4567_89ab_cdef));
    assert_eq!(queue.receive_value::<u64>(0), Err(ReceiveError::Empty));
}

#[test]
fn receive_times_out() {
    init();
    let queue = TestQueue::new(1, 1);
    let start = mock::tick_count();

    assert_eq!(queue.receive(&mut [0], 3), Err(ReceiveError::Empty));

    // Each wait resumes with the remaining ticks until none remain
    assert_eq!(
        mock::take_events(),
        [
            Event::Placed(3),
            Event::Yield,
            Event::Placed(2),
            Event::Yield,
            Event::Placed(1),
            Event::Yield,
        ]
    );
    // The mock starts just before the tick count wraps around
    assert_eq!(mock::tick_count(), start.wrapping_add(3));
    assert!(mock::tick_count() < start);
}

#[test]
fn send_times_out() {
    init();
    let queue = TestQueue::new(1, 0);
    queue.send_to_back(&[], 0).unwrap();

    assert_eq!(queue.send_to_back(&[], 2), Err(SendError::Full));
    assert_eq!(
        mock::take_events(),
        [Event::Placed(2), Event::Yield, Event::Placed(1), Event::Yield]
    );
}

#[test]
fn send_wakes_receiver() {
    init();
    let queue = TestQueue::new(2, 1);
    queue.cb.wait_to_receive.push(5, 1);
    queue.cb.wait_to_receive.push(6, 3);
    queue.cb.wait_to_receive.push(7, 3);

    // The higher-priority task preempts the sender
    queue.send_to_back(&[1], 0).unwrap();
    assert_eq!(mock::take_events(), [Event::Woke(6), Event::Yield]);

    // Equal priority doesn't preempt
    mock::switch_to(2, 3);
    queue.send_to_back(&[2], 0).unwrap();
    assert_eq!(mock::take_events(), [Event::Woke(7)]);
    assert_eq!(queue.cb.wait_to_receive.tasks(), [5]);
}

#[test]
fn receive_wakes_sender_but_peek_wakes_receiver() {
    init();
    let queue = TestQueue::new(1, 1);
    queue.send_to_back(&[1], 0).unwrap();
    queue.cb.wait_to_send.push(5, 0);
    queue.cb.wait_to_receive.push(6, 0);

    queue.peek(&mut [0], 0).unwrap();
    assert_eq!(mock::take_events(), [Event::Woke(6)]);

    queue.receive(&mut [0], 0).unwrap();
    assert_eq!(mock::take_events(), [Event::Woke(5)]);
}

#[test]
fn reset_wakes_one_sender() {
    init();
    let queue = TestQueue::new(2, 1);
    queue.send_to_back(&[1], 0).unwrap();
    queue.send_to_back(&[2], 0).unwrap();
    queue.cb.wait_to_send.push(5, 9);
    queue.cb.wait_to_send.push(6, 9);
    queue.cb.wait_to_receive.push(7, 9);

    queue.reset();

    assert_eq!(mock::take_events(), [Event::Woke(5), Event::Yield]);
    assert_eq!(queue.cb.wait_to_send.tasks(), [6]);
    assert_eq!(queue.cb.wait_to_receive.tasks(), [7]);
    assert_eq!(queue.messages_waiting(), 0);
    queue.send_to_back(&[3], 0).unwrap();
    mock::take_events();
    assert_eq!(receive_u8(queue), Ok(3));
}

#[test]
fn isr_variants_never_block() {
    init();
    let queue = TestQueue::new(1, 1);
    mock::in_isr(|| {
        assert_eq!(queue.receive_from_isr(&mut [0]), Err(ReceiveError::Empty));
        assert_eq!(queue.peek_from_isr(&mut [0]), Err(ReceiveError::Empty));
        assert_eq!(queue.send_from_isr(&[1], SendPosition::Back), Ok(false));
        assert_eq!(
            queue.send_from_isr(&[2], SendPosition::Back),
            Err(SendError::Full)
        );
        assert_eq!(queue.messages_waiting_from_isr(), 1);
        let mut out = [0];
        assert_eq!(queue.peek_from_isr(&mut out), Ok(()));
        assert_eq!(queue.receive_from_isr(&mut out), Ok(false));
        assert_eq!(out, [1]);
    });
    assert!(mock::take_events().is_empty());
}

#[test]
#[should_panic = "only a task can wait"]
fn isr_cannot_wait() {
    let queue = TestQueue::new(1, 1);
    mock::in_isr(|| {
        let _ = queue.receive(&mut [0], 1);
    });
}

#[test]
fn isr_send_reports_preemption() {
    init();
    let queue = TestQueue::new(1, 1);
    queue.cb.wait_to_receive.push(5, 4);
    let woken = mock::in_isr(|| queue.send_from_isr(&[1], SendPosition::Back));
    assert_eq!(woken, Ok(true));
    assert_eq!(mock::take_events(), [Event::Woke(5)]);
}

#[test]
fn soft_lock_defers_isr_wake_ups() {
    init();
    let queue = TestQueue::new(2, 1);
    queue.cb.wait_to_receive.push(5, 4);

    MockTraits::suspend_scheduler();
    queue::lock_queue(queue.cb);

    let woken = mock::in_isr(|| queue.send_from_isr(&[1], SendPosition::Back));
    assert_eq!(woken, Ok(false));
    // The item is delivered but the waiter stays put
    assert_eq!(queue.messages_waiting_from_isr(), 1);
    assert_eq!(queue.cb.wait_to_receive.tasks(), [5]);
    assert!(mock::take_events().is_empty());

    queue::unlock_queue(queue.cb);
    MockTraits::resume_scheduler();
    assert_eq!(mock::take_events(), [Event::Woke(5), Event::MissedYield]);
}

#[test]
fn isr_variants_from_task() {
    init();
    let queue = TestQueue::new(1, 1);
    queue.cb.wait_to_receive.push(7, 2);

    // Wakes a higher-priority task but leaves the yield to the caller
    assert_eq!(queue.send_from_isr(&[5], SendPosition::Back), Ok(true));
    assert_eq!(mock::take_events(), [Event::Woke(7)]);
    assert!(!MockTraits::is_cpu_lock_active());

    let mut out = [0];
    assert_eq!(queue.peek_from_isr(&mut out), Ok(()));
    assert_eq!(queue.receive_from_isr(&mut out), Ok(false));
    assert_eq!(out, [5]);
    assert_eq!(queue.receive_from_isr(&mut out), Err(ReceiveError::Empty));
}

#[test]
fn soft_lock_defers_isr_space_notifications() {
    init();
    let queue = TestQueue::new(2, 1);
    queue.send_to_back(&[1], 0).unwrap();
    queue.send_to_back(&[2], 0).unwrap();
    queue.cb.wait_to_send.push(5, 0);
    queue.cb.wait_to_send.push(6, 0);

    MockTraits::suspend_scheduler();
    queue::lock_queue(queue.cb);
    let mut out = [0];
    assert_eq!(mock::in_isr(|| queue.receive_from_isr(&mut out)), Ok(false));
    assert!(mock::take_events().is_empty());
    queue::unlock_queue(queue.cb);
    MockTraits::resume_scheduler();

    // One item left, so only one sender is woken. Neither outranks the
    // current task.
    assert_eq!(mock::take_events(), [Event::Woke(5)]);
    assert_eq!(queue.cb.wait_to_send.tasks(), [6]);
}

#[test]
fn binary_semaphore() {
    init();
    let sem = Semaphore::<MockTraits>::new_binary(false);
    assert_eq!(sem.take(0), Err(ReceiveError::Empty));
    assert_eq!(sem.give(), Ok(()));
    assert_eq!(sem.give(), Err(SendError::Full));
    assert_eq!(sem.take(0), Ok(()));
    assert_eq!(sem.count(), 0);
}

#[test]
fn binary_semaphore_initially_available() {
    init();
    let sem = Semaphore::<MockTraits>::new_binary(true);
    assert_eq!(sem.count(), 1);
    assert_eq!(sem.give(), Err(SendError::Full));
    assert_eq!(sem.take(0), Ok(()));
    assert_eq!(Queue::from(sem).kind(), QueueKind::BinarySemaphore);
}

#[test]
fn counting_semaphore() {
    init();
    let sem = Semaphore::<MockTraits>::new_counting(3, 2);
    assert_eq!(sem.count(), 2);
    assert_eq!(sem.give(), Ok(()));
    assert_eq!(mock::in_isr(|| sem.give_from_isr()), Err(SendError::Full));
    for _ in 0..3 {
        assert_eq!(mock::in_isr(|| sem.take_from_isr()), Ok(false));
    }
    assert_eq!(sem.take(0), Err(ReceiveError::Empty));
    assert_eq!(Queue::from(sem).kind(), QueueKind::CountingSemaphore);
}

#[test]
#[should_panic = "exceeds the maximum count"]
fn counting_semaphore_initial_count_too_large() {
    Semaphore::<MockTraits>::new_counting(2, 3);
}

#[test]
fn mutex_inherits_priority_while_blocked() {
    init();
    let mutex = Mutex::<MockTraits>::new();
    assert_eq!(mutex.holder(), None);
    assert_eq!(mutex.take(0), Ok(()));
    assert_eq!(mutex.holder(), Some(1));

    mock::switch_to(2, 5);
    assert_eq!(mutex.take(1), Err(ReceiveError::Empty));
    assert_eq!(
        mock::take_events(),
        [Event::Inherit(1), Event::Placed(1), Event::Yield]
    );
    assert_eq!(mutex.give(), Err(GiveMutexError::NotOwner));

    mock::switch_to(1, 1);
    assert_eq!(mutex.give(), Ok(()));
    assert_eq!(mock::take_events(), [Event::Disinherit(1)]);
    assert_eq!(mutex.holder(), None);
    assert_eq!(mutex.give(), Err(GiveMutexError::NotOwner));
}

#[test]
#[should_panic = "interrupt handler"]
fn mutex_from_isr() {
    let mutex = Mutex::<MockTraits>::new();
    mock::in_isr(|| {
        let _ = mutex.as_queue().send_from_isr(&[], SendPosition::Back);
    });
}

#[test]
#[should_panic = "can't be reset"]
fn mutex_reset() {
    Mutex::<MockTraits>::new().as_queue().reset();
}

#[cfg(feature = "recursive_mutex")]
#[test]
fn recursive_mutex_balances() {
    init();
    let mutex = RecursiveMutex::<MockTraits>::new();
    mutex.take(0).unwrap();
    mutex.take(0).unwrap();
    assert_eq!(mutex.hold_count(), 2);
    mutex.as_queue().cb.wait_to_receive.push(2, 0);

    mutex.give().unwrap();
    assert_eq!(mutex.holder(), Some(1));
    assert!(mock::take_events().is_empty());

    mutex.give().unwrap();
    assert_eq!(mutex.holder(), None);
    assert_eq!(
        mock::take_events(),
        [Event::Disinherit(1), Event::Woke(2)]
    );
    assert_eq!(mutex.give(), Err(GiveMutexError::NotOwner));
}

#[cfg(feature = "recursive_mutex")]
#[test]
fn recursive_mutex_other_task() {
    init();
    let mutex = RecursiveMutex::<MockTraits>::new();
    mutex.take(0).unwrap();
    mock::switch_to(2, 1);
    assert_eq!(mutex.give(), Err(GiveMutexError::NotOwner));
    assert_eq!(mutex.take(0), Err(ReceiveError::Empty));
    assert_eq!(mutex.hold_count(), 1);
}

#[cfg(feature = "recursive_mutex")]
#[test]
fn recursive_mutex_taken_through_queue() {
    init();
    let mutex = RecursiveMutex::<MockTraits>::new();
    mutex.as_queue().receive(&mut [], 0).unwrap();
    assert_eq!(mutex.hold_count(), 1);

    mutex.give().unwrap();
    assert_eq!(mutex.holder(), None);
    assert_eq!(mutex.hold_count(), 0);
}

#[test]
fn delete_frees() {
    init();
    let queue = TestQueue::new(4, 16);
    queue.set_trace_number(3);
    assert_eq!(queue.trace_number(), 3);
    queue.send_to_back(&[0; 16], 0).unwrap();
    // Safety: `queue` isn't used afterward
    unsafe { queue.delete() };
}

#[test]
fn debug_output() {
    init();
    let queue = TestQueue::new(1, 1);
    let text = std::format!("{:?}", queue.cb);
    assert!(text.contains("rx_lock: Unlocked"), "{text}");
}

#[cfg(feature = "queue_set")]
mod set {
    use super::*;

    type TestSet = QueueSet<MockTraits>;

    #[test]
    fn select_returns_member() {
        init();
        let set = TestSet::new(4);
        let a = TestQueue::new(2, 1);
        let b = TestQueue::new(2, 1);
        set.add(a).unwrap();
        set.add(b).unwrap();

        assert_eq!(set.select(0), None);
        b.send_to_back(&[42], 0).unwrap();
        assert_eq!(set.select(MAX_DELAY), Some(b));
        assert_eq!(receive_u8(b), Ok(42));
        assert_eq!(set.select(0), None);
    }

    #[test]
    fn notifications_follow_placement() {
        init();
        let set = TestSet::new(5);
        let a = TestQueue::new(2, 1);
        let b = TestQueue::new(2, 1);
        let sem = Semaphore::<MockTraits>::new_binary(false);
        set.add(a).unwrap();
        set.add(b).unwrap();
        set.add(sem).unwrap();

        a.send_to_back(&[1], 0).unwrap();
        sem.give().unwrap();
        // Sent to the front, so announced first
        b.send_to_front(&[2], 0).unwrap();
        mock::in_isr(|| b.send_from_isr(&[3], SendPosition::Front)).unwrap();

        assert_eq!(set.select(0), Some(b));
        assert_eq!(set.select(0), Some(b));
        assert_eq!(set.select(0), Some(a));
        assert_eq!(set.select(0), Some(sem.as_queue()));
        assert_eq!(set.select(0), None);
    }

    #[test]
    fn overwrite_relays_once() {
        init();
        let set = TestSet::new(1);
        let mailbox = TestQueue::new(1, 1);
        set.add(mailbox).unwrap();
        mailbox.overwrite(&[1]);
        mailbox.overwrite(&[2]);
        assert_eq!(set.as_queue().messages_waiting(), 1);
    }

    #[test]
    fn membership_errors() {
        init();
        let set = TestSet::new(4);
        let other = TestSet::new(4);
        let a = TestQueue::new(2, 1);

        assert_eq!(set.remove(a), Err(RemoveFromSetError::NotMember));
        set.add(a).unwrap();
        assert_eq!(other.add(a), Err(AddToSetError::AlreadyMember));
        assert_eq!(set.add(a), Err(AddToSetError::AlreadyMember));
        assert_eq!(other.remove(a), Err(RemoveFromSetError::NotMember));

        a.send_to_back(&[1], 0).unwrap();
        assert_eq!(set.remove(a), Err(RemoveFromSetError::NotEmpty));
        assert_eq!(set.select(0), Some(a));
        receive_u8(a).unwrap();
        assert_eq!(set.remove(a), Ok(()));

        // No longer relayed
        a.send_to_back(&[2], 0).unwrap();
        assert_eq!(set.select(0), None);
        receive_u8(a).unwrap();
        assert_matches!(other.add(a), Ok(()));
    }

    #[test]
    #[should_panic = "must be empty"]
    fn add_non_empty() {
        let set = TestSet::new(4);
        let a = TestQueue::new(2, 1);
        a.send_to_back(&[1], 0).unwrap();
        let _ = set.add(a);
    }

    #[test]
    #[should_panic = "overflowed"]
    fn set_too_small() {
        let set = TestSet::new(1);
        let a = TestQueue::new(2, 1);
        set.add(a).unwrap();
        a.send_to_back(&[1], 0).unwrap();
        a.send_to_back(&[2], 0).unwrap();
    }

    #[test]
    fn set_waiter_woken_by_member() {
        init();
        let set = TestSet::new(2);
        let a = TestQueue::new(2, 1);
        set.add(a).unwrap();
        set.as_queue().cb.wait_to_receive.push(5, 2);
        a.cb.wait_to_receive.push(6, 2);

        // The set is notified instead of the member's own waiters
        a.send_to_back(&[1], 0).unwrap();
        assert_eq!(mock::take_events(), [Event::Woke(5), Event::Yield]);
        assert_eq!(a.cb.wait_to_receive.tasks(), [6]);
    }

    #[test]
    fn locked_set_defers_wake_up() {
        init();
        let set = TestSet::new(2);
        let a = TestQueue::new(2, 1);
        set.add(a).unwrap();
        set.as_queue().cb.wait_to_receive.push(5, 2);

        MockTraits::suspend_scheduler();
        queue::lock_queue(set.as_queue().cb);
        assert_eq!(
            mock::in_isr(|| a.send_from_isr(&[1], SendPosition::Back)),
            Ok(false)
        );
        assert!(mock::take_events().is_empty());
        assert_eq!(set.as_queue().messages_waiting_from_isr(), 1);

        queue::unlock_queue(set.as_queue().cb);
        MockTraits::resume_scheduler();
        assert_eq!(mock::take_events(), [Event::Woke(5), Event::MissedYield]);
        assert_eq!(set.select(0), Some(a));
    }

    #[test]
    fn locked_member_relays_on_unlock() {
        init();
        let set = TestSet::new(2);
        let a = TestQueue::new(2, 1);
        set.add(a).unwrap();

        MockTraits::suspend_scheduler();
        queue::lock_queue(a.cb);
        mock::in_isr(|| a.send_from_isr(&[1], SendPosition::Back)).unwrap();
        assert_eq!(set.as_queue().messages_waiting_from_isr(), 0);
        queue::unlock_queue(a.cb);
        MockTraits::resume_scheduler();

        assert_eq!(set.select(0), Some(a));
    }

    #[test]
    fn locked_mailbox_overwritten_from_isr() {
        init();
        let set = TestSet::new(1);
        let mailbox = TestQueue::new(1, 1);
        set.add(mailbox).unwrap();
        mailbox.overwrite(&[1]);

        MockTraits::suspend_scheduler();
        queue::lock_queue(mailbox.cb);
        assert_eq!(
            mock::in_isr(|| mailbox.send_from_isr(&[2], SendPosition::Overwrite)),
            Ok(false)
        );
        queue::unlock_queue(mailbox.cb);
        MockTraits::resume_scheduler();

        // Still one notification for one item
        assert_eq!(set.as_queue().messages_waiting(), 1);
        assert_eq!(set.select(0), Some(mailbox));
        assert_eq!(receive_u8(mailbox), Ok(2));
        assert_eq!(set.select(0), None);
    }

    #[test]
    fn select_from_isr() {
        init();
        let set = TestSet::new(2);
        let sem = Semaphore::<MockTraits>::new_binary(false);
        set.add(sem).unwrap();
        mock::in_isr(|| {
            assert_eq!(set.select_from_isr(), None);
            sem.give_from_isr().unwrap();
            assert_eq!(set.select_from_isr(), Some(sem.as_queue()));
            sem.take_from_isr().unwrap();
        });
    }
}
