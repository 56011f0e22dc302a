use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, unbounded};

use super::{MINUTE, epoch, manual_scheduler};
use crate::{
    errors::SchedulerError,
    lease_table::{ClockEvent, TimeOutUpdate, TimeoutScheduler},
    time_source::TimeSource,
};

type Fired = (u32, ClockEvent, &'static str);

fn recorder() -> (Sender<Fired>, Receiver<Fired>) {
    unbounded()
}

fn record(
    sender: &Sender<Fired>,
    tag: &'static str,
) -> impl FnOnce(TimeOutUpdate<u32>) + Send + 'static {
    let sender = sender.clone();
    move |update| {
        sender.send((*update.key(), update.event(), tag)).unwrap();
    }
}

fn drain(receiver: &Receiver<Fired>) -> Vec<Fired> {
    let mut fired: Vec<Fired> = receiver.try_iter().collect();
    fired.sort_by_key(|(key, _, _)| *key);
    fired
}

#[test]
fn test_insert_then_remove_tracks_earliest_deadline() {
    let (clock, scheduler) = manual_scheduler::<u32>();
    let now = epoch();

    scheduler.insert_silent(1, now + 10 * MINUTE).unwrap();
    scheduler.insert_silent(2, now + 20 * MINUTE).unwrap();
    assert_eq!(clock.interval(), 10 * MINUTE);
    assert!(clock.enabled());
    assert_eq!(scheduler.len(), 2);

    assert!(scheduler.remove(&2));
    assert_eq!(clock.interval(), 10 * MINUTE);
    assert!(clock.enabled());

    assert!(scheduler.remove(&1));
    assert!(!clock.enabled());
    assert!(scheduler.is_empty());
}

#[test]
fn test_reinsert_replaces_deadline_and_callback() {
    let (clock, scheduler) = manual_scheduler::<u32>();
    let (sender, receiver) = recorder();
    let now = epoch();

    scheduler.insert(1, now + 20 * MINUTE, record(&sender, "first")).unwrap();
    scheduler.insert(1, now + 10 * MINUTE, record(&sender, "second")).unwrap();

    assert_eq!(scheduler.len(), 1);
    assert_eq!(scheduler.expiry_of(&1), Some(now + 10 * MINUTE));
    assert_eq!(clock.interval(), 10 * MINUTE);

    clock.advance(25 * MINUTE);
    assert!(clock.raise_elapsed());

    assert_eq!(drain(&receiver), vec![(1, ClockEvent::TimedOut, "second")]);
    assert!(scheduler.is_empty());
}

#[test]
fn test_reinsert_with_later_deadline_moves_timer_back() {
    let (clock, scheduler) = manual_scheduler::<u32>();
    let now = epoch();

    scheduler.insert_silent(1, now + 10 * MINUTE).unwrap();
    scheduler.insert_silent(1, now + 30 * MINUTE).unwrap();

    assert_eq!(clock.interval(), 30 * MINUTE);
    assert_eq!(scheduler.next_expiry(), Some(now + 30 * MINUTE));
}

#[test]
fn test_already_expired_insert_fires_immediately() {
    let (clock, scheduler) = manual_scheduler::<u32>();
    let (sender, receiver) = recorder();
    let now = epoch();

    scheduler.insert_silent(1, now + 20 * MINUTE).unwrap();
    scheduler.insert(2, now - 20 * MINUTE, record(&sender, "late")).unwrap();

    assert_eq!(
        drain(&receiver),
        vec![(2, ClockEvent::AlreadyExpired, "late")]
    );
    assert!(!scheduler.contains(&2));
    assert!(scheduler.contains(&1));
    assert_eq!(scheduler.len(), 1);
    assert_eq!(clock.interval(), 20 * MINUTE);
    assert!(clock.enabled());
}

#[test]
fn test_deadline_equal_to_now_counts_as_expired() {
    let (_clock, scheduler) = manual_scheduler::<u32>();
    let (sender, receiver) = recorder();

    scheduler.insert(3, epoch(), record(&sender, "now")).unwrap();

    assert_eq!(drain(&receiver), vec![(3, ClockEvent::AlreadyExpired, "now")]);
    assert!(scheduler.is_empty());
}

#[test]
fn test_expired_insert_drops_live_lease_without_firing_it() {
    let (clock, scheduler) = manual_scheduler::<u32>();
    let (sender, receiver) = recorder();
    let now = epoch();

    scheduler.insert(1, now + 10 * MINUTE, record(&sender, "live")).unwrap();
    scheduler.insert(1, now - MINUTE, record(&sender, "late")).unwrap();

    assert_eq!(drain(&receiver), vec![(1, ClockEvent::AlreadyExpired, "late")]);
    assert!(scheduler.is_empty());
    assert!(!clock.enabled());

    clock.advance(15 * MINUTE);
    clock.raise_elapsed();
    assert!(drain(&receiver).is_empty());
}

#[test]
fn test_simultaneous_deadlines_fire_in_one_pass() {
    let (clock, scheduler) = manual_scheduler::<u32>();
    let (sender, receiver) = recorder();
    let deadline = epoch() + 5 * MINUTE;

    scheduler.insert(1, deadline, record(&sender, "a")).unwrap();
    scheduler.insert(2, deadline, record(&sender, "b")).unwrap();

    clock.advance(5 * MINUTE);
    clock.raise_elapsed();

    assert_eq!(
        drain(&receiver),
        vec![
            (1, ClockEvent::TimedOut, "a"),
            (2, ClockEvent::TimedOut, "b")
        ]
    );
    assert!(scheduler.is_empty());
    assert!(!clock.enabled());
}

#[test]
fn test_elapsed_evicts_only_due_leases_and_rearms() {
    let (clock, scheduler) = manual_scheduler::<u32>();
    let (sender, receiver) = recorder();
    let now = epoch();

    scheduler.insert(1, now + 10 * MINUTE, record(&sender, "t1")).unwrap();
    scheduler.insert(2, now + 20 * MINUTE, record(&sender, "t2")).unwrap();

    clock.advance(10 * MINUTE);
    clock.raise_elapsed();

    assert_eq!(drain(&receiver), vec![(1, ClockEvent::TimedOut, "t1")]);
    assert!(scheduler.contains(&2));
    assert!(clock.enabled());
    assert_eq!(clock.interval(), 10 * MINUTE);

    clock.advance(10 * MINUTE);
    clock.raise_elapsed();
    assert_eq!(drain(&receiver), vec![(2, ClockEvent::TimedOut, "t2")]);
    assert!(!clock.enabled());
}

#[test]
fn test_late_elapsed_evicts_every_overdue_lease() {
    let (clock, scheduler) = manual_scheduler::<u32>();
    let (sender, receiver) = recorder();
    let now = epoch();

    scheduler.insert(1, now + MINUTE, record(&sender, "1")).unwrap();
    scheduler.insert(2, now + 2 * MINUTE, record(&sender, "2")).unwrap();
    scheduler.insert(3, now + 3 * MINUTE, record(&sender, "3")).unwrap();
    scheduler.insert(4, now + 9 * MINUTE, record(&sender, "4")).unwrap();

    clock.advance(5 * MINUTE);
    clock.raise_elapsed();

    let fired: Vec<u32> = drain(&receiver).into_iter().map(|(key, _, _)| key).collect();
    assert_eq!(fired, vec![1, 2, 3]);
    assert_eq!(scheduler.keys(), vec![4]);
    assert_eq!(clock.interval(), 4 * MINUTE);
}

#[test]
fn test_early_elapsed_evicts_nothing() {
    let (clock, scheduler) = manual_scheduler::<u32>();
    let (sender, receiver) = recorder();

    scheduler.insert(1, epoch() + 10 * MINUTE, record(&sender, "1")).unwrap();
    clock.advance(4 * MINUTE);
    clock.raise_elapsed();

    assert!(drain(&receiver).is_empty());
    assert!(scheduler.contains(&1));
    assert!(clock.enabled());
    assert_eq!(clock.interval(), 6 * MINUTE);
}

#[test]
fn test_remove_absent_key_leaves_timer_alone() {
    let (clock, scheduler) = manual_scheduler::<u32>();
    scheduler.insert_silent(1, epoch() + 10 * MINUTE).unwrap();
    let arms = clock.arm_count();
    let disarms = clock.disarm_count();

    assert!(!scheduler.remove(&42));

    assert_eq!(clock.interval(), 10 * MINUTE);
    assert!(clock.enabled());
    assert_eq!(clock.arm_count(), arms);
    assert_eq!(clock.disarm_count(), disarms);
}

#[test]
fn test_conditional_remove_keeps_renewed_lease() {
    let (clock, scheduler) = manual_scheduler::<u32>();
    let now = epoch();

    scheduler.insert_silent(1, now + 10 * MINUTE).unwrap();
    scheduler.insert_silent(2, now + 20 * MINUTE).unwrap();

    assert!(!scheduler.remove_if_expires_at(&1, now + 5 * MINUTE));
    assert_eq!(scheduler.expiry_of(&1), Some(now + 10 * MINUTE));

    assert!(scheduler.remove_if_expires_at(&1, now + 10 * MINUTE));
    assert!(!scheduler.contains(&1));
    assert_eq!(clock.interval(), 20 * MINUTE);

    assert!(scheduler.remove_if_expires_at(&2, now + 30 * MINUTE));
    assert!(scheduler.remove_if_expires_at(&3, now));
    assert!(scheduler.is_empty());
    assert!(!clock.enabled());
}

#[test]
fn test_remove_on_empty_scheduler_is_noop() {
    let (clock, scheduler) = manual_scheduler::<u32>();
    let disarms = clock.disarm_count();

    assert!(!scheduler.remove(&1));
    assert!(!clock.enabled());
    assert_eq!(clock.disarm_count(), disarms);
}

#[test]
fn test_removed_lease_never_fires() {
    let (clock, scheduler) = manual_scheduler::<u32>();
    let (sender, receiver) = recorder();

    scheduler.insert(1, epoch() + MINUTE, record(&sender, "1")).unwrap();
    scheduler.insert(2, epoch() + 2 * MINUTE, record(&sender, "2")).unwrap();
    scheduler.remove(&1);
    assert_eq!(clock.interval(), 2 * MINUTE);

    clock.advance(3 * MINUTE);
    clock.raise_elapsed();
    assert_eq!(drain(&receiver), vec![(2, ClockEvent::TimedOut, "2")]);
}

#[test]
fn test_insert_after_dispose_is_rejected() {
    let (clock, scheduler) = manual_scheduler::<u32>();
    let (sender, receiver) = recorder();
    scheduler.insert(1, epoch() + MINUTE, record(&sender, "1")).unwrap();

    scheduler.dispose();
    scheduler.dispose();

    assert!(scheduler.is_disposed());
    assert!(clock.is_released());
    assert!(scheduler.is_empty());
    assert_eq!(
        scheduler.insert_silent(2, epoch() + MINUTE),
        Err(SchedulerError::Disposed)
    );
    assert_eq!(
        scheduler.insert(3, epoch() - MINUTE, record(&sender, "3")),
        Err(SchedulerError::Disposed)
    );
    assert!(!scheduler.remove(&1));

    clock.advance(2 * MINUTE);
    assert!(!clock.raise_elapsed());
    assert!(drain(&receiver).is_empty());
}

#[test]
fn test_dropping_last_handle_releases_time_source() {
    let (clock, scheduler) = manual_scheduler::<u32>();
    let other = scheduler.clone();
    let weak = scheduler.downgrade();

    drop(scheduler);
    assert!(!clock.is_released());
    drop(other);

    assert!(clock.is_released());
    assert!(weak.upgrade().is_none());
}

#[test]
fn test_enable_fault_during_elapsed_still_evicts_and_fires() {
    let (clock, scheduler) = manual_scheduler::<u32>();
    let (sender, receiver) = recorder();
    let now = epoch();

    scheduler.insert(1, now + MINUTE, record(&sender, "1")).unwrap();
    scheduler.insert(2, now + MINUTE, record(&sender, "2")).unwrap();
    scheduler.insert(3, now + 10 * MINUTE, record(&sender, "3")).unwrap();

    clock.fail_enabled_mutator(true);
    clock.advance(MINUTE);
    clock.raise_elapsed();

    let fired: Vec<u32> = drain(&receiver).into_iter().map(|(key, _, _)| key).collect();
    assert_eq!(fired, vec![1, 2]);
    assert_eq!(scheduler.keys(), vec![3]);
    assert!(!clock.enabled());

    clock.fail_enabled_mutator(false);
    scheduler.insert_silent(4, now + 5 * MINUTE).unwrap();
    assert!(clock.enabled());
    assert_eq!(clock.interval(), 4 * MINUTE);
}

#[test]
fn test_panicking_callback_does_not_stop_other_expiries() {
    let (clock, scheduler) = manual_scheduler::<u32>();
    let (sender, receiver) = recorder();
    let deadline = epoch() + MINUTE;

    scheduler
        .insert(1, deadline, |_| panic!("expiry callback failure"))
        .unwrap();
    scheduler.insert(2, deadline, record(&sender, "2")).unwrap();
    scheduler.insert(3, deadline + MINUTE, record(&sender, "3")).unwrap();

    clock.advance(MINUTE);
    clock.raise_elapsed();

    assert_eq!(drain(&receiver), vec![(2, ClockEvent::TimedOut, "2")]);
    assert_eq!(scheduler.keys(), vec![3]);
    assert_eq!(clock.interval(), MINUTE);

    clock.advance(MINUTE);
    clock.raise_elapsed();
    assert_eq!(drain(&receiver), vec![(3, ClockEvent::TimedOut, "3")]);
}

#[test]
fn test_callback_can_reenter_scheduler() {
    let (clock, scheduler) = manual_scheduler::<u32>();
    let (sender, receiver) = recorder();

    let weak = scheduler.downgrade();
    let renewed = record(&sender, "renewed");
    scheduler
        .insert(1, epoch() + MINUTE, move |update| {
            let scheduler = weak.upgrade().unwrap();
            scheduler.remove(update.key());
            scheduler
                .insert(*update.key(), update.expires_at() + MINUTE, renewed)
                .unwrap();
        })
        .unwrap();

    clock.advance(MINUTE);
    clock.raise_elapsed();
    assert!(scheduler.contains(&1));
    assert!(clock.enabled());
    assert_eq!(clock.interval(), MINUTE);

    clock.advance(MINUTE);
    clock.raise_elapsed();
    assert_eq!(drain(&receiver), vec![(1, ClockEvent::TimedOut, "renewed")]);
}

#[test]
fn test_timer_always_points_at_minimum() {
    let (clock, scheduler) = manual_scheduler::<u32>();
    let now = epoch();
    let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
    let mut next = move || {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        seed
    };

    for _ in 0..2_000 {
        let key = (next() % 32) as u32;
        if next() % 3 == 0 {
            scheduler.remove(&key);
        } else {
            let offset = Duration::from_secs(next() % 7_200);
            scheduler.insert_silent(key, now + offset).unwrap();
        }

        let expected_min = scheduler
            .keys()
            .iter()
            .filter_map(|key| scheduler.expiry_of(key))
            .min();
        assert_eq!(scheduler.next_expiry(), expected_min);
        match expected_min {
            Some(min) => {
                assert!(clock.enabled());
                assert_eq!(clock.interval(), min.duration_since(now).unwrap());
            }
            None => assert!(!clock.enabled()),
        }
    }
}

#[test]
fn test_concurrent_writers_keep_indexes_consistent() {
    let (clock, scheduler) = manual_scheduler::<u32>();
    let fired = Arc::new(AtomicUsize::new(0));
    let now = epoch();

    std::thread::scope(|scope| {
        for worker in 0..8u64 {
            let scheduler: TimeoutScheduler<u32> = scheduler.clone();
            let fired = fired.clone();
            scope.spawn(move || {
                for round in 0..500u64 {
                    let key = ((worker * 31 + round * 7) % 16) as u32;
                    match round % 4 {
                        0 => {
                            scheduler.remove(&key);
                        }
                        3 => {
                            let fired = fired.clone();
                            scheduler
                                .insert(key, now - MINUTE, move |_| {
                                    fired.fetch_add(1, Ordering::SeqCst);
                                })
                                .unwrap();
                        }
                        _ => {
                            let at = now + Duration::from_secs(60 + (worker * 500 + round));
                            scheduler.insert_silent(key, at).unwrap();
                        }
                    }
                }
            });
        }
    });

    assert_eq!(fired.load(Ordering::SeqCst), 8 * 125);
    let keys = scheduler.keys();
    assert_eq!(keys.len(), scheduler.len());
    let expected_min = keys.iter().filter_map(|key| scheduler.expiry_of(key)).min();
    assert_eq!(scheduler.next_expiry(), expected_min);
    match expected_min {
        Some(min) => assert_eq!(clock.interval(), min.duration_since(now).unwrap()),
        None => assert!(!clock.enabled()),
    }
}
