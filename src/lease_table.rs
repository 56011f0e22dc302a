pub use lease_key::LeaseKey;
pub use main_type::{ExpiryCallback, SchedulerBuilder, TimeoutScheduler, WeakTimeoutScheduler};
pub use time_update::{ClockEvent, TimeOutUpdate};

const LOG_TARGET: &str = "lease_clock::scheduler";

mod main_type {
    use std::{
        collections::{BTreeMap, HashMap, HashSet},
        panic::{AssertUnwindSafe, catch_unwind},
        sync::{Arc, Weak},
        time::{Duration, SystemTime},
    };

    use parking_lot::Mutex;

    use crate::{
        errors::{SchedulerError, TimeSourceError},
        time_source::TimeSource,
        timer_loop::ThreadTimeSource,
    };

    use super::{
        LOG_TARGET,
        lease_key::LeaseKey,
        time_update::{ClockEvent, TimeOutUpdate},
    };

    /// Called once when a lease reaches its deadline, or right away when inserted already expired.
    pub type ExpiryCallback<K> = Box<dyn FnOnce(TimeOutUpdate<K>) + Send + 'static>;

    struct LeaseEntry<K> {
        expires_at: SystemTime,
        on_expire: Option<ExpiryCallback<K>>,
    }

    /// Both indexes always hold the same key set.
    struct LeaseState<K: LeaseKey> {
        entries: HashMap<K, LeaseEntry<K>>,
        expiry_index: BTreeMap<SystemTime, HashSet<K>>,
        disposed: bool,
    }

    impl<K: LeaseKey> LeaseState<K> {
        fn new() -> Self {
            Self {
                entries: HashMap::new(),
                expiry_index: BTreeMap::new(),
                disposed: false,
            }
        }

        fn attach(&mut self, key: K, entry: LeaseEntry<K>) {
            self.expiry_index
                .entry(entry.expires_at)
                .or_default()
                .insert(key.clone());
            self.entries.insert(key, entry);
        }

        fn detach(&mut self, key: &K) -> Option<LeaseEntry<K>> {
            let entry = self.entries.remove(key)?;
            if let Some(keys) = self.expiry_index.get_mut(&entry.expires_at) {
                keys.remove(key);
                if keys.is_empty() {
                    self.expiry_index.remove(&entry.expires_at);
                }
            }
            Some(entry)
        }

        fn next_expiry(&self) -> Option<SystemTime> {
            self.expiry_index.first_key_value().map(|(at, _)| *at)
        }

        /// Evicts every lease whose deadline is at or before `now`.
        fn drain_expired(&mut self, now: SystemTime) -> Vec<(K, LeaseEntry<K>)> {
            let mut expired = vec![];
            while let Some(slot) = self.expiry_index.first_entry() {
                if *slot.key() > now {
                    break;
                }
                for key in slot.remove() {
                    if let Some(entry) = self.entries.remove(&key) {
                        expired.push((key, entry));
                    }
                }
            }
            expired
        }

        fn clear(&mut self) -> HashMap<K, LeaseEntry<K>> {
            self.expiry_index.clear();
            std::mem::take(&mut self.entries)
        }
    }

    struct SchedulerShared<K: LeaseKey> {
        state: Mutex<LeaseState<K>>,
        time_source: Arc<dyn TimeSource>,
    }

    impl<K: LeaseKey> SchedulerShared<K> {
        /// Points the time source at the earliest deadline, or stops it when nothing is left.
        /// Must be called with the state lock held.
        fn rearm(&self, state: &LeaseState<K>) -> Result<(), TimeSourceError> {
            match state.next_expiry() {
                Some(next) => {
                    let interval = next
                        .duration_since(self.time_source.now())
                        .unwrap_or(Duration::ZERO);
                    self.time_source.set_interval(interval)?;
                    self.time_source.set_enabled(true)
                }
                None => self.time_source.set_enabled(false),
            }
        }

        fn rearm_or_log(&self, state: &LeaseState<K>) {
            if let Err(e) = self.rearm(state) {
                log::error!(target: LOG_TARGET, "unable to re-arm time source [{}]", e);
            }
        }

        fn handle_elapsed(&self) {
            let expired = {
                let mut state = self.state.lock();
                if state.disposed {
                    return;
                }
                let now = self.time_source.now();
                let expired = state.drain_expired(now);
                self.rearm_or_log(&state);
                expired
            };

            if !expired.is_empty() {
                log::debug!(target: LOG_TARGET, "{} lease(s) expired", expired.len());
            }
            // Callbacks run unlocked: they are free to call back into the scheduler.
            for (key, entry) in expired {
                if let Some(on_expire) = entry.on_expire {
                    invoke(
                        on_expire,
                        TimeOutUpdate::new(key, ClockEvent::TimedOut, entry.expires_at),
                    );
                }
            }
        }
    }

    impl<K: LeaseKey> Drop for SchedulerShared<K> {
        fn drop(&mut self) {
            self.time_source.release();
        }
    }

    fn invoke<K: LeaseKey>(on_expire: ExpiryCallback<K>, update: TimeOutUpdate<K>) {
        let key = update.key().clone();
        if catch_unwind(AssertUnwindSafe(move || on_expire(update))).is_err() {
            log::error!(target: LOG_TARGET, "expiry callback for [{:?}] panicked", key);
        }
    }

    pub struct SchedulerBuilder<K: LeaseKey> {
        time_source: Option<Arc<dyn TimeSource>>,
        phantom_data: std::marker::PhantomData<K>,
    }

    impl<K: LeaseKey> SchedulerBuilder<K> {
        /// Defaults to a fresh [`ThreadTimeSource`] when not set.
        pub fn time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
            self.time_source = Some(time_source);
            self
        }

        /// Fails only when the default [`ThreadTimeSource`] cannot spawn its thread.
        pub fn build(self) -> Result<TimeoutScheduler<K>, SchedulerError> {
            let time_source = match self.time_source {
                Some(time_source) => time_source,
                None => Arc::new(ThreadTimeSource::new()?),
            };
            Ok(TimeoutScheduler::with_time_source(time_source))
        }
    }

    impl<K: LeaseKey> TimeoutScheduler<K> {
        fn with_time_source(time_source: Arc<dyn TimeSource>) -> Self {
            let shared = Arc::new(SchedulerShared {
                state: Mutex::new(LeaseState::new()),
                time_source,
            });

            let weak: Weak<SchedulerShared<K>> = Arc::downgrade(&shared);
            shared.time_source.on_elapsed(Arc::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_elapsed();
                }
            }));
            if let Err(e) = shared.time_source.set_enabled(false) {
                log::error!(target: LOG_TARGET, "unable to reset time source [{}]", e);
            }

            TimeoutScheduler { shared }
        }
    }

    /// Tracks keys with absolute deadlines and fires their callbacks when the deadlines pass.
    ///
    /// A single [`TimeSource`] countdown is kept armed for the earliest deadline: it is
    /// re-armed on every insertion, on removal of the earliest lease, and after each elapsed
    /// pass, and stopped whenever no lease is left. All state transitions, time source
    /// reads and writes included, go through one lock. Expiry callbacks always run after
    /// that lock is released.
    pub struct TimeoutScheduler<K: LeaseKey> {
        shared: Arc<SchedulerShared<K>>,
    }

    impl<K: LeaseKey> Clone for TimeoutScheduler<K> {
        fn clone(&self) -> Self {
            Self {
                shared: self.shared.clone(),
            }
        }
    }

    pub struct WeakTimeoutScheduler<K: LeaseKey> {
        shared: Weak<SchedulerShared<K>>,
    }

    impl<K: LeaseKey> Clone for WeakTimeoutScheduler<K> {
        fn clone(&self) -> Self {
            Self {
                shared: self.shared.clone(),
            }
        }
    }

    impl<K: LeaseKey> WeakTimeoutScheduler<K> {
        pub fn upgrade(&self) -> Option<TimeoutScheduler<K>> {
            self.shared
                .upgrade()
                .map(|shared| TimeoutScheduler { shared })
        }
    }

    impl<K: LeaseKey> TimeoutScheduler<K> {
        pub fn builder() -> SchedulerBuilder<K> {
            SchedulerBuilder {
                time_source: None,
                phantom_data: std::marker::PhantomData,
            }
        }

        pub fn new(time_source: Arc<dyn TimeSource>) -> Self {
            Self::with_time_source(time_source)
        }

        pub fn time_source(&self) -> &Arc<dyn TimeSource> {
            &self.shared.time_source
        }

        /// Handle for expiry callbacks: they live inside the scheduler and must not keep it
        /// alive.
        pub fn downgrade(&self) -> WeakTimeoutScheduler<K> {
            WeakTimeoutScheduler {
                shared: Arc::downgrade(&self.shared),
            }
        }

        /// Inserts or replaces the lease for `key`.
        ///
        /// A deadline at or before `now` never makes the lease live: any previous lease for
        /// `key` is dropped without firing, and `on_expire` runs right away on the calling
        /// thread with [`ClockEvent::AlreadyExpired`].
        ///
        /// ### Example
        /// ```rust
        /// # use std::{sync::Arc, time::{Duration, SystemTime}};
        /// # use lease_clock::{ManualTimeSource, TimeoutScheduler};
        /// let clock = Arc::new(ManualTimeSource::new(SystemTime::now()));
        /// let scheduler = TimeoutScheduler::<u32>::new(clock.clone());
        /// scheduler
        ///     .insert(7, SystemTime::now() + Duration::from_secs(60), |update| {
        ///         println!("lease {:?} is over", update.key());
        ///     })
        ///     .unwrap();
        /// assert!(scheduler.contains(&7));
        /// ```
        pub fn insert<F>(
            &self,
            key: K,
            expires_at: SystemTime,
            on_expire: F,
        ) -> Result<(), SchedulerError>
        where
            F: FnOnce(TimeOutUpdate<K>) + Send + 'static,
        {
            let on_expire: ExpiryCallback<K> = Box::new(on_expire);
            self.insert_entry(key, expires_at, Some(on_expire))
        }

        /// Same as [`insert`](Self::insert), with nothing to call on expiry.
        pub fn insert_silent(&self, key: K, expires_at: SystemTime) -> Result<(), SchedulerError> {
            self.insert_entry(key, expires_at, None)
        }

        pub fn insert_entry(
            &self,
            key: K,
            expires_at: SystemTime,
            on_expire: Option<ExpiryCallback<K>>,
        ) -> Result<(), SchedulerError> {
            let shared = &self.shared;
            let mut state = shared.state.lock();
            if state.disposed {
                return Err(SchedulerError::Disposed);
            }

            if expires_at <= shared.time_source.now() {
                let superseded = state.detach(&key);
                if superseded.is_some() {
                    shared.rearm_or_log(&state);
                }
                drop(state);
                drop(superseded);

                log::debug!(target: LOG_TARGET, "lease [{:?}] inserted already expired", key);
                if let Some(on_expire) = on_expire {
                    invoke(
                        on_expire,
                        TimeOutUpdate::new(key, ClockEvent::AlreadyExpired, expires_at),
                    );
                }
                return Ok(());
            }

            let superseded = state.detach(&key);
            state.attach(
                key,
                LeaseEntry {
                    expires_at,
                    on_expire,
                },
            );
            shared.rearm_or_log(&state);
            drop(state);
            drop(superseded);
            Ok(())
        }

        /// Removes the lease for `key` without firing it. Returns `false` when there was none,
        /// or when the scheduler is disposed.
        pub fn remove(&self, key: &K) -> bool {
            let shared = &self.shared;
            let mut state = shared.state.lock();
            if state.disposed {
                return false;
            }
            let Some(removed) = state.detach(key) else {
                return false;
            };
            let was_earliest = state
                .next_expiry()
                .is_none_or(|next| removed.expires_at < next);
            if was_earliest {
                shared.rearm_or_log(&state);
            }
            drop(state);
            drop(removed);
            true
        }

        /// Removes the lease for `key` unless it was renewed past `expires_at`.
        ///
        /// Meant for expiry callbacks: between the eviction of a lease and its callback, the
        /// key may have been inserted again. Returns `false` when such a newer lease is live
        /// and was kept, `true` when no lease for `key` is left.
        pub fn remove_if_expires_at(&self, key: &K, expires_at: SystemTime) -> bool {
            let shared = &self.shared;
            let mut state = shared.state.lock();
            if state.disposed {
                return true;
            }
            if state
                .entries
                .get(key)
                .is_some_and(|entry| entry.expires_at > expires_at)
            {
                return false;
            }
            let Some(removed) = state.detach(key) else {
                return true;
            };
            let was_earliest = state
                .next_expiry()
                .is_none_or(|next| removed.expires_at < next);
            if was_earliest {
                shared.rearm_or_log(&state);
            }
            drop(state);
            drop(removed);
            true
        }

        /// Drops every lease without firing, and releases the time source. Idempotent.
        pub fn dispose(&self) {
            let dropped = {
                let mut state = self.shared.state.lock();
                if state.disposed {
                    return;
                }
                state.disposed = true;
                state.clear()
            };
            // Outside the lock: a thread-backed source joins its thread, which may be
            // waiting on that lock inside the elapsed handler.
            self.shared.time_source.release();
            log::info!(
                target: LOG_TARGET,
                "scheduler disposed, {} lease(s) dropped",
                dropped.len()
            );
        }

        pub fn is_disposed(&self) -> bool {
            self.shared.state.lock().disposed
        }

        pub fn contains(&self, key: &K) -> bool {
            self.shared.state.lock().entries.contains_key(key)
        }

        pub fn expiry_of(&self, key: &K) -> Option<SystemTime> {
            self.shared
                .state
                .lock()
                .entries
                .get(key)
                .map(|entry| entry.expires_at)
        }

        /// Earliest live deadline.
        pub fn next_expiry(&self) -> Option<SystemTime> {
            self.shared.state.lock().next_expiry()
        }

        pub fn len(&self) -> usize {
            self.shared.state.lock().entries.len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        pub fn keys(&self) -> Vec<K> {
            self.shared.state.lock().entries.keys().cloned().collect()
        }
    }
}

mod time_update {
    use std::{fmt::Display, time::SystemTime};

    use super::lease_key::LeaseKey;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum ClockEvent {
        /// Evicted by the time source.
        TimedOut,
        /// The deadline had already passed when the lease was inserted.
        AlreadyExpired,
    }

    impl Display for ClockEvent {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::TimedOut => write!(f, "Lease timed out"),
                Self::AlreadyExpired => write!(f, "Lease already expired"),
            }
        }
    }

    /// Information passed to an expiry callback.
    pub struct TimeOutUpdate<K> {
        key: K,
        event: ClockEvent,
        expires_at: SystemTime,
    }

    impl<K: LeaseKey> TimeOutUpdate<K> {
        pub fn new(key: K, event: ClockEvent, expires_at: SystemTime) -> Self {
            Self {
                key,
                event,
                expires_at,
            }
        }
        pub fn key(&self) -> &K {
            &self.key
        }
        pub fn into_key(self) -> K {
            self.key
        }
        pub fn event(&self) -> ClockEvent {
            self.event
        }
        pub fn expires_at(&self) -> SystemTime {
            self.expires_at
        }
    }
}

mod lease_key {
    use std::{fmt::Debug, hash::Hash};

    /// Bounds required from a lease key.
    ///
    /// Implemented for every `T: Send + Sync + Clone + Hash + Eq + Debug + 'static`, so
    /// `usize`, `String` or a session id newtype can be used directly.
    pub trait LeaseKey: Send + Sync + Clone + Hash + Eq + Debug + 'static {}

    impl<T: Send + Sync + Clone + Hash + Eq + Debug + 'static> LeaseKey for T {}
}
