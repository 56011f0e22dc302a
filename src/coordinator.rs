use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::{
    config::LeaseConfig,
    errors::CoordinatorError,
    lease_table::{ClockEvent, TimeOutUpdate, TimeoutScheduler, WeakTimeoutScheduler},
    session::{LicenseLevel, Session, SessionId, SessionStore, UserId},
};

const LOG_TARGET: &str = "lease_clock::coordinator";

/// Ends timed-out sessions in the store, off the scheduler's lock and timer thread.
struct WriteBack<S: SessionStore> {
    store: Arc<S>,
    pool: ThreadPool,
    pending: Mutex<usize>,
    drained: Condvar,
    /// Write-backs parked while reconciliation walks the store: ending rows mid-walk
    /// would shift the pages still to be read.
    held: Mutex<Option<Vec<SessionId>>>,
}

/// Decrements the pending count when a write-back job finishes, panicking or not.
struct PendingGuard<'a, S: SessionStore>(&'a WriteBack<S>);

impl<S: SessionStore> Drop for PendingGuard<'_, S> {
    fn drop(&mut self) {
        let mut pending = self.0.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.0.drained.notify_all();
        }
    }
}

impl<S: SessionStore> WriteBack<S> {
    fn hold(&self) {
        self.held.lock().get_or_insert_with(Vec::new);
    }

    fn flush_held(self: &Arc<Self>) {
        let held = self.held.lock().take().unwrap_or_default();
        for session_id in held {
            self.end_timed_out(session_id);
        }
    }

    fn end_timed_out(self: &Arc<Self>, session_id: SessionId) {
        if let Some(held) = self.held.lock().as_mut() {
            held.push(session_id);
            return;
        }
        *self.pending.lock() += 1;
        let write_back = self.clone();
        self.pool.spawn(move || {
            let _guard = PendingGuard(&write_back);
            match write_back.store.end_session(&session_id, true) {
                Ok(Some(_)) => {
                    log::info!(target: LOG_TARGET, "session [{}] ended on timeout", session_id)
                }
                Ok(None) => {
                    log::debug!(target: LOG_TARGET, "session [{}] was already ended", session_id)
                }
                Err(e) => log::error!(
                    target: LOG_TARGET,
                    "unable to end timed-out session [{}] [{}]",
                    session_id,
                    e
                ),
            }
        });
    }

    fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.pending.lock();
        while *pending > 0 {
            if self.drained.wait_until(&mut pending, deadline).timed_out() {
                return *pending == 0;
            }
        }
        true
    }
}

pub struct SessionLeaseCoordinatorBuilder<S: SessionStore> {
    store: Option<Arc<S>>,
    scheduler: Option<TimeoutScheduler<SessionId>>,
    config: LeaseConfig,
}

impl<S: SessionStore> SessionLeaseCoordinatorBuilder<S> {
    pub fn set_store(&mut self, store: Arc<S>) -> &mut Self {
        self.store = Some(store);
        self
    }
    pub fn set_scheduler(&mut self, scheduler: TimeoutScheduler<SessionId>) -> &mut Self {
        self.scheduler = Some(scheduler);
        self
    }
    pub fn build(&mut self) -> Result<SessionLeaseCoordinator<S>, CoordinatorError> {
        let Some(store) = self.store.take() else {
            return Err(CoordinatorError::BuildErrorNoStoreSet);
        };
        let Some(scheduler) = self.scheduler.take() else {
            return Err(CoordinatorError::BuildErrorNoSchedulerSet);
        };
        let config = std::mem::take(&mut self.config);

        let pool = ThreadPoolBuilder::new()
            .num_threads(config.get_write_back_threads())
            .thread_name(|i| format!("lease-write-back-{}", i))
            .panic_handler(|_| log::error!(target: LOG_TARGET, "write-back job panicked"))
            .build()?;

        Ok(SessionLeaseCoordinator {
            write_back: Arc::new(WriteBack {
                store,
                pool,
                pending: Mutex::new(0),
                drained: Condvar::new(),
                held: Mutex::new(None),
            }),
            scheduler,
            config,
            reconciling: Mutex::new(()),
        })
    }
}

/// Keeps the scheduler's live set in step with the sessions that should be active, and the
/// store eventually consistent with expirations seen in memory.
///
/// The scheduler decides whether a session is live right now; the store stays the durable
/// record across restarts and replicas.
pub struct SessionLeaseCoordinator<S: SessionStore> {
    write_back: Arc<WriteBack<S>>,
    scheduler: TimeoutScheduler<SessionId>,
    config: LeaseConfig,
    reconciling: Mutex<()>,
}

impl<S: SessionStore> SessionLeaseCoordinator<S> {
    /// ### Example
    /// ```rust
    /// # use std::sync::Arc;
    /// # use lease_clock::{LeaseConfig, MemorySessionStore, SessionLeaseCoordinator, TimeoutScheduler};
    /// let coordinator = SessionLeaseCoordinator::new(LeaseConfig::default())
    ///     .set_store(Arc::new(MemorySessionStore::default()))
    ///     .set_scheduler(TimeoutScheduler::builder().build().unwrap())
    ///     .build()
    ///     .unwrap();
    /// coordinator.reconcile().unwrap();
    /// ```
    pub fn new(config: LeaseConfig) -> SessionLeaseCoordinatorBuilder<S> {
        SessionLeaseCoordinatorBuilder {
            store: None,
            scheduler: None,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.write_back.store
    }

    pub fn scheduler(&self) -> &TimeoutScheduler<SessionId> {
        &self.scheduler
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Seeds the scheduler with every stored session, page by page.
    ///
    /// Sessions already past their end time expire on the spot and are ended in the store.
    /// A failing page stops the walk and is logged; only a disposed scheduler is an error.
    /// Returns the number of sessions handed to the scheduler. Fails with
    /// [`CoordinatorError::ReconcileInProgress`] while another reconciliation is walking.
    pub fn reconcile(&self) -> Result<usize, CoordinatorError> {
        let Some(_walking) = self.reconciling.try_lock() else {
            log::warn!(target: LOG_TARGET, "reconciliation already running");
            return Err(CoordinatorError::ReconcileInProgress);
        };
        self.write_back.hold();
        let seeded = self.walk_store();
        self.write_back.flush_held();
        let seeded = seeded?;

        log::info!(
            target: LOG_TARGET,
            "reconciled {} session(s), {} live",
            seeded,
            self.scheduler.len()
        );
        Ok(seeded)
    }

    fn walk_store(&self) -> Result<usize, CoordinatorError> {
        let page_size = self.config.get_page_size();
        let mut seeded = 0;
        let mut page_number = 0;

        loop {
            let page = match self.store().select_sessions(page_size, page_number) {
                Ok(page) => page,
                Err(e) => {
                    log::error!(
                        target: LOG_TARGET,
                        "reconciliation stopped at page {} [{}]",
                        page_number,
                        e
                    );
                    break;
                }
            };
            let last_page = page.len() < page_size;

            for session in &page {
                self.track(session)?;
                seeded += 1;
            }
            if last_page {
                break;
            }
            page_number += 1;
        }
        Ok(seeded)
    }

    /// Establishes or refreshes the lease of a session just created or extended by the store.
    pub fn on_session_created_or_extended(
        &self,
        session: &Session,
    ) -> Result<(), CoordinatorError> {
        self.track(session)
    }

    /// Ends the session in the store, then drops its lease.
    ///
    /// The lease is dropped even when the store call fails; that failure is logged and
    /// reported as `Ok(None)`.
    pub fn on_session_ended(&self, token: &str) -> Result<Option<Session>, CoordinatorError> {
        let session_id: SessionId = token.parse()?;

        let ended = match self.store().end_session(&session_id, false) {
            Ok(ended) => ended,
            Err(e) => {
                log::error!(
                    target: LOG_TARGET,
                    "unable to end session [{}] [{}]",
                    session_id,
                    e
                );
                None
            }
        };
        self.scheduler.remove(&session_id);
        Ok(ended)
    }

    /// Logs a user in. A session the store reports as superseded loses its lease.
    pub fn begin_session(
        &self,
        user_id: UserId,
        user_name: &str,
        license_level: LicenseLevel,
        is_sso: bool,
    ) -> Result<Session, CoordinatorError> {
        let begun = self
            .store()
            .begin_session(user_id, user_name, license_level, is_sso)?;

        if let Some(superseded) = begun.superseded {
            log::info!(
                target: LOG_TARGET,
                "session [{}] superseded by [{}]",
                superseded,
                begun.session.session_id
            );
            self.scheduler.remove(&superseded);
        }
        self.track(&begun.session)?;
        Ok(begun.session)
    }

    /// Renews a session. `None` when the store no longer knows it, or could not be reached.
    pub fn extend_session(&self, token: &str) -> Result<Option<Session>, CoordinatorError> {
        let session_id: SessionId = token.parse()?;

        match self.store().extend_session(&session_id) {
            Ok(Some(session)) => {
                self.track(&session)?;
                Ok(Some(session))
            }
            Ok(None) => {
                self.scheduler.remove(&session_id);
                Ok(None)
            }
            Err(e) => {
                log::error!(
                    target: LOG_TARGET,
                    "unable to extend session [{}] [{}]",
                    session_id,
                    e
                );
                Ok(None)
            }
        }
    }

    /// The stored session behind `token`, if it is live in memory and not past its end.
    pub fn session_for(&self, token: &str) -> Result<Option<Session>, CoordinatorError> {
        let session_id: SessionId = token.parse()?;
        if !self.scheduler.contains(&session_id) {
            return Ok(None);
        }
        let session = self.store().get_session(&session_id)?;
        Ok(session.filter(|session| self.is_current(session)))
    }

    pub fn user_session(&self, user_id: UserId) -> Result<Option<Session>, CoordinatorError> {
        let session = self.store().get_user_session(user_id)?;
        Ok(session.filter(|session| {
            self.scheduler.contains(&session.session_id) && self.is_current(session)
        }))
    }

    pub fn is_live(&self, session_id: &SessionId) -> bool {
        self.scheduler.contains(session_id)
    }

    pub fn live_sessions(&self) -> Vec<SessionId> {
        self.scheduler.keys()
    }

    /// Waits until every pending expiry write-back reached the store.
    pub fn wait_for_write_backs(&self, timeout: Duration) -> bool {
        self.write_back.wait_idle(timeout)
    }

    /// Disposes the scheduler, then gives pending write-backs `grace` to finish.
    pub fn shutdown(&self, grace: Duration) -> bool {
        self.scheduler.dispose();
        let drained = self.write_back.wait_idle(grace);
        if !drained {
            log::warn!(target: LOG_TARGET, "shutdown with write-backs still pending");
        }
        drained
    }

    fn is_current(&self, session: &Session) -> bool {
        !session.is_expired_at(self.scheduler.time_source().now())
    }

    fn track(&self, session: &Session) -> Result<(), CoordinatorError> {
        let on_expire = expire_callback(self.scheduler.downgrade(), self.write_back.clone());
        self.scheduler
            .insert(session.session_id, session.end_time, on_expire)?;
        Ok(())
    }
}

fn expire_callback<S: SessionStore>(
    scheduler: WeakTimeoutScheduler<SessionId>,
    write_back: Arc<WriteBack<S>>,
) -> impl FnOnce(TimeOutUpdate<SessionId>) + Send + 'static {
    move |update| {
        let session_id = *update.key();
        // A renewal may have landed between eviction and this call.
        let renewed = scheduler.upgrade().is_some_and(|scheduler| {
            !scheduler.remove_if_expires_at(&session_id, update.expires_at())
        });
        if renewed {
            log::debug!(
                target: LOG_TARGET,
                "session [{}] renewed after its lease ran out",
                session_id
            );
            return;
        }
        if update.event() == ClockEvent::AlreadyExpired {
            log::debug!(target: LOG_TARGET, "session [{}] was already past its end", session_id);
        }
        write_back.end_timed_out(session_id);
    }
}
