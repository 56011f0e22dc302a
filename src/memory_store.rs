use std::{sync::Arc, time::Duration};

use dashmap::DashMap;

use crate::{
    errors::StoreError,
    session::{BegunSession, LicenseLevel, Session, SessionId, SessionStore, UserId},
    time_source::{Clock, SystemClock},
};

/// In-process [`SessionStore`] backed by a [`DashMap`].
///
/// A user holds at most one session: beginning a new one ends the previous one.
pub struct MemorySessionStore {
    sessions: DashMap<SessionId, Session>,
    clock: Arc<dyn Clock>,
    session_lifetime: Duration,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), Duration::from_secs(30 * 60))
    }
}

impl MemorySessionStore {
    pub fn new(clock: Arc<dyn Clock>, session_lifetime: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            clock,
            session_lifetime,
        }
    }

    pub fn session_lifetime(&self) -> Duration {
        self.session_lifetime
    }

    /// Stores `session` as is, replacing any session with the same id.
    pub fn put(&self, session: Session) {
        self.sessions.insert(session.session_id, session);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn user_session_ids(&self, user_id: UserId) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().user_id == user_id)
            .map(|entry| *entry.key())
            .collect()
    }
}

impl SessionStore for MemorySessionStore {
    fn get_session(&self, session_id: &SessionId) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.get(session_id).map(|entry| entry.value().clone()))
    }

    fn get_user_session(&self, user_id: UserId) -> Result<Option<Session>, StoreError> {
        Ok(self
            .sessions
            .iter()
            .filter(|entry| entry.value().user_id == user_id)
            .map(|entry| entry.value().clone())
            .max_by_key(|session| session.start_time))
    }

    fn select_sessions(
        &self,
        page_size: usize,
        page_number: usize,
    ) -> Result<Vec<Session>, StoreError> {
        let mut all: Vec<Session> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by_key(|session| (session.start_time, session.session_id));

        Ok(all
            .into_iter()
            .skip(page_size.saturating_mul(page_number))
            .take(page_size)
            .collect())
    }

    fn begin_session(
        &self,
        user_id: UserId,
        user_name: &str,
        license_level: LicenseLevel,
        is_sso: bool,
    ) -> Result<BegunSession, StoreError> {
        let mut superseded = None;
        for session_id in self.user_session_ids(user_id) {
            if let Some((removed, _)) = self.sessions.remove(&session_id) {
                superseded = Some(removed);
            }
        }

        let now = self.clock.now();
        let session = Session {
            session_id: SessionId::new_random(),
            user_id,
            user_name: user_name.to_string(),
            license_level,
            is_sso,
            start_time: now,
            end_time: now + self.session_lifetime,
        };
        self.sessions.insert(session.session_id, session.clone());

        Ok(BegunSession {
            session,
            superseded,
        })
    }

    fn extend_session(&self, session_id: &SessionId) -> Result<Option<Session>, StoreError> {
        let end_time = self.clock.now() + self.session_lifetime;
        Ok(self.sessions.get_mut(session_id).map(|mut entry| {
            entry.end_time = end_time;
            entry.value().clone()
        }))
    }

    fn end_session(
        &self,
        session_id: &SessionId,
        _is_timeout: bool,
    ) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.remove(session_id).map(|(_, session)| session))
    }
}
