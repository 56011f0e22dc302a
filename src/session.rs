use std::{
    fmt::Display,
    str::FromStr,
    time::{Duration, SystemTime},
};

use uuid::Uuid;

use crate::errors::{CoordinatorError, StoreError};

pub type UserId = i64;

/// Opaque 128-bit session token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = CoordinatorError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(token.trim())
            .map(Self)
            .map_err(|_| CoordinatorError::MalformedToken(token.to_string()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LicenseLevel(pub u8);

/// Durable record of an authenticated login.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub user_name: String,
    pub license_level: LicenseLevel,
    pub is_sso: bool,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
}

impl Session {
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.end_time <= now
    }
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }
    /// Time left before `end_time`, zero once expired.
    pub fn remaining_at(&self, now: SystemTime) -> Duration {
        self.end_time.duration_since(now).unwrap_or(Duration::ZERO)
    }
}

/// Outcome of [`SessionStore::begin_session`].
#[derive(Clone, Debug)]
pub struct BegunSession {
    pub session: Session,
    /// Previous session of the same user, ended by this login.
    pub superseded: Option<SessionId>,
}

/// Durable session storage, authoritative across restarts and replicas.
pub trait SessionStore: Send + Sync + 'static {
    fn get_session(&self, session_id: &SessionId) -> Result<Option<Session>, StoreError>;

    fn get_user_session(&self, user_id: UserId) -> Result<Option<Session>, StoreError>;

    /// One page of every stored session. Pages are numbered from 0; a page shorter than
    /// `page_size` is the last one.
    fn select_sessions(
        &self,
        page_size: usize,
        page_number: usize,
    ) -> Result<Vec<Session>, StoreError>;

    fn begin_session(
        &self,
        user_id: UserId,
        user_name: &str,
        license_level: LicenseLevel,
        is_sso: bool,
    ) -> Result<BegunSession, StoreError>;

    /// Pushes `end_time` forward. `None` when the session no longer exists.
    fn extend_session(&self, session_id: &SessionId) -> Result<Option<Session>, StoreError>;

    /// Ends the session. `None` when it was already gone.
    fn end_session(
        &self,
        session_id: &SessionId,
        is_timeout: bool,
    ) -> Result<Option<Session>, StoreError>;
}
