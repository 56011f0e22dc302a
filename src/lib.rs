mod config;
mod coordinator;
mod errors;
mod lease_table;
mod manual_clock;
mod memory_store;
mod session;
#[cfg(test)]
mod test;
mod time_source;
mod timer_loop;

pub use config::LeaseConfig;
pub use coordinator::{SessionLeaseCoordinator, SessionLeaseCoordinatorBuilder};
pub use errors::{CoordinatorError, SchedulerError, StoreError, TimeSourceError};
pub use lease_table::{
    ClockEvent, ExpiryCallback, LeaseKey, SchedulerBuilder, TimeOutUpdate, TimeoutScheduler,
    WeakTimeoutScheduler,
};
pub use manual_clock::ManualTimeSource;
pub use memory_store::MemorySessionStore;
pub use session::{BegunSession, LicenseLevel, Session, SessionId, SessionStore, UserId};
pub use time_source::{Clock, ElapsedHandler, SystemClock, TimeSource};
pub use timer_loop::ThreadTimeSource;

pub mod prelude {
    pub use super::{
        Clock, ClockEvent, CoordinatorError, LeaseConfig, SchedulerError, Session, SessionId,
        SessionLeaseCoordinator, SessionStore, TimeOutUpdate, TimeSource, TimeoutScheduler,
    };
}
