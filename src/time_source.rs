use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use crate::errors::TimeSourceError;

/// Handler invoked by a [`TimeSource`] each time its countdown completes.
pub type ElapsedHandler = Arc<dyn Fn() + Send + Sync + 'static>;

/// Wall-clock reading shared by the scheduler and the session store.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> SystemTime;
}

/// Single-fire countdown driving a [`TimeoutScheduler`](crate::TimeoutScheduler).
///
/// The countdown starts from `interval` each time the source is enabled, or when the
/// interval is changed while enabled. Once it completes, the source disables itself and
/// calls the elapsed handler exactly once, on an execution context distinct from the one
/// that armed it.
///
/// Implementations must not call the elapsed handler while holding a lock the handler
/// could need: the handler re-enters the source to re-arm it.
pub trait TimeSource: Clock {
    fn interval(&self) -> Duration;
    fn set_interval(&self, interval: Duration) -> Result<(), TimeSourceError>;
    fn enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool) -> Result<(), TimeSourceError>;
    /// Replaces the handler called on completion.
    fn on_elapsed(&self, handler: ElapsedHandler);
    /// Stops the countdown for good and drops the handler. Idempotent.
    fn release(&self);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}
