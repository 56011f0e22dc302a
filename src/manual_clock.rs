use parking_lot::Mutex;

use crate::{
    errors::TimeSourceError,
    time_source::{Clock, ElapsedHandler, TimeSource},
};
use std::time::{Duration, SystemTime};

struct ManualState {
    now: SystemTime,
    interval: Duration,
    enabled: bool,
    released: bool,
    fail_enabled_mutator: bool,
    arm_count: usize,
    disarm_count: usize,
}

/// Fully controllable [`TimeSource`].
///
/// Time only moves through [`set_now`](Self::set_now) and [`advance`](Self::advance), and the
/// countdown never completes on its own: [`raise_elapsed`](Self::raise_elapsed) plays the part
/// of the timer thread and calls the handler on the caller's thread.
pub struct ManualTimeSource {
    state: Mutex<ManualState>,
    handler: Mutex<Option<ElapsedHandler>>,
}

impl ManualTimeSource {
    pub fn new(now: SystemTime) -> Self {
        Self {
            state: Mutex::new(ManualState {
                now,
                interval: Duration::from_millis(100),
                enabled: false,
                released: false,
                fail_enabled_mutator: false,
                arm_count: 0,
                disarm_count: 0,
            }),
            handler: Mutex::new(None),
        }
    }

    pub fn set_now(&self, now: SystemTime) {
        self.state.lock().now = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock();
        state.now += by;
    }

    /// While set, every `set_enabled` call fails with [`TimeSourceError::Fault`].
    pub fn fail_enabled_mutator(&self, fail: bool) {
        self.state.lock().fail_enabled_mutator = fail;
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }

    /// Number of successful `set_enabled(true)` calls.
    pub fn arm_count(&self) -> usize {
        self.state.lock().arm_count
    }

    /// Number of successful `set_enabled(false)` calls.
    pub fn disarm_count(&self) -> usize {
        self.state.lock().disarm_count
    }

    /// Completes the countdown: disables the source and runs the handler once.
    ///
    /// Returns `false` when no handler is registered or the source was released.
    pub fn raise_elapsed(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.released {
                return false;
            }
            state.enabled = false;
        }
        let handler = self.handler.lock().clone();
        match handler {
            Some(handler) => {
                handler();
                true
            }
            None => false,
        }
    }
}

impl Clock for ManualTimeSource {
    fn now(&self) -> SystemTime {
        self.state.lock().now
    }
}

impl TimeSource for ManualTimeSource {
    fn interval(&self) -> Duration {
        self.state.lock().interval
    }

    fn set_interval(&self, interval: Duration) -> Result<(), TimeSourceError> {
        let mut state = self.state.lock();
        if state.released {
            return Err(TimeSourceError::Released);
        }
        state.interval = interval;
        Ok(())
    }

    fn enabled(&self) -> bool {
        self.state.lock().enabled
    }

    fn set_enabled(&self, enabled: bool) -> Result<(), TimeSourceError> {
        let mut state = self.state.lock();
        if state.released {
            return Err(TimeSourceError::Released);
        }
        if state.fail_enabled_mutator {
            return Err(TimeSourceError::Fault("injected enabled fault".into()));
        }
        state.enabled = enabled;
        if enabled {
            state.arm_count += 1;
        } else {
            state.disarm_count += 1;
        }
        Ok(())
    }

    fn on_elapsed(&self, handler: ElapsedHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.released = true;
        state.enabled = false;
        drop(state);
        self.handler.lock().take();
    }
}
