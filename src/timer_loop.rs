use crossbeam_channel::{Receiver, Sender, after, never, select, unbounded};
use parking_lot::Mutex;

use crate::{
    errors::TimeSourceError,
    time_source::{Clock, ElapsedHandler, TimeSource},
};
use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant, SystemTime},
};

const LOG_TARGET: &str = "lease_clock::timer";

enum TimerCommand {
    Wake,
    Shutdown,
}

struct TimerState {
    interval: Duration,
    enabled: bool,
    released: bool,
    /// Pending fire instant, tagged with the arming generation that produced it.
    deadline: Option<(Instant, u64)>,
    generation: u64,
}

impl TimerState {
    fn arm(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.deadline = Some((Instant::now() + self.interval, self.generation));
    }
    fn disarm(&mut self) {
        self.deadline = None;
    }
}

struct TimerShared {
    state: Mutex<TimerState>,
    handler: Mutex<Option<ElapsedHandler>>,
}

/// Production [`TimeSource`] backed by one dedicated thread.
///
/// The thread sleeps in a `select!` on its command channel and on the armed deadline, so
/// nothing is polled: re-arming only wakes it to pick up the new deadline. The elapsed
/// handler runs on that thread.
pub struct ThreadTimeSource {
    shared: Arc<TimerShared>,
    commands: Sender<TimerCommand>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadTimeSource {
    pub fn new() -> Result<Self, TimeSourceError> {
        Self::with_builder(std::thread::Builder::new().name("lease-clock-timer".into()))
    }

    /// Spawns the timer thread from `builder`, e.g. to pick its name or stack size.
    pub fn with_builder(builder: std::thread::Builder) -> Result<Self, TimeSourceError> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                interval: Duration::from_millis(100),
                enabled: false,
                released: false,
                deadline: None,
                generation: 0,
            }),
            handler: Mutex::new(None),
        });
        let (commands, receiver) = unbounded();

        let thread_shared = shared.clone();
        let thread = builder
            .spawn(move || TimerLoop::run(thread_shared, receiver))
            .map_err(|e| {
                log::error!(target: LOG_TARGET, "unable to spawn timer thread [{}]", e);
                TimeSourceError::Spawn(e.to_string())
            })?;

        Ok(Self {
            shared,
            commands,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn wake(&self) -> Result<(), TimeSourceError> {
        self.commands
            .send(TimerCommand::Wake)
            .map_err(|_| TimeSourceError::Fault("timer thread is gone".into()))
    }
}

impl Clock for ThreadTimeSource {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

impl TimeSource for ThreadTimeSource {
    fn interval(&self) -> Duration {
        self.shared.state.lock().interval
    }

    fn set_interval(&self, interval: Duration) -> Result<(), TimeSourceError> {
        {
            let mut state = self.shared.state.lock();
            if state.released {
                return Err(TimeSourceError::Released);
            }
            state.interval = interval;
            if !state.enabled {
                return Ok(());
            }
            state.arm();
        }
        self.wake()
    }

    fn enabled(&self) -> bool {
        self.shared.state.lock().enabled
    }

    fn set_enabled(&self, enabled: bool) -> Result<(), TimeSourceError> {
        {
            let mut state = self.shared.state.lock();
            if state.released {
                return Err(TimeSourceError::Released);
            }
            state.enabled = enabled;
            if enabled {
                state.arm();
            } else {
                state.disarm();
            }
        }
        self.wake()
    }

    fn on_elapsed(&self, handler: ElapsedHandler) {
        *self.shared.handler.lock() = Some(handler);
    }

    fn release(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.released {
                return;
            }
            state.released = true;
            state.enabled = false;
            state.disarm();
        }
        self.shared.handler.lock().take();
        let _ = self.commands.send(TimerCommand::Shutdown);

        if let Some(handle) = self.thread.lock().take() {
            // Released from inside the elapsed handler: the loop exits on its own.
            let on_timer_thread = handle.thread().id() == std::thread::current().id();
            if !on_timer_thread && handle.join().is_err() {
                log::error!(target: LOG_TARGET, "timer thread panicked");
            }
        }
        log::debug!(target: LOG_TARGET, "timer released");
    }
}

impl Drop for ThreadTimeSource {
    fn drop(&mut self) {
        self.release();
    }
}

struct TimerLoop;

impl TimerLoop {
    fn run(shared: Arc<TimerShared>, commands: Receiver<TimerCommand>) {
        loop {
            let armed = shared.state.lock().deadline;
            let countdown = match armed {
                Some((deadline, _)) => after(deadline.saturating_duration_since(Instant::now())),
                None => never(),
            };

            select! {
                recv(commands) -> command => match command {
                    Ok(TimerCommand::Wake) => continue,
                    Ok(TimerCommand::Shutdown) | Err(_) => break,
                },
                recv(countdown) -> _ => {
                    if let Some((_, generation)) = armed {
                        Self::fire(&shared, generation);
                    }
                }
            }
        }
        log::debug!(target: LOG_TARGET, "timer loop stopped");
    }

    fn fire(shared: &TimerShared, generation: u64) {
        {
            let mut state = shared.state.lock();
            // Re-armed or disarmed after this countdown was started.
            match state.deadline {
                Some((_, current)) if current == generation && state.enabled => {}
                _ => return,
            }
            state.enabled = false;
            state.disarm();
        }

        let handler = shared.handler.lock().clone();
        if let Some(handler) = handler {
            if catch_unwind(AssertUnwindSafe(|| handler())).is_err() {
                log::error!(target: LOG_TARGET, "elapsed handler panicked");
            }
        }
    }
}
