mod scheduler;

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::{
    lease_table::{LeaseKey, TimeoutScheduler},
    manual_clock::ManualTimeSource,
};

pub(crate) const MINUTE: Duration = Duration::from_secs(60);

pub(crate) fn epoch() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

pub(crate) fn manual_scheduler<K: LeaseKey>() -> (Arc<ManualTimeSource>, TimeoutScheduler<K>) {
    let clock = Arc::new(ManualTimeSource::new(epoch()));
    let scheduler = TimeoutScheduler::new(clock.clone());
    (clock, scheduler)
}
