use std::time::{Duration, SystemTime};

/// Elapsed wall time since the unix epoch. A clock set before the epoch reads as zero, which
/// fails closed everywhere expiry is compared against it.
#[inline]
fn since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}

/// Current unix timestamp in whole seconds.
#[inline]
pub fn timestamp_secs() -> u64 {
    since_epoch().as_secs()
}

/// Current unix timestamp in milliseconds. This is the shared clock bullet trajectories are
/// integrated against across hosts.
#[inline]
pub fn timestamp_millis() -> u64 {
    since_epoch().as_millis() as u64
}
