use std::fmt::Debug;

use crate::Instant;

/// Source of monotonic time for the time-wait list
///
/// A coarse reading is acceptable; the manager only uses it to timestamp entries and to compute
/// alarm deadlines.
pub trait Clock: Send + Sync + Debug {
    /// The current time, possibly cached by the event loop
    fn approximate_now(&self) -> Instant;
}

/// [`Clock`] backed by [`Instant::now`]
#[derive(Debug, Default, Copy, Clone)]
pub struct StdClock;

impl Clock for StdClock {
    fn approximate_now(&self) -> Instant {
        Instant::now()
    }
}
