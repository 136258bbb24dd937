use std::fmt::Debug;

use crate::{Duration, Instant};

/// A one-shot timer that can be rescheduled
///
/// The time-wait list owns exactly one alarm, used to schedule its cleanup sweep. Firing is
/// delivered out of band: whoever drives the event loop observes the deadline passing and calls
/// [`TimeWaitListManager::clean_up_old_connection_ids`](crate::TimeWaitListManager::clean_up_old_connection_ids).
pub trait Alarm: Send + Debug {
    /// Schedule the alarm to fire at `deadline`, replacing any earlier schedule
    ///
    /// Implementations may skip the update when the new deadline is within `granularity` of the
    /// current one.
    fn update(&mut self, deadline: Instant, granularity: Duration);

    /// Prevent a scheduled firing
    ///
    /// Must be idempotent.
    fn cancel(&mut self);

    /// Whether a firing is currently scheduled
    fn is_set(&self) -> bool;
}

/// Creates [`Alarm`]s bound to the caller's event loop
pub trait AlarmFactory {
    /// Construct a new, unscheduled alarm
    fn create_alarm(&self) -> Box<dyn Alarm>;
}
