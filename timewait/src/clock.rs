use std::time::Instant;

use proto::Clock;

/// [`Clock`] following tokio's notion of time
///
/// Unlike [`StdClock`](proto::StdClock), honors a paused or advanced tokio clock.
#[derive(Debug, Default, Copy, Clone)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn approximate_now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}
