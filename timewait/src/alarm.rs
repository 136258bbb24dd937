use std::{sync::Arc, task::Waker, time::Duration, time::Instant};

use proto::{Alarm, AlarmFactory};

use crate::mutex::Mutex;

/// Wakes the task running a [`TimeWaitDriver`](crate::TimeWaitDriver)
///
/// Never locks the time-wait state, so it may be poked from inside the manager.
#[derive(Debug)]
pub(crate) struct DriverSignal {
    waker: Mutex<Option<Waker>>,
}

impl Default for DriverSignal {
    fn default() -> Self {
        Self {
            waker: Mutex::new(None),
        }
    }
}

impl DriverSignal {
    pub(crate) fn register(&self, waker: &Waker) {
        let mut slot = self.waker.lock("register");
        match &*slot {
            Some(existing) if existing.will_wake(waker) => {}
            _ => *slot = Some(waker.clone()),
        }
    }

    pub(crate) fn wake(&self) {
        if let Some(waker) = self.waker.lock("wake").take() {
            waker.wake();
        }
    }
}

/// Source of the cleanup alarm serviced by a [`TimeWaitDriver`](crate::TimeWaitDriver)
///
/// Alarms handed out by one handle share a single deadline, which is all a time-wait list needs.
#[derive(Debug, Clone)]
pub(crate) struct AlarmHandle(Arc<AlarmShared>);

#[derive(Debug)]
struct AlarmShared {
    deadline: Mutex<Option<Instant>>,
    signal: Arc<DriverSignal>,
}

impl AlarmHandle {
    pub(crate) fn new(signal: Arc<DriverSignal>) -> Self {
        Self(Arc::new(AlarmShared {
            deadline: Mutex::new(None),
            signal,
        }))
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        *self.0.deadline.lock("deadline")
    }

    /// Clear the deadline if it is still `deadline`, returning whether it was
    pub(crate) fn take_if(&self, deadline: Instant) -> bool {
        let mut current = self.0.deadline.lock("take");
        if *current == Some(deadline) {
            *current = None;
            return true;
        }
        false
    }
}

impl AlarmFactory for AlarmHandle {
    fn create_alarm(&self) -> Box<dyn Alarm> {
        Box::new(TokioAlarm(self.0.clone()))
    }
}

#[derive(Debug)]
struct TokioAlarm(Arc<AlarmShared>);

impl Alarm for TokioAlarm {
    fn update(&mut self, deadline: Instant, granularity: Duration) {
        {
            let mut current = self.0.deadline.lock("update");
            if let Some(existing) = *current {
                let delta = if existing > deadline {
                    existing - deadline
                } else {
                    deadline - existing
                };
                if delta < granularity {
                    return;
                }
            }
            *current = Some(deadline);
        }
        self.0.signal.wake();
    }

    fn cancel(&mut self) {
        if self.0.deadline.lock("cancel").take().is_some() {
            self.0.signal.wake();
        }
    }

    fn is_set(&self) -> bool {
        self.0.deadline.lock("is_set").is_some()
    }
}
