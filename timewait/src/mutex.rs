use std::{
    fmt,
    ops::{Deref, DerefMut},
};

#[cfg(feature = "lock_tracking")]
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Mutex whose lock sites name their purpose
///
/// With the `lock_tracking` feature, the most recent owners are remembered and a warning is
/// emitted whenever acquiring or holding the lock takes 1ms or more. Without it, the purpose is
/// ignored.
pub(crate) struct Mutex<T> {
    inner: std::sync::Mutex<T>,
    #[cfg(feature = "lock_tracking")]
    owners: std::sync::Mutex<VecDeque<(&'static str, Duration)>>,
}

impl<T> Mutex<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            inner: std::sync::Mutex::new(value),
            #[cfg(feature = "lock_tracking")]
            owners: std::sync::Mutex::new(VecDeque::with_capacity(MAX_LOCK_OWNERS)),
        }
    }

    /// Acquire the lock on behalf of `purpose`
    #[cfg(not(feature = "lock_tracking"))]
    pub(crate) fn lock(&self, _purpose: &'static str) -> MutexGuard<'_, T> {
        MutexGuard {
            guard: self.inner.lock().unwrap(),
        }
    }

    /// Acquire the lock on behalf of `purpose`
    #[cfg(feature = "lock_tracking")]
    pub(crate) fn lock(&self, purpose: &'static str) -> MutexGuard<'_, T> {
        // Diagnostics only, so wall-clock time is fine even under a paused runtime
        let requested = Instant::now();
        let guard = self.inner.lock().unwrap();
        let acquired = Instant::now();
        let waited = acquired.duration_since(requested);
        if waited >= LOCK_WARN_THRESHOLD {
            let owners = self.owners.lock().unwrap();
            tracing::warn!(purpose, ?waited, last_owners = ?*owners, "slow to acquire lock");
        }
        MutexGuard {
            guard,
            owners: &self.owners,
            acquired,
            purpose,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

pub(crate) struct MutexGuard<'a, T> {
    guard: std::sync::MutexGuard<'a, T>,
    #[cfg(feature = "lock_tracking")]
    owners: &'a std::sync::Mutex<VecDeque<(&'static str, Duration)>>,
    #[cfg(feature = "lock_tracking")]
    acquired: Instant,
    #[cfg(feature = "lock_tracking")]
    purpose: &'static str,
}

#[cfg(feature = "lock_tracking")]
impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        let held = self.acquired.elapsed();
        if held >= LOCK_WARN_THRESHOLD {
            tracing::warn!(purpose = self.purpose, ?held, "lock held for long");
        }
        let mut owners = self.owners.lock().unwrap();
        if owners.len() == MAX_LOCK_OWNERS {
            owners.pop_back();
        }
        owners.push_front((self.purpose, held));
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(feature = "lock_tracking")]
const MAX_LOCK_OWNERS: usize = 20;
#[cfg(feature = "lock_tracking")]
const LOCK_WARN_THRESHOLD: Duration = Duration::from_millis(1);
