//! Injectable wall clock.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use time::OffsetDateTime;

/// Source of the current instant and of suspension.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;

    fn sleep<'a>(&'a self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Real time backed by tokio timers.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    fn sleep<'a>(&'a self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Deterministic clock: a completed sleep advances the current instant at once
/// and is recorded.
#[derive(Debug)]
pub struct ManualClock {
    inner: Mutex<ManualInner>,
}

#[derive(Debug)]
struct ManualInner {
    now: OffsetDateTime,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    pub fn new(now: OffsetDateTime) -> Self {
        Self {
            inner: Mutex::new(ManualInner {
                now,
                sleeps: Vec::new(),
            }),
        }
    }

    pub fn set(&self, now: OffsetDateTime) {
        self.inner.lock().expect("manual clock lock is not poisoned").now = now;
    }

    pub fn advance(&self, duration: Duration) {
        let mut inner = self.inner.lock().expect("manual clock lock is not poisoned");
        inner.now += duration;
    }

    /// Every duration passed to [`Clock::sleep`] so far.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.inner
            .lock()
            .expect("manual clock lock is not poisoned")
            .sleeps
            .clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        self.inner.lock().expect("manual clock lock is not poisoned").now
    }

    /// Completes on its second poll. A sleep that is dropped before then,
    /// e.g. a timeout that lost its race, leaves no trace.
    fn sleep<'a>(&'a self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            let mut inner = self.inner.lock().expect("manual clock lock is not poisoned");
            inner.now += duration;
            inner.sleeps.push(duration);
        })
    }
}
