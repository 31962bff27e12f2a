//! Fixed-interval polling bounded by a deadline.

use std::time::Duration;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};

/// Shortest interval a [`Poller`] ticks at
const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The condition held on some tick
    Ready,
    /// The deadline passed first
    TimedOut,
}

#[derive(Debug, Clone, Copy)]
pub struct Poller {
    interval: Duration,
    timeout: Duration,
}

impl Poller {
    /// A zero `interval` is raised to one millisecond.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval: interval.max(MIN_INTERVAL),
            timeout,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Call `check` once per interval, starting one interval from now, until
    /// it returns true or the timeout elapses. `check` receives the time
    /// waited so far.
    pub async fn until<F>(&self, mut check: F) -> PollOutcome
    where
        F: FnMut(Duration) -> bool,
    {
        let start = Instant::now();
        let deadline = sleep_until(start + self.timeout);
        tokio::pin!(deadline);

        let mut ticker = interval_at(start + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut deadline => return PollOutcome::TimedOut,
                tick = ticker.tick() => {
                    if check(tick.duration_since(start)) {
                        return PollOutcome::Ready;
                    }
                }
            }
        }
    }
}
