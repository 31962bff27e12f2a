//! In-memory pull state with two expiry policies.
//!
//! Each entry carries a sliding cooldown deadline, reset on every write, and a
//! hard deadline fixed when the key is first inserted. An entry is live only
//! while both deadlines are in the future.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::time::Instant;

/// Source of "now" for expiry decisions
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

/// Clock backed by tokio's timer, so a paused runtime also pauses expiry
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullState {
    /// A fetch is in flight
    Pulling,
    /// Fetched successfully within the cooldown window
    Pulled,
}

impl std::fmt::Display for PullState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PullState::Pulling => f.write_str("pulling"),
            PullState::Pulled => f.write_str("pulled"),
        }
    }
}

/// Result of [`PullStateStore::try_claim`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The key was absent and is now marked `Pulling` on the caller's behalf
    Owner,
    /// Somebody else already holds the key
    Observed(PullState),
}

#[derive(Debug)]
struct Entry {
    state: PullState,
    expires_at: Instant,
    hard_expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at && now < self.hard_expires_at
    }
}

/// Counts of live entries by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub pulling: usize,
    pub pulled: usize,
}

pub struct PullStateStore {
    entries: Mutex<HashMap<String, Entry>>,
    cooldown: Duration,
    max_age: Duration,
    clock: Arc<dyn Clock>,
}

impl PullStateStore {
    /// A zero `cooldown` disables the sliding window; entries then live until
    /// `max_age`.
    pub fn new(cooldown: Duration, max_age: Duration) -> Self {
        Self::with_clock(cooldown, max_age, Arc::new(TokioClock))
    }

    pub fn with_clock(cooldown: Duration, max_age: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            cooldown,
            max_age,
            clock,
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // each entry is written whole, so a poisoned map is still usable
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<PullState> {
        let now = self.clock.now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.state),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Write `state`, restarting the cooldown. The hard deadline of an
    /// existing live entry is kept.
    pub fn set(&self, key: &str, state: PullState) {
        let now = self.clock.now();
        let mut entries = self.lock();
        self.write_locked(&mut entries, key, state, now);
    }

    pub fn delete(&self, key: &str) {
        self.lock().remove(key);
    }

    /// Atomically mark an absent key as `Pulling`.
    ///
    /// Exactly one of any number of concurrent callers for the same absent
    /// key receives [`Claim::Owner`].
    pub fn try_claim(&self, key: &str) -> Claim {
        let now = self.clock.now();
        let mut entries = self.lock();
        if let Some(entry) = entries.get(key) {
            if entry.is_live(now) {
                return Claim::Observed(entry.state);
            }
        }
        self.write_locked(&mut entries, key, PullState::Pulling, now);
        Claim::Owner
    }

    fn write_locked(
        &self,
        entries: &mut HashMap<String, Entry>,
        key: &str,
        state: PullState,
        now: Instant,
    ) {
        let expires_at = if self.cooldown.is_zero() {
            now + self.max_age
        } else {
            now + self.cooldown
        };
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.state = state;
                entry.expires_at = expires_at;
            }
            _ => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        state,
                        expires_at,
                        hard_expires_at: now + self.max_age,
                    },
                );
            }
        }
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    /// Number of entries held, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StoreStats {
        let now = self.clock.now();
        let entries = self.lock();
        let mut stats = StoreStats::default();
        for entry in entries.values().filter(|e| e.is_live(now)) {
            match entry.state {
                PullState::Pulling => stats.pulling += 1,
                PullState::Pulled => stats.pulled += 1,
            }
        }
        stats
    }

    /// Purge expired entries every `every` until the store is dropped
    pub fn spawn_janitor(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let removed = store.purge_expired();
                if removed > 0 {
                    tracing::debug!(removed, remaining = store.len(), "Purged expired pull state");
                }
            }
        })
    }
}
