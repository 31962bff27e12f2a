//! Single-flight image pulls keyed by canonical reference.

use crate::config::{CopyMode, PullConfig, ENTRY_MAX_AGE};
use crate::copier::ImageCopier;
use crate::poll::{PollOutcome, Poller};
use crate::store::{Claim, PullState, PullStateStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// What a call to [`FetchCoordinator::ensure_pulled`] ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// This call owned the fetch and it succeeded
    Pulled { elapsed: Duration },
    /// This call owned the fetch and it failed; the key is absent again
    Failed,
    /// Pulled within the cooldown window, nothing to do
    AlreadyPulled,
    /// Another call is fetching and the mode does not wait
    InFlight,
    /// Waited for another call's fetch and saw it complete
    Ready,
    /// Gave up waiting for another call's fetch
    TimedOut,
}

pub struct FetchCoordinator<C> {
    store: Arc<PullStateStore>,
    copier: Arc<C>,
    poller: Poller,
}

impl<C: ImageCopier> FetchCoordinator<C> {
    pub fn new(store: Arc<PullStateStore>, copier: Arc<C>, poller: Poller) -> Self {
        Self {
            store,
            copier,
            poller,
        }
    }

    /// Coordinator with a fresh store sized from `config`
    pub fn from_config(config: &PullConfig, copier: Arc<C>) -> Self {
        let store = Arc::new(PullStateStore::new(config.repull_interval, ENTRY_MAX_AGE));
        Self::new(
            store,
            copier,
            Poller::new(config.poll_interval, config.pull_timeout),
        )
    }

    pub fn store(&self) -> &Arc<PullStateStore> {
        &self.store
    }

    pub fn copier(&self) -> &Arc<C> {
        &self.copier
    }

    /// Make sure `image` has been copied into the registry at `source`, stored
    /// under `destination`.
    ///
    /// The first caller for an absent key copies it. Later callers return at
    /// once, except in [`CopyMode::Sync`] while the copy is still running, in
    /// which case they poll the store until it reports `pulled` or the wait
    /// timeout passes. A failed copy removes the key, which a waiter cannot
    /// tell apart from "still pulling"; it keeps waiting until its timeout.
    ///
    /// The copy runs on its own task: dropping this future stops the wait but
    /// never the copy.
    pub async fn ensure_pulled(
        &self,
        image: &str,
        source: &str,
        destination: &str,
        mode: CopyMode,
        requester: Option<&str>,
    ) -> PullOutcome {
        let requester = requester.unwrap_or("-");

        match self.store.try_claim(image) {
            Claim::Owner => self.fetch(image, source, destination, requester).await,
            Claim::Observed(PullState::Pulled) => PullOutcome::AlreadyPulled,
            Claim::Observed(PullState::Pulling) => match mode {
                CopyMode::Async => PullOutcome::InFlight,
                CopyMode::Sync => self.wait_for(image, requester).await,
            },
        }
    }

    async fn fetch(
        &self,
        image: &str,
        source: &str,
        destination: &str,
        requester: &str,
    ) -> PullOutcome {
        info!(
            requester = %requester,
            image = %image,
            destination = %destination,
            "pulling image"
        );

        let store = self.store.clone();
        let copier = self.copier.clone();
        let (image_owned, source_owned, destination_owned, requester_owned) = (
            image.to_string(),
            source.to_string(),
            destination.to_string(),
            requester.to_string(),
        );

        let task = tokio::spawn(async move {
            let started = Instant::now();
            match copier
                .copy(&source_owned, &image_owned, &destination_owned)
                .await {
                Ok(()) => {
                    store.set(&image_owned, PullState::Pulled);
                    let elapsed = started.elapsed();
                    info!(
                        requester = %requester_owned,
                        image = %image_owned,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "pulled image in {:.2}s",
                        elapsed.as_secs_f64()
                    );
                    PullOutcome::Pulled { elapsed }
                }
                Err(e) => {
                    store.delete(&image_owned);
                    error!(
                        requester = %requester_owned,
                        image = %image_owned,
                        error = %e,
                        "image pull failed"
                    );
                    PullOutcome::Failed
                }
            }
        });

        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                // a panicking copier must not leave the key stuck in `pulling`
                self.store.delete(image);
                error!(image = %image, error = %e, "image pull task aborted");
                PullOutcome::Failed
            }
        }
    }

    async fn wait_for(&self, image: &str, requester: &str) -> PullOutcome {
        let outcome = self
            .poller
            .until(|waited| {
                if self.store.get(image) == Some(PullState::Pulled) {
                    return true;
                }
                info!(
                    requester = %requester,
                    image = %image,
                    "pull waiting {:.2}s...",
                    waited.as_secs_f64()
                );
                false
            })
            .await;

        match outcome {
            PollOutcome::Ready => PullOutcome::Ready,
            PollOutcome::TimedOut => {
                warn!(
                    requester = %requester,
                    image = %image,
                    timeout_secs = self.poller.timeout().as_secs(),
                    "pull wait timeout"
                );
                PullOutcome::TimedOut
            }
        }
    }
}
