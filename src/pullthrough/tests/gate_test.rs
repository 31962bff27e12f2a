//! Request gate behaviour against a real coordinator
//!
//! Covers eligibility filtering, mirror rewriting, and single-flight pulls in
//! both copy modes.

use pullthrough::config::PullConfig;
use pullthrough::error::{PullThroughError, Result};
use pullthrough::{
    CopyMode, FetchCoordinator, GateDecision, ImageCopier, InboundRequest, PullOutcome, PullState,
    RequestGate, RuntimeSettings, SkipReason,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct RecordingCopier {
    calls: AtomicUsize,
    images: Mutex<Vec<String>>,
    sources: Mutex<Vec<String>>,
    destinations: Mutex<Vec<String>>,
    hold: AtomicBool,
    release: Notify,
}

impl RecordingCopier {
    fn held() -> Self {
        let copier = Self::default();
        copier.hold.store(true, Ordering::SeqCst);
        copier
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn images(&self) -> Vec<String> {
        self.images.lock().unwrap().clone()
    }
}

impl ImageCopier for RecordingCopier {
    async fn copy(&self, source: &str, image: &str, destination: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.destinations
            .lock()
            .unwrap()
            .push(destination.to_string());
        self.images.lock().unwrap().push(image.to_string());
        self.sources.lock().unwrap().push(source.to_string());
        if self.hold.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        if image.contains("broken") {
            return Err(PullThroughError::Copy("manifest unknown".to_string()));
        }
        Ok(())
    }
}

fn gate(
    copier: RecordingCopier,
    mode: CopyMode,
    mirror: Option<&str>,
) -> Arc<RequestGate<RecordingCopier>> {
    let config = PullConfig {
        pull_timeout: Duration::from_secs(30),
        ..Default::default()
    };
    let coordinator = Arc::new(FetchCoordinator::from_config(&config, Arc::new(copier)));
    Arc::new(RequestGate::new(
        coordinator,
        RuntimeSettings {
            copy_mode: mode,
            mirror: mirror.map(str::to_string),
        },
    ))
}

fn head<'a>(host: &'a str, path: &'a str) -> InboundRequest<'a> {
    InboundRequest {
        method: "HEAD",
        host,
        path,
        listen_address: ":5000",
        remote_address: Some("192.168.1.20:51234"),
    }
}

fn copier_of(gate: &RequestGate<RecordingCopier>) -> &RecordingCopier {
    gate.coordinator().copier()
}

#[tokio::test]
async fn test_head_manifest_becomes_owner_and_pulls() {
    let gate = gate(RecordingCopier::default(), CopyMode::Sync, None);

    let decision = gate
        .handle(head("registry.example.com", "/v2/app/manifests/v1"))
        .await;

    assert!(matches!(
        decision,
        GateDecision::Completed(PullOutcome::Pulled { .. })
    ));
    let copier = copier_of(&gate);
    assert_eq!(copier.images(), vec!["registry.example.com/app:v1"]);
    assert_eq!(
        copier.sources.lock().unwrap().as_slice(),
        &["registry://127.0.0.1:5000".to_string()]
    );
    assert_eq!(
        copier.destinations.lock().unwrap().as_slice(),
        &["app:v1".to_string()]
    );
    assert_eq!(
        gate.coordinator().store().get("registry.example.com/app:v1"),
        Some(PullState::Pulled)
    );
}

#[tokio::test]
async fn test_non_head_never_pulls() {
    let gate = gate(RecordingCopier::default(), CopyMode::Sync, Some("m.example.com"));
    for method in ["GET", "PUT", "POST", "DELETE", "PATCH"] {
        let decision = gate
            .handle(InboundRequest {
                method,
                ..head("registry.example.com", "/v2/library/foo/manifests/latest")
            })
            .await;
        assert_eq!(decision, GateDecision::Skipped(SkipReason::Method));
    }
    assert_eq!(copier_of(&gate).calls(), 0);
}

#[tokio::test]
async fn test_blob_and_ping_heads_never_pull() {
    let gate = gate(RecordingCopier::default(), CopyMode::Sync, None);
    for path in [
        "/v2/",
        "/v2/app/blobs/sha256:abc",
        "/v2/app/blobs/uploads/1f0c",
    ] {
        let decision = gate.handle(head("registry.example.com", path)).await;
        assert_eq!(decision, GateDecision::Skipped(SkipReason::NotManifest));
    }
    assert_eq!(copier_of(&gate).calls(), 0);
}

#[tokio::test]
async fn test_ip_host_without_mirror_never_pulls() {
    let gate = gate(RecordingCopier::default(), CopyMode::Sync, None);
    for path in ["/v2/library/foo/manifests/latest", "/v2/app/manifests/v1"] {
        let decision = gate.handle(head("10.0.0.7:5000", path)).await;
        assert_eq!(decision, GateDecision::Skipped(SkipReason::IpHost));
    }
    assert_eq!(copier_of(&gate).calls(), 0);
}

#[tokio::test]
async fn test_ip_host_with_mirror_pulls_library_images_through_mirror() {
    let gate = gate(
        RecordingCopier::default(),
        CopyMode::Sync,
        Some("mirror.example.com"),
    );

    let decision = gate
        .handle(head("10.0.0.7:5000", "/v2/library/foo/manifests/latest"))
        .await;
    assert!(matches!(decision, GateDecision::Completed(_)));

    let decision = gate
        .handle(head("10.0.0.7:5000", "/v2/team/foo/manifests/latest"))
        .await;
    assert_eq!(decision, GateDecision::Skipped(SkipReason::IpHost));

    assert_eq!(copier_of(&gate).images(), vec!["mirror.example.com/foo:latest"]);
    assert_eq!(
        copier_of(&gate).destinations.lock().unwrap().as_slice(),
        &["library/foo:latest".to_string()]
    );
}

#[tokio::test]
async fn test_failed_pull_is_retried_by_next_request() {
    let gate = gate(RecordingCopier::default(), CopyMode::Sync, None);
    let request = head("registry.example.com", "/v2/broken/manifests/v1");

    assert_eq!(
        gate.handle(request).await,
        GateDecision::Completed(PullOutcome::Failed)
    );
    assert_eq!(
        gate.coordinator().store().get("registry.example.com/broken:v1"),
        None
    );
    assert_eq!(
        gate.handle(request).await,
        GateDecision::Completed(PullOutcome::Failed)
    );
    assert_eq!(copier_of(&gate).calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_sync_requests_pull_once() {
    let gate = gate(RecordingCopier::held(), CopyMode::Sync, None);

    let requests: Vec<_> = (0..8)
        .map(|_| {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.handle(head("registry.example.com", "/v2/app/manifests/v1"))
                    .await
            })
        })
        .collect();

    while copier_of(&gate).calls() == 0 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_secs(5)).await;
    copier_of(&gate).release.notify_waiters();

    let mut pulled = 0;
    let mut ready = 0;
    for request in requests {
        match request.await.unwrap() {
            GateDecision::Completed(PullOutcome::Pulled { .. }) => pulled += 1,
            GateDecision::Completed(PullOutcome::Ready) => ready += 1,
            other => panic!("unexpected decision {:?}", other),
        }
    }
    assert_eq!(pulled, 1);
    assert_eq!(ready, 7);
    assert_eq!(copier_of(&gate).calls(), 1);
}

#[tokio::test]
async fn test_async_requests_return_immediately_and_pull_once() {
    let gate = gate(RecordingCopier::held(), CopyMode::Async, None);

    for _ in 0..8 {
        let decision = gate
            .handle(head("registry.example.com", "/v2/app/manifests/v1"))
            .await;
        assert_eq!(decision, GateDecision::Detached);
    }

    while copier_of(&gate).calls() == 0 {
        tokio::task::yield_now().await;
    }
    // give the other detached tasks a chance to run against the claimed key
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(
        gate.coordinator().store().get("registry.example.com/app:v1"),
        Some(PullState::Pulling)
    );

    copier_of(&gate).release.notify_waiters();
    while gate.coordinator().store().get("registry.example.com/app:v1") != Some(PullState::Pulled)
    {
        tokio::task::yield_now().await;
    }
    assert_eq!(copier_of(&gate).calls(), 1);
}

#[tokio::test]
async fn test_settings_update_applies_to_next_request() {
    let gate = gate(RecordingCopier::default(), CopyMode::Sync, None);

    assert_eq!(
        gate.handle(head("10.0.0.7", "/v2/library/foo/manifests/1"))
            .await,
        GateDecision::Skipped(SkipReason::IpHost)
    );

    gate.update_settings(RuntimeSettings {
        copy_mode: CopyMode::Sync,
        mirror: Some("mirror.example.com".to_string()),
    });

    assert!(matches!(
        gate.handle(head("10.0.0.7", "/v2/library/foo/manifests/1"))
            .await,
        GateDecision::Completed(PullOutcome::Pulled { .. })
    ));
    assert_eq!(copier_of(&gate).images(), vec!["mirror.example.com/foo:1"]);
}
