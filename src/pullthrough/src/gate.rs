//! Per-request entry point in front of the registry's manifest handler.

use crate::config::{port_of, CopyMode, RuntimeSettings};
use crate::coordinator::{FetchCoordinator, PullOutcome};
use crate::copier::{ImageCopier, REGISTRY_SCHEME};
use crate::reference::{
    host_is_ip, is_default_namespace, is_manifest_path, local_repository, normalize,
};
use std::sync::{Arc, PoisonError, RwLock};

/// The parts of an inbound request the gate looks at
#[derive(Debug, Clone, Copy)]
pub struct InboundRequest<'a> {
    pub method: &'a str,
    pub host: &'a str,
    pub path: &'a str,
    /// Listen address of the local registry, e.g. `:5000`
    pub listen_address: &'a str,
    pub remote_address: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Only HEAD requests trigger pulls
    Method,
    /// Blob, upload and ping requests never do
    NotManifest,
    /// Raw IP access outside the mirrored default namespace
    IpHost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Skipped(SkipReason),
    /// Sync mode: the coordinator finished before the request continues
    Completed(PullOutcome),
    /// Async mode: the pull runs on a detached task
    Detached,
}

/// Decide whether a request may trigger a pull
pub fn check_eligible(
    method: &str,
    host: &str,
    path: &str,
    mirror: Option<&str>,
) -> Result<(), SkipReason> {
    if method != "HEAD" {
        return Err(SkipReason::Method);
    }
    if !is_manifest_path(path) {
        return Err(SkipReason::NotManifest);
    }
    let has_mirror = mirror.is_some_and(|m| !m.is_empty());
    if host_is_ip(host) && (!has_mirror || !is_default_namespace(path)) {
        return Err(SkipReason::IpHost);
    }
    Ok(())
}

/// Address copiers push into: loopback on the registry's port
pub fn local_source(listen_address: &str) -> String {
    format!("{}127.0.0.1:{}", REGISTRY_SCHEME, port_of(listen_address))
}

pub struct RequestGate<C> {
    coordinator: Arc<FetchCoordinator<C>>,
    settings: RwLock<RuntimeSettings>,
}

impl<C: ImageCopier> RequestGate<C> {
    pub fn new(coordinator: Arc<FetchCoordinator<C>>, settings: RuntimeSettings) -> Self {
        Self {
            coordinator,
            settings: RwLock::new(settings),
        }
    }

    pub fn coordinator(&self) -> &Arc<FetchCoordinator<C>> {
        &self.coordinator
    }

    /// Mode and mirror as the next request will see them
    pub fn settings(&self) -> RuntimeSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_settings(&self, settings: RuntimeSettings) {
        tracing::info!(
            copy_mode = %settings.copy_mode,
            mirror = settings.mirror.as_deref().unwrap_or(""),
            "Updated pull settings"
        );
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    /// Run the pull-through step for one request.
    ///
    /// Never fails: whatever this returns, the caller forwards the request.
    /// In async mode the pull is spawned and never joined, so its result is
    /// only visible in the logs.
    pub async fn handle(&self, request: InboundRequest<'_>) -> GateDecision {
        let settings = self.settings();
        let mirror = settings.mirror.as_deref();

        if let Err(reason) = check_eligible(request.method, request.host, request.path, mirror) {
            return GateDecision::Skipped(reason);
        }

        let image = normalize(request.host, request.path, mirror);
        let destination = local_repository(request.path);
        let source = local_source(request.listen_address);
        tracing::debug!(
            image = %image,
            destination = %destination,
            source = %source,
            copy_mode = %settings.copy_mode,
            "Pull-through candidate"
        );

        match settings.copy_mode {
            CopyMode::Sync => {
                let outcome = self
                    .coordinator
                    .ensure_pulled(
                        &image,
                        &source,
                        &destination,
                        CopyMode::Sync,
                        request.remote_address,
                    )
                    .await;
                GateDecision::Completed(outcome)
            }
            CopyMode::Async => {
                let coordinator = self.coordinator.clone();
                let requester = request.remote_address.map(str::to_string);
                tokio::spawn(async move {
                    coordinator
                        .ensure_pulled(
                            &image,
                            &source,
                            &destination,
                            CopyMode::Async,
                            requester.as_deref(),
                        )
                        .await;
                });
                GateDecision::Detached
            }
        }
    }
}
