use crate::config::{Config, RuntimeSettings};
use crate::coordinator::FetchCoordinator;
use crate::copier::ImageCopier;
use crate::error::{PullThroughError, Result};
use crate::gate::{local_source, GateDecision, InboundRequest, RequestGate};
use crate::prepull::spawn_pre_pull;
use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// How often expired pull state is swept
const JANITOR_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub struct AppState<C> {
    pub gate: Arc<RequestGate<C>>,
    pub client: reqwest::Client,
    pub backend_url: Arc<str>,
    pub registry_address: Arc<str>,
}

impl<C> Clone for AppState<C> {
    fn clone(&self) -> Self {
        Self {
            gate: self.gate.clone(),
            client: self.client.clone(),
            backend_url: self.backend_url.clone(),
            registry_address: self.registry_address.clone(),
        }
    }
}

/// A running front server
pub struct Server<C> {
    pub local_addr: SocketAddr,
    pub gate: Arc<RequestGate<C>>,
    pub handle: tokio::task::JoinHandle<()>,
}

pub fn build_router<C: ImageCopier>(state: AppState<C>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/pull/stats", get(pull_stats::<C>))
        .fallback(forward::<C>)
        .with_state(state)
}

pub fn backend_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        // registry redirects (blob storage) go back to the client untouched
        .redirect(reqwest::redirect::Policy::none())
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(PullThroughError::Http)
}

pub async fn start_server<C: ImageCopier>(config: Config, copier: C) -> Result<Server<C>> {
    let copier = Arc::new(copier);
    let coordinator = Arc::new(FetchCoordinator::from_config(&config.pull, copier.clone()));
    coordinator.store().spawn_janitor(JANITOR_INTERVAL);

    let gate = Arc::new(RequestGate::new(
        coordinator,
        RuntimeSettings::from(&config.pull),
    ));

    if config.pre_pull.image_list_file.is_some() {
        spawn_pre_pull(
            config.pre_pull.clone(),
            local_source(&config.server.registry_address),
            copier,
        );
    }

    let state = AppState {
        gate: gate.clone(),
        client: backend_client()?,
        backend_url: Arc::from(config.server.backend_url()),
        registry_address: Arc::from(config.server.registry_address.as_str()),
    };

    let listener = tokio::net::TcpListener::bind(&config.server.listen_address)
        .await
        .map_err(|e| {
            PullThroughError::Config(format!(
                "Failed to bind to {}: {}",
                config.server.listen_address, e
            ))
        })?;
    let local_addr = listener.local_addr()?;
    tracing::info!(
        listen = %local_addr,
        backend = %state.backend_url,
        "Pull-through server listening"
    );

    let app = build_router(state);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        {
            error!("HTTP server error after startup: {}", e);
        } else {
            tracing::info!("HTTP server stopped");
        }
    });

    Ok(Server {
        local_addr,
        gate,
        handle,
    })
}

async fn health() -> impl IntoResponse {
    tracing::debug!("GET /health - Health check request");
    (StatusCode::OK, "ok")
}

#[derive(Serialize)]
struct PullStats {
    tracked: usize,
    pulling: usize,
    pulled: usize,
    copy_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    mirror: Option<String>,
}

/// GET /api/v1/pull/stats
async fn pull_stats<C: ImageCopier>(State(state): State<AppState<C>>) -> impl IntoResponse {
    let store = state.gate.coordinator().store();
    let stats = store.stats();
    let settings = state.gate.settings();
    Json(PullStats {
        tracked: store.len(),
        pulling: stats.pulling,
        pulled: stats.pulled,
        copy_mode: settings.copy_mode.to_string(),
        mirror: settings.mirror,
    })
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Every registry request: pull-through step, then hand off to the backend
async fn forward<C: ImageCopier>(
    State(state): State<AppState<C>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    request: Request,
) -> Response {
    let remote = peer.map(|ConnectInfo(addr)| addr.to_string());
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| request.uri().host())
        .unwrap_or_default()
        .to_string();
    // the request body is not Sync, so nothing borrowed from it may cross the await
    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();

    let decision = state
        .gate
        .handle(InboundRequest {
            method: &method,
            host: &host,
            path: &path,
            listen_address: &state.registry_address,
            remote_address: remote.as_deref(),
        })
        .await;
    if !matches!(decision, GateDecision::Skipped(_)) {
        tracing::debug!(?decision, path = %path, "Pull-through step done");
    }

    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", state.backend_url, path_and_query);

    let mut upstream = state.client.request(parts.method.clone(), &url);
    // Host goes through as-is: the backend builds upload Location URLs from it
    for (name, value) in parts.headers.iter() {
        if !is_hop_by_hop(name) {
            upstream = upstream.header(name, value);
        }
    }
    if let Some(addr) = &remote {
        upstream = upstream.header("x-forwarded-for", addr.as_str());
    }
    let has_body = parts.headers.contains_key(header::CONTENT_LENGTH)
        || parts.headers.contains_key(header::TRANSFER_ENCODING);
    if has_body {
        upstream = upstream.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }

    let upstream = match upstream.send().await {
        Ok(response) => response,
        Err(e) => {
            error!(url = %url, error = %e, "Backend registry request failed");
            return (StatusCode::BAD_GATEWAY, "backend registry unavailable").into_response();
        }
    };

    let mut response = Response::builder().status(upstream.status());
    for (name, value) in upstream.headers() {
        if !is_hop_by_hop(name) {
            response = response.header(name, value);
        }
    }
    match response.body(Body::from_stream(upstream.bytes_stream())) {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "Failed to build response from backend");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}
