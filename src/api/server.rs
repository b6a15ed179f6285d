//! HTTP API server with SSE support

use crate::error::HeapscopeError;
use crate::service::{Heapscope, ObjectReport, SizeRefresh, TypeStats};
use crate::trace::TreeLine;
use crate::types::{Lookup, ObjectId, ObjectSummary};
use crate::heap::AllocationSite;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive},
        IntoResponse, Response, Sse,
    },
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, future::Future, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio_stream::{wrappers::BroadcastStream, StreamExt as _};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

/// Alternative ports tried after the configured one
const PORT_FALLBACKS: u16 = 10;

/// API server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiServerConfig {
    /// Server address
    pub addr: SocketAddr,
    /// Census event channel capacity
    pub event_capacity: usize,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            addr: ([127, 0, 0, 1], 8088).into(),
            event_capacity: 256,
        }
    }
}

/// API server state
#[derive(Clone)]
struct AppState {
    scope: Arc<Heapscope>,
    /// Instance ID
    instance_id: String,
}

/// API server
pub struct ApiServer {
    config: ApiServerConfig,
    scope: Arc<Heapscope>,
    instance_id: String,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, scope: Arc<Heapscope>) -> Self {
        let instance_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        Self {
            config,
            scope,
            instance_id,
        }
    }

    /// Get instance ID
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Router with every route and middleware installed
    pub fn router(&self) -> Router {
        Self::build_router(AppState {
            scope: self.scope.clone(),
            instance_id: self.instance_id.clone(),
        })
    }

    fn build_router(state: AppState) -> Router {
        Router::new()
            // Census
            .route("/", get(overview_handler))
            .route("/history/:type_name", get(history_handler))
            .route("/sizes/refresh", post(refresh_sizes_handler))
            .route("/census/stream", get(census_stream_handler))
            // Tracing
            .route("/trace/:type_name", get(trace_type_handler))
            .route("/trace/:type_name/:id", get(trace_object_handler))
            .route("/tree/:type_name/:id", get(tree_handler))
            .route("/allocations", get(allocations_handler))
            // Health check
            .route("/health", get(health_handler))
            .with_state(state)
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the configured address, or one of the next ports if it is taken
    pub async fn bind(&self) -> anyhow::Result<(TcpListener, SocketAddr)> {
        let base_port = self.config.addr.port();
        for offset in 0..=PORT_FALLBACKS {
            let Some(port) = base_port.checked_add(offset) else {
                break;
            };
            let addr = SocketAddr::new(self.config.addr.ip(), port);

            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    let bound = listener.local_addr()?;
                    return Ok((listener, bound));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    debug!("Port {} in use, trying next port", port);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(anyhow::anyhow!(
            "All ports ({}-{}) are in use, heapscope server [{}] unavailable",
            base_port,
            base_port.saturating_add(PORT_FALLBACKS),
            self.instance_id
        ))
    }

    /// Serve until `shutdown` resolves
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (listener, addr) = self.bind().await?;
        if addr.port() != self.config.addr.port() {
            warn!(configured = %self.config.addr, %addr, "configured port in use, fell back");
        }
        info!("heapscope server [{}] listening on http://{}", self.instance_id, addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("heapscope server [{}] stopped", self.instance_id);
        Ok(())
    }
}

/// Resolve once `signal` fires, or at once if listening for it failed
pub async fn shutdown_signal<F>(signal: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => warn!(error = %e, "failed to listen for shutdown signal, shutting down"),
    }
}

/// Error body returned for misses and faults
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorResponse { error: self.1 })).into_response()
    }
}

impl From<HeapscopeError> for ApiError {
    fn from(e: HeapscopeError) -> Self {
        warn!(error = %e, "request failed");
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

fn not_found(message: impl Into<String>) -> ApiError {
    ApiError(StatusCode::NOT_FOUND, message.into())
}

/// Unwrap a lookup, turning misses into 404s
fn found<T>(lookup: Lookup<T>) -> Result<Json<T>, ApiError> {
    match lookup {
        Lookup::Found { result } => Ok(Json(result)),
        miss => Err(not_found(miss.message().unwrap_or_default())),
    }
}

#[derive(Debug, Default, Deserialize)]
struct OverviewQuery {
    floor: Option<u64>,
}

/// Census overview
#[derive(Debug, Serialize, Deserialize)]
pub struct OverviewResponse {
    pub samples: usize,
    pub types: Vec<TypeStats>,
}

async fn overview_handler(
    State(state): State<AppState>,
    Query(query): Query<OverviewQuery>,
) -> Json<OverviewResponse> {
    Json(OverviewResponse {
        samples: state.scope.samples().await,
        types: state.scope.type_stats(query.floor.unwrap_or(0)).await,
    })
}

/// Count history of one type
#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub type_name: String,
    pub counts: Vec<u64>,
}

async fn history_handler(
    State(state): State<AppState>,
    Path(type_name): Path<String>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let counts = state
        .scope
        .history(&type_name)
        .await
        .ok_or_else(|| not_found(format!("No history for type {}.", type_name)))?;
    Ok(Json(HistoryResponse { type_name, counts }))
}

async fn refresh_sizes_handler(
    State(state): State<AppState>,
) -> Result<Json<SizeRefresh>, ApiError> {
    Ok(Json(state.scope.refresh_sizes().await?))
}

async fn trace_type_handler(
    State(state): State<AppState>,
    Path(type_name): Path<String>,
) -> Result<Json<Vec<ObjectSummary>>, ApiError> {
    found(state.scope.trace_type(&type_name).await?)
}

async fn trace_object_handler(
    State(state): State<AppState>,
    Path((type_name, id)): Path<(String, u64)>,
) -> Result<Json<ObjectReport>, ApiError> {
    found(state.scope.trace_object(&type_name, ObjectId(id)).await?)
}

#[derive(Debug, Default, Deserialize)]
struct TreeQuery {
    max_results: Option<usize>,
}

async fn tree_handler(
    State(state): State<AppState>,
    Path((type_name, id)): Path<(String, u64)>,
    Query(query): Query<TreeQuery>,
) -> Result<Json<Vec<TreeLine>>, ApiError> {
    let lookup = state
        .scope
        .build_tree(&type_name, ObjectId(id), query.max_results)
        .await?
        .map(|entries| entries.into_iter().map(TreeLine::from).collect());
    found(lookup)
}

#[derive(Debug, Default, Deserialize)]
struct AllocationsQuery {
    limit: Option<usize>,
}

async fn allocations_handler(
    State(state): State<AppState>,
    Query(query): Query<AllocationsQuery>,
) -> Result<Json<Vec<AllocationSite>>, ApiError> {
    state
        .scope
        .allocation_report(query.limit.unwrap_or(50))
        .await?
        .map(Json)
        .ok_or_else(|| not_found("Allocation sites are not recorded by this heap."))
}

/// Census tick stream
async fn census_stream_handler(
    State(state): State<AppState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    debug!("New census stream client connected");
    let rx = state.scope.events().subscribe();

    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => {
            let data = serde_json::to_string(&event).ok()?;
            Some(Ok(SseEvent::default()
                .event("census")
                .id(event.tick.to_string())
                .data(data)))
        }
        Err(_) => None, // Skip lagged messages
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Health check handler
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub instance_id: String,
    pub subscribers: usize,
    pub ticks: u64,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        instance_id: state.instance_id.clone(),
        subscribers: state.scope.events().subscriber_count(),
        ticks: state.scope.sampler().ticks(),
    })
}
