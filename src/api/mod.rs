use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::FromRef;
use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;

pub mod error;
mod health;
mod messages;
mod pools;
mod process;
mod rate_limit;
mod stats;
mod validation;

use crate::breaker::BreakerRegistry;
use crate::dispatch::DispatchWorker;
use crate::rate_limit::RateLimiter;
use crate::registry::WorkspaceRegistry;
use crate::store::{MessageStore, PoolStore};

#[derive(Debug, Error)]
pub enum ApiServerError {
    #[error("failed to bind to address: {0}")]
    Bind(std::io::Error),
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

#[derive(Clone)]
pub struct ApiState {
    pub message_store: Arc<dyn MessageStore>,
    pub pool_store: Arc<dyn PoolStore>,
    pub registry: Arc<WorkspaceRegistry>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub breakers: Arc<BreakerRegistry>,
    pub dispatch: Arc<DispatchWorker>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub max_body_bytes: usize,
}

impl FromRef<ApiState> for Arc<dyn MessageStore> {
    fn from_ref(state: &ApiState) -> Self {
        state.message_store.clone()
    }
}

impl FromRef<ApiState> for Arc<dyn PoolStore> {
    fn from_ref(state: &ApiState) -> Self {
        state.pool_store.clone()
    }
}

impl FromRef<ApiState> for Arc<WorkspaceRegistry> {
    fn from_ref(state: &ApiState) -> Self {
        state.registry.clone()
    }
}

impl FromRef<ApiState> for Arc<dyn RateLimiter> {
    fn from_ref(state: &ApiState) -> Self {
        state.rate_limiter.clone()
    }
}

impl FromRef<ApiState> for Arc<BreakerRegistry> {
    fn from_ref(state: &ApiState) -> Self {
        state.breakers.clone()
    }
}

impl FromRef<ApiState> for Arc<DispatchWorker> {
    fn from_ref(state: &ApiState) -> Self {
        state.dispatch.clone()
    }
}

pub struct ApiServer {
    router: Router,
    socket: SocketAddr,
    shutdown: CancellationToken,
}

impl ApiServer {
    pub fn new(socket: SocketAddr, state: ApiState, shutdown: CancellationToken) -> ApiServer {
        #[derive(OpenApi)]
        #[openapi(components(schemas(error::ApiErrorResponse)))]
        struct ApiDoc;

        let (router, api_doc) = OpenApiRouter::with_openapi(ApiDoc::openapi())
            .merge(messages::router())
            .merge(stats::router())
            .merge(pools::router())
            .merge(rate_limit::router())
            .merge(process::router())
            .with_state(state.clone())
            .split_for_parts();

        let router = Router::new()
            .nest("/api", router)
            .merge(health::router(state.clone()))
            .route("/api/openapi.json", axum::routing::get(move || async move { axum::Json(api_doc.clone()) }))
            .layer((
                TraceLayer::new_for_http(),
                TimeoutLayer::new(Duration::from_secs(30)),
                RequestBodyLimitLayer::new(state.max_body_bytes),
            ));

        ApiServer { socket, router, shutdown }
    }

    pub async fn serve(self) -> Result<(), ApiServerError> {
        let listener = TcpListener::bind(self.socket).await.map_err(ApiServerError::Bind)?;

        info!("API server listening on {}", self.socket);

        axum::serve(listener, self.router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(wait_for_shutdown(self.shutdown))
            .await
            .map_err(ApiServerError::Serve)
    }

    pub fn spawn(self) {
        tokio::spawn(async {
            let token = self.shutdown.clone();
            if let Err(e) = self.serve().await {
                error!("api server error: {:?}", e);
                token.cancel();
            }
        });
    }
}

async fn wait_for_shutdown(token: CancellationToken) {
    token.cancelled().await;
}
