//! Web server module.

mod auth;
mod handlers;

pub use auth::{create_access_token, verify_credentials};

use crate::config::Settings;
use crate::db::{DbError, Store};
use crate::probe::TraceError;
use crate::registry::{Registry, RegistryError};

use axum::{
    extract::rejection::JsonRejection,
    extract::{DefaultBodyLimit, FromRequest, Request},
    http::{HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, patch, post},
    Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Arc<Store>,
    pub registry: Arc<Registry>,
}

/// User-facing error with the HTTP status taxonomy.
///
/// Every variant renders as `{"detail": "<message>"}`; messages never carry
/// internals beyond what the client may see.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Unauthenticated(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound => ApiError::NotFound("Target not found".to_string()),
            RegistryError::DuplicateTarget
            | RegistryError::InvalidIp
            | RegistryError::InvalidFrequency => ApiError::BadRequest(e.to_string()),
            RegistryError::Store(db) => db.into(),
        }
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound => ApiError::NotFound("Target not found".to_string()),
            DbError::Duplicate => ApiError::BadRequest("IP already monitored".to_string()),
            DbError::Sqlite(e) => {
                tracing::error!("Store error surfaced to API: {}", e);
                ApiError::Unavailable("Storage temporarily unavailable".to_string())
            }
            DbError::Migration(e) => {
                tracing::error!("Migration error surfaced to API: {}", e);
                ApiError::Internal("Internal server error".to_string())
            }
        }
    }
}

impl From<TraceError> for ApiError {
    fn from(e: TraceError) -> Self {
        ApiError::Unavailable(e.to_string())
    }
}

/// JSON body extractor whose rejections stay inside the error envelope.
///
/// Axum's stock `Json` rejection answers with plain text and its own status
/// codes; a malformed or incomplete body must instead surface as a 400 with
/// the `{"detail": ...}` shape like every other user-facing error.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(ApiError::BadRequest(rejection.body_text())),
        }
    }
}

/// Web server for PingMeDaddy.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given collaborators.
    pub fn new(settings: Arc<Settings>, store: Arc<Store>, registry: Arc<Registry>) -> Self {
        Self {
            state: AppState {
                settings,
                store,
                registry,
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        // Everything under /targets requires a bearer token.
        let protected = Router::new()
            .route(
                "/targets/",
                get(handlers::handle_list_targets).post(handlers::handle_create_target),
            )
            .route(
                "/targets/{id}",
                patch(handlers::handle_update_target).delete(handlers::handle_delete_target),
            )
            .route("/targets/{id}/pause", post(handlers::handle_pause_target))
            .route("/targets/{id}/resume", post(handlers::handle_resume_target))
            .route("/targets/{id}/logs", get(handlers::handle_get_logs))
            .route("/targets/{id}/logs/export", get(handlers::handle_export_logs))
            .route("/targets/{id}/events", get(handlers::handle_get_events))
            .route("/targets/{id}/insights", get(handlers::handle_get_insights))
            .route("/targets/{id}/traceroute", post(handlers::handle_traceroute))
            .route_layer(middleware::from_fn_with_state(
                self.state.clone(),
                auth::require_auth,
            ));

        Router::new()
            .route("/auth/login", post(auth::handle_login))
            .merge(protected)
            .layer(cors_layer(&self.state.settings))
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Serve until the shutdown signal resolves.
    pub async fn start(
        &self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.settings.app_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

fn cors_layer(settings: &Settings) -> CorsLayer {
    if settings.cors_origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let origins: Vec<HeaderValue> = settings
        .cors_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}
