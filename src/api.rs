use axum::{
    extract::{rejection::JsonRejection, Json, Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer};
use tracing::{error, info};

use crate::error::{RegistryError, StoreError};
use crate::metrics;
use crate::models::{NotificationEvent, NotificationPreferences, UserId};
use crate::queue::DispatchQueue;
use crate::store::{DeviceRegistration, Store};

const MAX_BODY_BYTES: usize = 64 * 1024;
const MAX_CONCURRENT_REQUESTS: usize = 512;

// Request models
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterDeviceRequest {
    user_id: UserId,
    #[serde(flatten)]
    registration: DeviceRegistration,
}

#[derive(Deserialize)]
struct SetEnabledRequest {
    enabled: bool,
}

// API state
pub struct ApiState<S> {
    pub store: Arc<S>,
    pub queue: DispatchQueue,
    pub api_key: Option<String>,
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl ToString) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.to_string(),
        }
    }

    fn not_found(message: impl ToString) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.to_string(),
        }
    }

    fn internal(e: impl std::fmt::Display) -> Self {
        // Storage detail stays in the logs
        error!(error = %e, "Request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound { .. } => Self::not_found(e),
            RegistryError::Validation(e) => Self::bad_request(e),
            RegistryError::Store(e) => Self::internal(e),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::internal(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::bad_request(e.body_text())
    }
}

// Set up API router
pub fn create_api_router<S: Store>(state: Arc<ApiState<S>>) -> Router {
    let protected = Router::new()
        .route("/metrics", get(|| async { metrics::metrics_handler() }))
        .route("/devices", post(register_device::<S>))
        .route("/devices/:user_id", get(list_devices::<S>))
        .route(
            "/devices/:user_id/:device_id",
            axum::routing::delete(unregister_device::<S>),
        )
        .route("/devices/:user_id/:device_id/enabled", put(set_enabled::<S>))
        .route(
            "/preferences/:user_id",
            get(get_preferences::<S>).put(update_preferences::<S>),
        )
        .route("/events", post(submit_event::<S>))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key::<S>));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(protected)
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .layer(CorsLayer::permissive())
}

async fn require_api_key<S: Store>(
    State(state): State<Arc<ApiState<S>>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };

    let presented = request
        .headers()
        .get("x-api-key")
        .map(|v| v.as_bytes())
        .unwrap_or_default();

    if constant_time_eq::constant_time_eq(presented, expected.as_bytes()) {
        next.run(request).await
    } else {
        StatusCode::UNAUTHORIZED.into_response()
    }
}

// API handlers
async fn register_device<S: Store>(
    State(state): State<Arc<ApiState<S>>>,
    payload: Result<Json<RegisterDeviceRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = payload?;
    if req.user_id.trim().is_empty() {
        return Err(ApiError::bad_request("userId must not be empty"));
    }

    let device = state.store.register_device(&req.user_id, req.registration).await?;
    info!(
        user_id = %req.user_id,
        device_id = %device.device_id,
        transport = %device.transport_kind,
        "Device registered"
    );
    Ok(Json(device).into_response())
}

async fn list_devices<S: Store>(
    State(state): State<Arc<ApiState<S>>>,
    Path(user_id): Path<String>,
) -> Result<Response, ApiError> {
    let devices = state.store.list_devices(&user_id).await?;
    Ok(Json(devices).into_response())
}

async fn unregister_device<S: Store>(
    State(state): State<Arc<ApiState<S>>>,
    Path((user_id, device_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    if state.store.unregister_device(&user_id, &device_id).await? {
        info!(user_id = %user_id, device_id = %device_id, "Device unregistered");
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn set_enabled<S: Store>(
    State(state): State<Arc<ApiState<S>>>,
    Path((user_id, device_id)): Path<(String, String)>,
    payload: Result<Json<SetEnabledRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = payload?;
    let device = state.store.set_enabled(&user_id, &device_id, req.enabled).await?;
    info!(user_id = %user_id, device_id = %device_id, enabled = req.enabled, "Device toggled");
    Ok(Json(device).into_response())
}

async fn get_preferences<S: Store>(
    State(state): State<Arc<ApiState<S>>>,
    Path(user_id): Path<String>,
) -> Result<Json<NotificationPreferences>, ApiError> {
    let mut found = state.store.preferences_for(&[user_id.clone()]).await?;
    found
        .remove(&user_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("user {user_id} not found")))
}

async fn update_preferences<S: Store>(
    State(state): State<Arc<ApiState<S>>>,
    Path(user_id): Path<String>,
    payload: Result<Json<NotificationPreferences>, JsonRejection>,
) -> Result<Json<NotificationPreferences>, ApiError> {
    let Json(preferences) = payload?;
    state
        .store
        .update_preferences(&user_id, preferences)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("user {user_id} not found")))
}

async fn submit_event<S: Store>(
    State(state): State<Arc<ApiState<S>>>,
    payload: Result<Json<NotificationEvent>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(event) = payload?;
    if let Err(e) = event.validate() {
        metrics::EVENTS_INVALID.inc();
        return Err(ApiError::bad_request(e));
    }

    match state.queue.submit(event) {
        Ok(()) => Ok(StatusCode::ACCEPTED),
        Err(e) => Err(ApiError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: e.to_string(),
        }),
    }
}
