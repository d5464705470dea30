//! CRUD and manual-send endpoints for scheduled notifications.
//!
//! Routes:
//! - `POST   /notifications` schedule a new notification
//! - `GET    /notifications` list unsent notifications, soonest first
//! - `GET    /notifications/:id` fetch one notification
//! - `PUT    /notifications/:id` replace fields (unsent only)
//! - `DELETE /notifications/:id` delete, sent or not
//! - `POST   /notifications/:id/send` mark sent now and queue for delivery

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::dispatcher::Dispatcher;
use crate::error::NotificationError;
use crate::notification::{Notification, NotificationParams};
use crate::repository::NotificationStore;

/// Shared state for the notification routes.
pub type NotificationsState = Arc<NotificationsApiState>;

#[derive(Clone)]
pub struct NotificationsApiState {
    pub store: Arc<dyn NotificationStore>,
    pub dispatcher: Arc<Dispatcher>,
}

type ApiError = (StatusCode, Json<serde_json::Value>);

// ---- Request / response shapes ----

#[derive(Debug, Serialize, Deserialize)]
pub struct ListResponse {
    pub notifications: Vec<Notification>,
}

// ---- Helpers ----

fn error_response(err: NotificationError) -> ApiError {
    let status = match &err {
        NotificationError::NotFound { .. } => StatusCode::NOT_FOUND,
        NotificationError::NotFoundOrAlreadySent { .. } => StatusCode::CONFLICT,
        NotificationError::Invalid { .. } => StatusCode::BAD_REQUEST,
        NotificationError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        NotificationError::Publish(_) => StatusCode::SERVICE_UNAVAILABLE,
    };

    if status.is_server_error() {
        tracing::error!("Request failed: {}", err);
    }

    (
        status,
        Json(serde_json::json!({
            "error": err.to_string(),
            "kind": err.kind(),
        })),
    )
}

/// Unwrap a JSON body and check it. Malformed JSON, unknown channels,
/// missing fields and bad timestamps all become `Invalid` (400).
fn parse_params(
    payload: Result<Json<NotificationParams>, JsonRejection>,
) -> Result<NotificationParams, ApiError> {
    let Json(params) = payload
        .map_err(|rejection| error_response(NotificationError::invalid(rejection.body_text())))?;

    if params.recipient.trim().is_empty() {
        return Err(error_response(NotificationError::invalid(
            "recipient must not be empty",
        )));
    }
    Ok(params)
}

// ---- Handlers ----

/// `POST /notifications`: schedule a new notification.
pub async fn create_notification(
    State(state): State<NotificationsState>,
    payload: Result<Json<NotificationParams>, JsonRejection>,
) -> Result<(StatusCode, Json<Notification>), ApiError> {
    let body = parse_params(payload)?;

    let notification = state.store.create(&body).await.map_err(error_response)?;

    tracing::info!(
        "Scheduled notification {} via {} for {}",
        notification.id,
        notification.channel,
        notification.send_at
    );
    Ok((StatusCode::CREATED, Json(notification)))
}

/// `GET /notifications`: unsent notifications ordered by `send_at`.
pub async fn list_notifications(
    State(state): State<NotificationsState>,
) -> Result<Json<ListResponse>, ApiError> {
    let notifications = state.store.list_pending().await.map_err(error_response)?;
    Ok(Json(ListResponse { notifications }))
}

/// `GET /notifications/:id`
pub async fn get_notification(
    State(state): State<NotificationsState>,
    Path(id): Path<i64>,
) -> Result<Json<Notification>, ApiError> {
    let notification = state.store.get(id).await.map_err(error_response)?;
    Ok(Json(notification))
}

/// `PUT /notifications/:id`: replace all editable fields.
pub async fn update_notification(
    State(state): State<NotificationsState>,
    Path(id): Path<i64>,
    payload: Result<Json<NotificationParams>, JsonRejection>,
) -> Result<Json<Notification>, ApiError> {
    let body = parse_params(payload)?;

    let notification = state.store.update(id, &body).await.map_err(error_response)?;
    Ok(Json(notification))
}

/// `DELETE /notifications/:id`
pub async fn delete_notification(
    State(state): State<NotificationsState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.store.delete(id).await.map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /notifications/:id/send`: send now, bypassing the schedule.
pub async fn send_notification(
    State(state): State<NotificationsState>,
    Path(id): Path<i64>,
) -> Result<Json<Notification>, ApiError> {
    let notification = state.dispatcher.send(id).await.map_err(error_response)?;
    Ok(Json(notification))
}

pub fn create_notifications_router(state: NotificationsState) -> Router {
    Router::new()
        .route(
            "/notifications",
            post(create_notification).get(list_notifications),
        )
        .route(
            "/notifications/:id",
            get(get_notification)
                .put(update_notification)
                .delete(delete_notification),
        )
        .route("/notifications/:id/send", post(send_notification))
        .with_state(state)
}
