use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::api::error::{ApiError, ApiResult};
use crate::api::ApiState;
use crate::models::{Message, MessageFilter, MessageId};
use crate::store::MessageStore;

pub fn router() -> OpenApiRouter<ApiState> {
    OpenApiRouter::new()
        .routes(routes!(list_messages))
        .routes(routes!(get_message))
        .routes(routes!(delete_message))
        .routes(routes!(resend_message))
}

/// List messages, optionally filtered by status
#[utoipa::path(get, path = "/messages",
    tags = ["Messages"],
    params(MessageFilter),
    responses(
        (status = 200, description = "Paginated message list", body = Vec<Message>),
    )
)]
async fn list_messages(Query(filter): Query<MessageFilter>, State(store): State<Arc<dyn MessageStore>>) -> ApiResult<Vec<Message>> {
    let messages = store.query(filter).await?;
    Ok(Json(messages))
}

/// Fetch full detail for one message
#[utoipa::path(get, path = "/messages/{id}",
    tags = ["Messages"],
    params(("id" = MessageId, Path)),
    responses(
        (status = 200, description = "Message detail", body = Message),
        (status = 404, description = "No such message"),
    )
)]
async fn get_message(Path(id): Path<MessageId>, State(store): State<Arc<dyn MessageStore>>) -> ApiResult<Message> {
    let message = store.get(id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(message))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ActionResponse {
    pub message: String,
}

/// Remove a non-processing message
#[utoipa::path(delete, path = "/messages/{id}",
    tags = ["Messages"],
    params(("id" = MessageId, Path)),
    responses(
        (status = 200, description = "Message removed", body = ActionResponse),
        (status = 409, description = "Message is currently processing"),
    )
)]
async fn delete_message(Path(id): Path<MessageId>, State(store): State<Arc<dyn MessageStore>>) -> ApiResult<ActionResponse> {
    store.delete(id).await?;
    Ok(Json(ActionResponse { message: "message deleted".into() }))
}

/// Re-queue a failed message for another delivery attempt
#[utoipa::path(post, path = "/messages/{id}/resend",
    tags = ["Messages"],
    params(("id" = MessageId, Path)),
    responses(
        (status = 200, description = "Message re-queued", body = ActionResponse),
    )
)]
async fn resend_message(Path(id): Path<MessageId>, State(store): State<Arc<dyn MessageStore>>) -> ApiResult<ActionResponse> {
    store.resend(id).await?;
    Ok(Json(ActionResponse { message: "message re-queued".into() }))
}
