use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::api::error::ApiResult;
use crate::api::ApiState;
use crate::models::MessageStatus;
use crate::store::MessageStore;

pub fn router() -> OpenApiRouter<ApiState> {
    OpenApiRouter::new().routes(routes!(stats))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StatsResponse {
    pub queued: i64,
    pub processing: i64,
    pub sent: i64,
    pub failed: i64,
    pub total: i64,
}

/// Message counts by status
#[utoipa::path(get, path = "/stats",
    tags = ["Misc"],
    responses(
        (status = 200, description = "Counts by status, totals", body = StatsResponse),
    )
)]
async fn stats(State(store): State<Arc<dyn MessageStore>>) -> ApiResult<StatsResponse> {
    let counts = store.status_counts().await?;

    let mut response = StatsResponse { queued: 0, processing: 0, sent: 0, failed: 0, total: 0 };
    for (status, count) in counts {
        match status {
            MessageStatus::Queued => response.queued = count,
            MessageStatus::Processing => response.processing = count,
            MessageStatus::Sent => response.sent = count,
            MessageStatus::Failed => response.failed = count,
        }
        response.total += count;
    }

    Ok(Json(response))
}
