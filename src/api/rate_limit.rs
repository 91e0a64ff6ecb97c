use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::api::error::ApiResult;
use crate::api::ApiState;
use crate::models::{RateScope, WorkspaceId};
use crate::rate_limit::{RateLimiter, Usage};
use crate::registry::WorkspaceRegistry;

pub fn router() -> OpenApiRouter<ApiState> {
    OpenApiRouter::new().routes(routes!(rate_limit_snapshot))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WorkspaceUsage {
    pub workspace_id: WorkspaceId,
    pub display_name: String,
    pub workspace: Vec<Usage>,
    pub per_user: Vec<(String, Vec<Usage>)>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RateLimitResponse {
    pub workspaces: Vec<WorkspaceUsage>,
}

/// Per-workspace and per-user rate-limit standing
#[utoipa::path(get, path = "/rate-limit",
    tags = ["Rate Limit"],
    responses((status = 200, description = "Usage snapshot for every enabled workspace", body = RateLimitResponse)),
)]
async fn rate_limit_snapshot(
    State(registry): State<Arc<WorkspaceRegistry>>,
    State(rate_limiter): State<Arc<dyn RateLimiter>>,
) -> ApiResult<RateLimitResponse> {
    let snapshot = registry.snapshot();
    let now = Utc::now();

    let mut workspaces = Vec::new();
    for workspace in snapshot.workspaces.values() {
        let (daily_limit, hourly_limit) = workspace.effective_limit(None);
        let workspace_usage = vec![
            rate_limiter.usage(RateScope::WorkspaceDaily, workspace.id, None, daily_limit, now).await?,
            rate_limiter.usage(RateScope::WorkspaceHourly, workspace.id, None, hourly_limit, now).await?,
        ];

        let mut per_user = Vec::new();
        for user_id in workspace.limits.per_user_overrides.keys() {
            let (user_daily, user_hourly) = workspace.effective_limit(Some(user_id));
            per_user.push((
                user_id.clone(),
                vec![
                    rate_limiter.usage(RateScope::UserDaily, workspace.id, Some(user_id), user_daily, now).await?,
                    rate_limiter.usage(RateScope::UserHourly, workspace.id, Some(user_id), user_hourly, now).await?,
                ],
            ));
        }

        workspaces.push(WorkspaceUsage {
            workspace_id: workspace.id,
            display_name: workspace.display_name.clone(),
            workspace: workspace_usage,
            per_user,
        });
    }

    Ok(Json(RateLimitResponse { workspaces }))
}
