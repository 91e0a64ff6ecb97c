use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use garde::Validate;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::api::error::{ApiError, ApiResult};
use crate::api::validation::{ValidatedJson, ValidatedQuery};
use crate::api::ApiState;
use crate::models::{Pool, PoolId, Selection, SelectionStrategy, WorkspaceId};
use crate::store::PoolStore;

pub fn router() -> OpenApiRouter<ApiState> {
    OpenApiRouter::new()
        .routes(routes!(list_pools))
        .routes(routes!(create_pool))
        .routes(routes!(get_pool, update_pool, delete_pool))
        .routes(routes!(toggle_pool))
        .routes(routes!(recent_selections))
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreatePoolRequest {
    #[garde(length(min = 1))]
    pub name: String,
    #[garde(length(min = 1))]
    pub domain_patterns: Vec<String>,
    #[garde(length(min = 1))]
    pub member_workspace_ids: Vec<WorkspaceId>,
    #[garde(skip)]
    pub strategy: SelectionStrategy,
    #[garde(skip)]
    pub is_default: bool,
    #[garde(skip)]
    #[serde(default)]
    pub weights: BTreeMap<WorkspaceId, u32>,
}

impl From<CreatePoolRequest> for Pool {
    fn from(req: CreatePoolRequest) -> Self {
        let now = Utc::now();
        Pool {
            id: PoolId::new(),
            name: req.name,
            domain_patterns: req.domain_patterns,
            member_workspace_ids: req.member_workspace_ids,
            strategy: req.strategy,
            enabled: true,
            is_default: req.is_default,
            weights: req.weights,
            selection_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct UpdatePoolRequest {
    #[garde(length(min = 1))]
    pub name: String,
    #[garde(length(min = 1))]
    pub domain_patterns: Vec<String>,
    #[garde(length(min = 1))]
    pub member_workspace_ids: Vec<WorkspaceId>,
    #[garde(skip)]
    pub strategy: SelectionStrategy,
    #[garde(skip)]
    pub enabled: bool,
    #[garde(skip)]
    pub is_default: bool,
    #[garde(skip)]
    #[serde(default)]
    pub weights: BTreeMap<WorkspaceId, u32>,
}

#[derive(Debug, Deserialize, Validate, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ToggleQuery {
    #[garde(skip)]
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Validate, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct SelectionsQuery {
    #[garde(skip)]
    #[serde(default = "default_selection_limit")]
    pub limit: i64,
}

fn default_selection_limit() -> i64 {
    50
}

/// List configured pools
#[utoipa::path(get, path = "/pools",
    tags = ["Pools"],
    responses((status = 200, description = "All configured pools", body = Vec<Pool>)),
)]
async fn list_pools(State(store): State<Arc<dyn PoolStore>>) -> ApiResult<Vec<Pool>> {
    let pools = store.list_pools().await?;
    Ok(Json(pools))
}

/// Create a pool
#[utoipa::path(post, path = "/pools",
    tags = ["Pools"],
    request_body = CreatePoolRequest,
    responses((status = 200, description = "Pool created", body = Pool)),
)]
async fn create_pool(
    State(store): State<Arc<dyn PoolStore>>,
    ValidatedJson(req): ValidatedJson<CreatePoolRequest>,
) -> ApiResult<Pool> {
    let pool = store.create_pool(req.into()).await?;
    Ok(Json(pool))
}

/// Fetch one pool
#[utoipa::path(get, path = "/pools/{id}",
    tags = ["Pools"],
    params(("id" = PoolId, Path)),
    responses(
        (status = 200, description = "Pool detail", body = Pool),
        (status = 404, description = "No such pool"),
    )
)]
async fn get_pool(Path(id): Path<PoolId>, State(store): State<Arc<dyn PoolStore>>) -> ApiResult<Pool> {
    let pool = store.get_pool(id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(pool))
}

/// Replace a pool's configuration
#[utoipa::path(put, path = "/pools/{id}",
    tags = ["Pools"],
    params(("id" = PoolId, Path)),
    request_body = UpdatePoolRequest,
    responses((status = 200, description = "Pool updated", body = Pool)),
)]
async fn update_pool(
    Path(id): Path<PoolId>,
    State(store): State<Arc<dyn PoolStore>>,
    ValidatedJson(req): ValidatedJson<UpdatePoolRequest>,
) -> ApiResult<Pool> {
    let existing = store.get_pool(id).await?.ok_or(ApiError::NotFound)?;
    let pool = Pool {
        id,
        name: req.name,
        domain_patterns: req.domain_patterns,
        member_workspace_ids: req.member_workspace_ids,
        strategy: req.strategy,
        enabled: req.enabled,
        is_default: req.is_default,
        weights: req.weights,
        selection_count: existing.selection_count,
        created_at: existing.created_at,
        updated_at: Utc::now(),
    };
    let pool = store.update_pool(pool).await?;
    Ok(Json(pool))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ActionResponse {
    pub message: String,
}

/// Delete a pool
#[utoipa::path(delete, path = "/pools/{id}",
    tags = ["Pools"],
    params(("id" = PoolId, Path)),
    responses((status = 200, description = "Pool removed", body = ActionResponse)),
)]
async fn delete_pool(Path(id): Path<PoolId>, State(store): State<Arc<dyn PoolStore>>) -> ApiResult<ActionResponse> {
    store.delete_pool(id).await?;
    Ok(Json(ActionResponse { message: "pool deleted".into() }))
}

/// Enable or disable a pool
#[utoipa::path(post, path = "/pools/{id}/toggle",
    tags = ["Pools"],
    params(("id" = PoolId, Path), ToggleQuery),
    responses((status = 200, description = "Pool toggled", body = Pool)),
)]
async fn toggle_pool(
    Path(id): Path<PoolId>,
    ValidatedQuery(query): ValidatedQuery<ToggleQuery>,
    State(store): State<Arc<dyn PoolStore>>,
) -> ApiResult<Pool> {
    let pool = store.toggle_pool(id, query.enabled).await?;
    Ok(Json(pool))
}

/// Recent Selection audit rows
#[utoipa::path(get, path = "/pools/selections",
    tags = ["Pools"],
    params(SelectionsQuery),
    responses((status = 200, description = "Most recent selections, newest first", body = Vec<Selection>)),
)]
async fn recent_selections(
    ValidatedQuery(query): ValidatedQuery<SelectionsQuery>,
    State(store): State<Arc<dyn PoolStore>>,
) -> ApiResult<Vec<Selection>> {
    let selections = store.recent_selections(query.limit).await?;
    Ok(Json(selections))
}
