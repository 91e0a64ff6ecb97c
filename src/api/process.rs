use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::api::ApiState;
use crate::dispatch::DispatchWorker;

pub fn router() -> OpenApiRouter<ApiState> {
    OpenApiRouter::new().routes(routes!(trigger_process))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ActionResponse {
    pub message: String,
}

/// Wake the dispatch worker for an immediate lease sweep
#[utoipa::path(post, path = "/process",
    tags = ["Misc"],
    responses((status = 200, description = "Sweep triggered", body = ActionResponse)),
)]
async fn trigger_process(State(worker): State<Arc<DispatchWorker>>) -> Json<ActionResponse> {
    worker.trigger_sweep();
    Json(ActionResponse { message: "lease sweep triggered".into() })
}
