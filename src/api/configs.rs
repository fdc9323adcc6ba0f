use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::ErrorResponse;
use crate::model::{ApiConfig, ConfigUpdate};
use crate::store::StoreError;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ConfigList {
    pub data: Vec<ApiConfig>,
}

/// `GET /api/config`.  Configs whose identity no longer has any trace are
/// deleted first, so the listing only shows APIs present in history.
pub async fn list_configs(State(state): State<AppState>) -> Result<Json<ConfigList>, ErrorResponse> {
    let active = state.store.find_distinct_identities().await?;
    let removed = state.store.delete_configs_not_in(&active).await?;
    if removed > 0 {
        tracing::info!(removed, "dropped configs without traces");
    }
    let data = state
        .store
        .list_configs()
        .await?
        .into_iter()
        .filter(|c| active.contains(&c.api_identity))
        .collect();
    Ok(Json(ConfigList { data }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConfig {
    #[serde(alias = "apiName")]
    pub api_identity: Option<String>,
}

/// `POST /api/config`.  The start date is the oldest trace of the identity,
/// or now when it has never been seen.
pub async fn create_config(
    State(state): State<AppState>,
    Json(body): Json<NewConfig>,
) -> Result<impl IntoResponse, ErrorResponse> {
    let identity = body
        .api_identity
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ErrorResponse::bad_request("API name is required"))?;

    let start_date = match state.store.first_trace_at(&identity).await? {
        Some(first) => first,
        None => state.tracer.clock().now(),
    };
    match state
        .store
        .create_config(ApiConfig::with_defaults(identity, start_date))
        .await
    {
        Ok(created) => Ok((StatusCode::CREATED, Json(created))),
        Err(StoreError::Conflict(_)) => Err(ErrorResponse::bad_request("API config already exists")),
        Err(other) => Err(other.into()),
    }
}

/// `PUT /api/config/{identity}`: partial policy update.
pub async fn update_config(
    State(state): State<AppState>,
    Path(identity): Path<String>,
    Json(update): Json<ConfigUpdate>,
) -> Result<Json<ApiConfig>, ErrorResponse> {
    let identity = identity.trim().to_lowercase();
    match state.store.update_config(&identity, &update).await? {
        Some(cfg) => {
            tracing::info!(api = %identity, "api config updated");
            Ok(Json(cfg))
        }
        None => Err(ErrorResponse::new(StatusCode::NOT_FOUND, "API config not found")),
    }
}
