use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use tally_common::transaction::TransactionRecord;

use super::app::AppState;

#[derive(Serialize, Deserialize)]
pub struct TransactionListError {
    error: String,
}

#[derive(Deserialize)]
pub struct PageQuery {
    limit: Option<u32>,
}

/// List records still moving through the pipeline, in date order.
pub async fn list_in_progress(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<TransactionRecord>>, (StatusCode, Json<TransactionListError>)> {
    let records = state
        .transactions
        .list_in_progress(page.limit.unwrap_or(100))
        .await
        .map_err(internal_error)?;

    Ok(Json(records))
}

/// List records classified below the confidence threshold, awaiting a
/// human decision.
pub async fn list_pending_validation(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<TransactionRecord>>, (StatusCode, Json<TransactionListError>)> {
    let records = state
        .transactions
        .list_pending_validation(page.limit.unwrap_or(100))
        .await
        .map_err(internal_error)?;

    Ok(Json(records))
}

fn internal_error<E>(err: E) -> (StatusCode, Json<TransactionListError>)
where
    E: std::error::Error,
{
    error!("internal error: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(TransactionListError {
            error: err.to_string(),
        }),
    )
}
