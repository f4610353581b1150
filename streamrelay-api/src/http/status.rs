use axum::{extract::State, Json};
use streamrelay_core::RelayStatus;

use crate::http::{AppResult, AppState};

/// Current relay state: subscription, viewer count, buffered history
pub async fn get_status(State(state): State<AppState>) -> AppResult<Json<RelayStatus>> {
    let status = state.relay.status().await?;
    Ok(Json(status))
}
