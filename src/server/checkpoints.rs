//! Checkpoint inspection endpoint.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use super::AppState;
use crate::fhir::DownstreamApi;
use crate::persistence::CheckpointError;
use crate::types::format_timestamp;

pub struct InspectError(CheckpointError);

impl IntoResponse for InspectError {
    fn into_response(self) -> Response {
        warn!(error = %self.0, "Failed to read checkpoints");
        (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()).into_response()
    }
}

/// Returns the stored checkpoint per resource type.
///
/// ```ignore
/// GET /api/v1/checkpoints HTTP/1.1
///
/// HTTP/1.1 200 OK
/// Content-Type: application/json
///
/// {"Patient":"2024-01-01T00:00:00.000+00:00"}
/// ```
pub async fn checkpoints_handler<D: DownstreamApi + 'static>(
    State(app_state): State<AppState<D>>,
) -> Result<Json<BTreeMap<String, String>>, InspectError> {
    let snapshot = app_state.checkpoints().snapshot().map_err(InspectError)?;
    Ok(Json(
        snapshot
            .iter()
            .map(|(t, ts)| (t.to_string(), format_timestamp(ts)))
            .collect(),
    ))
}
