//! Webhook endpoints called by the source's `rest-hook` subscription.
//!
//! The source appends `/{resourceType}/{id}` to the registered endpoint and
//! sends `PUT` with the resource body for creates and updates, `DELETE` for
//! deletions. Requests are validated here and handed to the
//! [`WebhookIngestGate`](crate::sync::WebhookIngestGate); downstream
//! failures never surface as webhook errors.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, warn};

use super::AppState;
use super::auth::authorization_matches;
use crate::fhir::DownstreamApi;
use crate::types::{InvalidIdentifier, Resource, ResourceId, ResourceType};

/// Errors that reject a webhook call before it reaches the ingest gate.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing or invalid authorization")]
    Unauthorized,

    #[error("{0}")]
    InvalidIdentifier(#[from] InvalidIdentifier),

    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("body {field} {found:?} does not match URL {expected:?}")]
    Mismatch {
        field: &'static str,
        expected: String,
        found: String,
    },
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::Unauthorized => StatusCode::UNAUTHORIZED,
            WebhookError::InvalidIdentifier(_)
            | WebhookError::InvalidJson(_)
            | WebhookError::Mismatch { .. } => StatusCode::BAD_REQUEST,
        };
        (status, self.to_string()).into_response()
    }
}

/// `PUT /fhir/{resourceType}/{id}`: a resource was created or updated.
///
/// Responds with the downstream status code, or 200 when the change was
/// skipped or the downstream write failed.
pub async fn upsert_handler<D: DownstreamApi + 'static>(
    State(app_state): State<AppState<D>>,
    Path((resource_type, id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, WebhookError> {
    authorize(&app_state, &headers)?;
    let (resource_type, id) = parse_target(resource_type, id)?;

    let resource = Resource::new(serde_json::from_slice(&body)?);
    check_body_matches(&resource, &resource_type, &id)?;

    debug!(resource_type = %resource_type, id = %id, "Received pushed change");
    let status = app_state
        .ingest()
        .on_upsert(&resource_type, &id, &resource)
        .await;

    Ok(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
}

/// `DELETE /fhir/{resourceType}/{id}`: a resource was deleted. Always 204
/// once authorized.
pub async fn delete_handler<D: DownstreamApi + 'static>(
    State(app_state): State<AppState<D>>,
    Path((resource_type, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, WebhookError> {
    authorize(&app_state, &headers)?;
    let (resource_type, id) = parse_target(resource_type, id)?;

    debug!(resource_type = %resource_type, id = %id, "Received pushed deletion");
    app_state.ingest().on_delete(&resource_type, &id).await;

    Ok(StatusCode::NO_CONTENT)
}

fn authorize<D>(app_state: &AppState<D>, headers: &HeaderMap) -> Result<(), WebhookError> {
    let Some(expected) = app_state.expected_authorization() else {
        return Ok(());
    };
    let provided = headers
        .get(AUTHORIZATION)
        .map(|v| v.as_bytes())
        .unwrap_or_default();
    if authorization_matches(provided, expected) {
        Ok(())
    } else {
        warn!("Rejected webhook call with invalid authorization");
        Err(WebhookError::Unauthorized)
    }
}

fn parse_target(resource_type: String, id: String) -> Result<(ResourceType, ResourceId), WebhookError> {
    Ok((ResourceType::parse(resource_type)?, ResourceId::parse(id)?))
}

/// Rejects bodies that name a different resource than the URL. Absent
/// fields are allowed.
fn check_body_matches(
    resource: &Resource,
    resource_type: &ResourceType,
    id: &ResourceId,
) -> Result<(), WebhookError> {
    let json = resource.as_json();
    let fields = [
        ("resourceType", resource_type.as_str()),
        ("id", id.as_str()),
    ];
    for (field, expected) in fields {
        if let Some(found) = json.get(field).and_then(|v| v.as_str())
            && found != expected
        {
            return Err(WebhookError::Mismatch {
                field,
                expected: expected.to_string(),
                found: found.to_string(),
            });
        }
    }
    Ok(())
}
