//! HTTP server for the bridge.
//!
//! # Endpoints
//!
//! - `PUT /fhir/{resourceType}/{id}` - Pushed create/update from the source
//! - `DELETE /fhir/{resourceType}/{id}` - Pushed deletion from the source
//! - `GET /api/v1/checkpoints` - Stored poll checkpoints as JSON
//! - `GET /health` - Returns 200 if server is running

use std::sync::Arc;

pub mod auth;
pub mod checkpoints;
pub mod health;
pub mod webhook;

pub use checkpoints::checkpoints_handler;
pub use health::health_handler;
pub use webhook::{WebhookError, delete_handler, upsert_handler};

use crate::config::BasicCredentials;
use crate::fhir::DownstreamApi;
use crate::persistence::CheckpointStore;
use crate::sync::WebhookIngestGate;

/// Shared application state, passed to handlers via Axum's `State` extractor.
pub struct AppState<D> {
    inner: Arc<AppStateInner<D>>,
}

impl<D> Clone for AppState<D> {
    fn clone(&self) -> Self {
        AppState {
            inner: self.inner.clone(),
        }
    }
}

struct AppStateInner<D> {
    ingest: WebhookIngestGate<D>,
    checkpoints: Arc<CheckpointStore>,

    /// `Authorization` value inbound webhook calls must carry, if any.
    expected_authorization: Option<String>,
}

impl<D> AppState<D> {
    pub fn new(
        ingest: WebhookIngestGate<D>,
        checkpoints: Arc<CheckpointStore>,
        webhook_credentials: Option<&BasicCredentials>,
    ) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                ingest,
                checkpoints,
                expected_authorization: webhook_credentials.map(|c| c.authorization_header()),
            }),
        }
    }

    pub fn ingest(&self) -> &WebhookIngestGate<D> {
        &self.inner.ingest
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.inner.checkpoints
    }

    pub fn expected_authorization(&self) -> Option<&str> {
        self.inner.expected_authorization.as_deref()
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router<D: DownstreamApi + 'static>(app_state: AppState<D>) -> axum::Router {
    use axum::routing::{get, put};

    axum::Router::new()
        .route(
            "/fhir/{resource_type}/{id}",
            put(upsert_handler::<D>).delete(delete_handler::<D>),
        )
        .route("/api/v1/checkpoints", get(checkpoints_handler::<D>))
        .route("/health", get(health_handler))
        .with_state(app_state)
}
