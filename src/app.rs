//! Process wiring: builds every component, registers the subscription, then
//! runs the poller and the HTTP server until shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{BridgeConfig, ConfigError, EndpointConfig};
use crate::fhir::{FhirClient, FhirClientConfig, FhirError};
use crate::persistence::CheckpointStore;
use crate::server::{AppState, build_router};
use crate::sync::{
    ChangeDedupCache, DeltaPoller, PollGate, PollerConfig, SubscriptionError,
    SubscriptionReconciler, WebhookIngestGate,
};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build FHIR client: {0}")]
    Client(#[source] FhirError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("HTTP server failed: {0}")]
    Serve(#[source] io::Error),

    #[error("poller task failed: {0}")]
    Poller(#[from] JoinError),
}

/// Runs the bridge until `shutdown` is cancelled.
///
/// Fails before serving anything if the subscription cannot be reconciled.
pub async fn run(config: BridgeConfig, shutdown: CancellationToken) -> Result<(), AppError> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .map_err(|source| AppError::Bind {
            addr: config.listen_addr,
            source,
        })?;
    run_with_listener(config, listener, shutdown).await
}

/// Like [`run`], on an already bound listener.
pub async fn run_with_listener(
    config: BridgeConfig,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<(), AppError> {
    let client_config = |endpoint: &EndpointConfig| {
        FhirClientConfig::new(endpoint, config.http_timeout, config.connect_timeout)
    };
    let source = Arc::new(FhirClient::new(client_config(&config.source)).map_err(AppError::Client)?);
    let downstream =
        Arc::new(FhirClient::new(client_config(&config.downstream)).map_err(AppError::Client)?);

    let checkpoints = Arc::new(CheckpointStore::new(&config.checkpoint_file));
    let dedup = Arc::new(ChangeDedupCache::new());
    let gate = Arc::new(PollGate::new());

    let reconciler = SubscriptionReconciler::new(source.clone(), &config.resource_types);
    let outcome = reconciler
        .ensure_subscription(&config.webhook.base_url, config.webhook.credentials.as_ref())
        .await?;
    info!(
        ?outcome,
        criteria = reconciler.criteria(),
        endpoint = %config.webhook.base_url,
        "Subscription reconciled"
    );

    let poller = DeltaPoller::new(
        source,
        downstream.clone(),
        checkpoints.clone(),
        dedup.clone(),
        gate.clone(),
        PollerConfig {
            resource_types: config.resource_types.clone(),
            overlap: config.overlap,
            initial_delay: config.initial_delay,
            poll_delay: config.poll_delay,
            max_parallel_writes: config.max_parallel_writes,
        },
    );
    let poller_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { poller.run(shutdown).await }
    });

    let ingest = WebhookIngestGate::new(downstream, dedup, gate, config.gate_timeout);
    let state = AppState::new(ingest, checkpoints, config.webhook.credentials.as_ref());
    let router = build_router(state);

    match listener.local_addr() {
        Ok(addr) => info!(addr = %addr, "Listening"),
        Err(_) => info!("Listening"),
    }

    let served = axum::serve(listener, router)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        })
        .await;

    // The poller stops between cycles once shutdown is signalled, including
    // when the server exits on its own.
    shutdown.cancel();
    poller_task.await?;
    served.map_err(AppError::Serve)?;

    info!("Shutdown complete");
    Ok(())
}
