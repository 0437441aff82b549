//! Pull channel: periodic delta queries against the source.
//!
//! Each scheduled invocation walks the tracked resource types in order. For
//! one type a cycle is:
//!
//! 1. note the cycle start
//! 2. query everything modified since `checkpoint - overlap` (or the epoch)
//! 3. drop results the dedup cache says were already forwarded
//! 4. write the rest downstream on a bounded pool and join them all
//! 5. advance the checkpoint, then clear the dedup cache
//!
//! # Partial Failure
//!
//! A failed write must not be lost behind the checkpoint. With failures the
//! checkpoint moves to `min(cycle_start, earliest failed version)`, never
//! backwards, so the next cycle's window still covers the failed resource.
//! A failure whose version is unknown holds the checkpoint where it was.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dedup::ChangeDedupCache;
use super::gate::PollGate;
use crate::fhir::{DownstreamApi, FhirError, SourceApi};
use crate::persistence::{CheckpointError, CheckpointStore};
use crate::types::{ResourceId, ResourceType, Version, epoch};

#[derive(Debug, Error)]
pub enum PollError {
    #[error("querying {resource_type} changes failed: {source}")]
    Query {
        resource_type: ResourceType,
        #[source]
        source: FhirError,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("downstream worker pool closed")]
    PoolClosed,
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub resource_types: Vec<ResourceType>,

    /// Subtracted from the stored checkpoint to absorb clock skew and
    /// commit lag on the source.
    pub overlap: Duration,

    pub initial_delay: Duration,

    /// Pause between the end of one invocation and the start of the next.
    pub poll_delay: Duration,

    pub max_parallel_writes: usize,
}

/// What one cycle for one resource type did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub resource_type: ResourceType,
    pub since: DateTime<Utc>,
    pub cycle_start: DateTime<Utc>,
    pub fetched: usize,
    pub skipped: usize,
    pub written: usize,
    pub failed: usize,

    /// Results that could not be written at all: entries of another
    /// resource type (search outcomes, included resources) or without a
    /// usable id.
    pub invalid: usize,

    /// The checkpoint after the cycle, if one is stored.
    pub checkpoint: Option<DateTime<Utc>>,
}

/// Failed downstream writes of one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteFailures {
    pub count: usize,
    pub earliest_version: Option<Version>,
    /// Failures without a known version (no `meta.lastUpdated`, or the write
    /// task panicked).
    pub unversioned: usize,
}

impl WriteFailures {
    fn record(&mut self, version: Option<Version>) {
        self.count += 1;
        match version {
            Some(v) => {
                self.earliest_version = Some(match self.earliest_version {
                    Some(e) => e.min(v),
                    None => v,
                });
            }
            None => self.unversioned += 1,
        }
    }
}

/// Computes the checkpoint to store after a cycle. `None` means leave
/// nothing stored.
pub fn next_checkpoint(
    previous: Option<DateTime<Utc>>,
    cycle_start: DateTime<Utc>,
    failures: &WriteFailures,
) -> Option<DateTime<Utc>> {
    if failures.unversioned > 0 {
        return previous;
    }
    let candidate = match failures.earliest_version {
        Some(v) => cycle_start.min(v),
        None => cycle_start,
    };

    Some(match previous {
        Some(p) => p.max(candidate),
        None => candidate,
    })
}

/// `checkpoint - overlap`, clamped to the epoch.
fn window_start(checkpoint: DateTime<Utc>, overlap: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(overlap)
        .ok()
        .and_then(|d| checkpoint.checked_sub_signed(d))
        .map_or_else(epoch, |since| since.max(epoch()))
}

struct WriteOutcome {
    id: ResourceId,
    version: Option<Version>,
    result: Result<u16, FhirError>,
}

pub struct DeltaPoller<S, D> {
    source: Arc<S>,
    downstream: Arc<D>,
    checkpoints: Arc<CheckpointStore>,
    dedup: Arc<ChangeDedupCache>,
    gate: Arc<PollGate>,
    config: PollerConfig,
}

impl<S, D> DeltaPoller<S, D>
where
    S: SourceApi,
    D: DownstreamApi + 'static,
{
    pub fn new(
        source: Arc<S>,
        downstream: Arc<D>,
        checkpoints: Arc<CheckpointStore>,
        dedup: Arc<ChangeDedupCache>,
        gate: Arc<PollGate>,
        config: PollerConfig,
    ) -> Self {
        DeltaPoller {
            source,
            downstream,
            checkpoints,
            dedup,
            gate,
            config,
        }
    }

    /// Runs scheduled invocations until `shutdown` is cancelled.
    ///
    /// Shutdown is only observed between invocations; a started invocation
    /// always runs to completion.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            initial_delay_secs = self.config.initial_delay.as_secs(),
            poll_delay_secs = self.config.poll_delay.as_secs(),
            "Poller started"
        );

        let mut delay = self.config.initial_delay;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping poller");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            self.run_once().await;
            delay = self.config.poll_delay;
        }
    }

    /// One scheduled invocation: a cycle per tracked type, in order.
    ///
    /// The poll gate is held for the whole invocation. A failing type is
    /// logged and does not stop the others.
    pub async fn run_once(&self) -> Vec<Result<CycleReport, PollError>> {
        let _running = self.gate.enter();

        let mut results = Vec::with_capacity(self.config.resource_types.len());
        for resource_type in &self.config.resource_types {
            let result = self.run_cycle(resource_type).await;
            match &result {
                Ok(report) if report.failed > 0 => {
                    warn!(
                        resource_type = %resource_type,
                        failed = report.failed,
                        written = report.written,
                        checkpoint = ?report.checkpoint,
                        "Poll cycle finished with failed writes, checkpoint held back"
                    );
                }
                Ok(report) => {
                    info!(
                        resource_type = %resource_type,
                        fetched = report.fetched,
                        skipped = report.skipped,
                        written = report.written,
                        "Poll cycle finished"
                    );
                }
                Err(e) => {
                    error!(resource_type = %resource_type, error = %e, "Poll cycle failed");
                }
            }
            results.push(result);
        }
        results
    }

    /// Runs one cycle for `resource_type`.
    pub async fn run_cycle(&self, resource_type: &ResourceType) -> Result<CycleReport, PollError> {
        let cycle_start = Utc::now();
        let previous = self.checkpoints.get(resource_type)?;
        let since = match previous {
            Some(checkpoint) => window_start(checkpoint, self.config.overlap),
            None => epoch(),
        };

        debug!(resource_type = %resource_type, since = %since, "Querying source for changes");
        let resources = self
            .source
            .modified_since(resource_type, since)
            .await
            .map_err(|source| PollError::Query {
                resource_type: resource_type.clone(),
                source,
            })?;

        let mut report = CycleReport {
            resource_type: resource_type.clone(),
            since,
            cycle_start,
            fetched: resources.len(),
            skipped: 0,
            written: 0,
            failed: 0,
            invalid: 0,
            checkpoint: previous,
        };

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_writes.max(1)));
        let mut writes = JoinSet::new();

        for resource in resources {
            match resource.resource_type() {
                Ok(found) if &found == resource_type => {}
                Ok(found) => {
                    warn!(
                        resource_type = %resource_type,
                        found = %found,
                        "Skipping search entry of another resource type"
                    );
                    report.invalid += 1;
                    continue;
                }
                Err(e) => {
                    warn!(resource_type = %resource_type, error = %e, "Skipping search entry without usable type");
                    report.invalid += 1;
                    continue;
                }
            }

            let id = match resource.id() {
                Ok(id) => id,
                Err(e) => {
                    warn!(resource_type = %resource_type, error = %e, "Skipping result without usable id");
                    report.invalid += 1;
                    continue;
                }
            };
            let version = resource.last_updated().ok();

            if let Some(v) = version
                && self.dedup.skip(resource_type, &id, Some(v))
            {
                debug!(resource_type = %resource_type, id = %id, "Change already forwarded, skipping");
                report.skipped += 1;
                continue;
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| PollError::PoolClosed)?;
            let downstream = self.downstream.clone();
            let resource_type = resource_type.clone();
            writes.spawn(async move {
                let _permit = permit;
                let result = downstream.upsert(&resource_type, &id, &resource).await;
                WriteOutcome {
                    id,
                    version,
                    result,
                }
            });
        }

        let mut failures = WriteFailures::default();
        while let Some(joined) = writes.join_next().await {
            match joined {
                Ok(WriteOutcome { result: Ok(_), .. }) => report.written += 1,
                Ok(WriteOutcome {
                    id,
                    version,
                    result: Err(e),
                }) => {
                    warn!(
                        resource_type = %resource_type,
                        id = %id,
                        version = ?version,
                        error = %e,
                        "Downstream write failed"
                    );
                    failures.record(version);
                }
                Err(e) => {
                    error!(resource_type = %resource_type, error = %e, "Downstream write task failed");
                    failures.record(None);
                }
            }
        }
        report.failed = failures.count;

        if let Some(checkpoint) = next_checkpoint(previous, cycle_start, &failures) {
            self.checkpoints.advance(resource_type, checkpoint)?;
            report.checkpoint = self.checkpoints.get(resource_type)?;
        }

        self.dedup.clear();
        Ok(report)
    }
}
