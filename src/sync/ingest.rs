//! Push channel: changes delivered by the source's subscription.
//!
//! Each delivery waits briefly for a running poll cycle, is checked against
//! the dedup cache, forwarded downstream, and recorded in the cache. Downstream
//! failures are logged and swallowed so the source never sees the webhook
//! fail because of the downstream system; the poller picks the change up on
//! its next cycle.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::dedup::ChangeDedupCache;
use super::gate::PollGate;
use crate::fhir::DownstreamApi;
use crate::types::{Resource, ResourceId, ResourceType};

/// Status reported for an upsert that was acknowledged without a
/// successful downstream write.
pub const ACCEPTED_STATUS: u16 = 200;

pub struct WebhookIngestGate<D> {
    downstream: Arc<D>,
    dedup: Arc<ChangeDedupCache>,
    gate: Arc<PollGate>,
    gate_timeout: Duration,
}

impl<D: DownstreamApi> WebhookIngestGate<D> {
    pub fn new(
        downstream: Arc<D>,
        dedup: Arc<ChangeDedupCache>,
        gate: Arc<PollGate>,
        gate_timeout: Duration,
    ) -> Self {
        WebhookIngestGate {
            downstream,
            dedup,
            gate,
            gate_timeout,
        }
    }

    /// Forwards a created or updated resource. Returns the downstream status
    /// code, or [`ACCEPTED_STATUS`] if the write was skipped or failed.
    pub async fn on_upsert(
        &self,
        resource_type: &ResourceType,
        id: &ResourceId,
        resource: &Resource,
    ) -> u16 {
        self.gate.wait_idle(self.gate_timeout).await;

        let version = match resource.last_updated() {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(
                    resource_type = %resource_type,
                    id = %id,
                    error = %e,
                    "Pushed resource has no usable version, forwarding without dedup"
                );
                None
            }
        };

        if let Some(v) = version
            && self.dedup.skip(resource_type, id, Some(v))
        {
            debug!(resource_type = %resource_type, id = %id, "Change already forwarded, skipping");
            return ACCEPTED_STATUS;
        }

        let status = match self.downstream.upsert(resource_type, id, resource).await {
            Ok(status) => {
                debug!(resource_type = %resource_type, id = %id, status, "Forwarded pushed change");
                status
            }
            Err(e) => {
                warn!(
                    resource_type = %resource_type,
                    id = %id,
                    error = %e,
                    "Downstream upsert failed, leaving it to the poller"
                );
                ACCEPTED_STATUS
            }
        };

        if version.is_some() {
            self.dedup.save(resource_type, id, version);
        }
        status
    }

    /// Forwards a deletion.
    pub async fn on_delete(&self, resource_type: &ResourceType, id: &ResourceId) {
        self.gate.wait_idle(self.gate_timeout).await;

        if self.dedup.skip(resource_type, id, None) {
            debug!(resource_type = %resource_type, id = %id, "Deletion already forwarded, skipping");
            return;
        }

        match self.downstream.delete(resource_type, id).await {
            Ok(status) => {
                debug!(resource_type = %resource_type, id = %id, status, "Forwarded pushed deletion");
            }
            Err(e) => {
                warn!(
                    resource_type = %resource_type,
                    id = %id,
                    error = %e,
                    "Downstream delete failed"
                );
            }
        }

        self.dedup.save(resource_type, id, None);
    }
}
