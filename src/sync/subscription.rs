//! Registration of the bridge's push subscription on the source system.
//!
//! Run once at startup. The bridge owns exactly one `rest-hook` subscription
//! whose criteria cover every tracked resource type. Reconciliation creates
//! it if missing and repairs its endpoint or authorization header if they
//! drifted. Two or more matching subscriptions mean someone else registered
//! one too; that is ambiguous and aborts startup.

use std::sync::Arc;

use serde_json::Map;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::BasicCredentials;
use crate::fhir::{
    CHANNEL_REST_HOOK, FHIR_JSON, FhirError, STATUS_REQUESTED, Subscription, SubscriptionApi,
    SubscriptionChannel,
};
use crate::types::ResourceType;

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("found {count} subscriptions with criteria {criteria} on the source")]
    AmbiguousSubscription { criteria: String, count: usize },

    #[error("subscription lookup failed: {0}")]
    Fhir(#[from] FhirError),
}

/// What reconciliation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Created,
    Updated,
    Unchanged,
}

pub struct SubscriptionReconciler<S> {
    api: Arc<S>,
    criteria: String,
}

impl<S: SubscriptionApi> SubscriptionReconciler<S> {
    pub fn new(api: Arc<S>, resource_types: &[ResourceType]) -> Self {
        SubscriptionReconciler {
            api,
            criteria: subscription_criteria(resource_types),
        }
    }

    pub fn criteria(&self) -> &str {
        &self.criteria
    }

    /// Makes sure exactly one subscription pushes tracked changes to
    /// `endpoint`, carrying `credentials` as its `Authorization` header.
    pub async fn ensure_subscription(
        &self,
        endpoint: &str,
        credentials: Option<&BasicCredentials>,
    ) -> Result<ReconcileOutcome, SubscriptionError> {
        debug!(criteria = %self.criteria, "Looking up subscription on source");

        let mut matches: Vec<Subscription> = self
            .api
            .find_subscriptions(&self.criteria, CHANNEL_REST_HOOK, FHIR_JSON)
            .await?
            .into_iter()
            .filter(|s| self.is_managed(s))
            .collect();

        let header = credentials.map(|c| format!("Authorization: {}", c.authorization_header()));

        match matches.len() {
            0 => {
                let subscription = self.new_subscription(endpoint, header);
                self.api.create_subscription(&subscription).await?;
                info!(criteria = %self.criteria, endpoint, "Created subscription");
                Ok(ReconcileOutcome::Created)
            }
            1 => {
                let mut existing = matches.remove(0);
                if !apply_channel(&mut existing.channel, endpoint, header) {
                    debug!(id = ?existing.id, "Subscription is up to date");
                    return Ok(ReconcileOutcome::Unchanged);
                }
                self.api.update_subscription(&existing).await?;
                info!(id = ?existing.id, endpoint, "Updated subscription");
                Ok(ReconcileOutcome::Updated)
            }
            count => Err(SubscriptionError::AmbiguousSubscription {
                criteria: self.criteria.clone(),
                count,
            }),
        }
    }

    /// Servers may match search parameters loosely; only exact matches count.
    fn is_managed(&self, subscription: &Subscription) -> bool {
        subscription.criteria == self.criteria
            && subscription.channel.channel_type == CHANNEL_REST_HOOK
            && subscription.channel.payload.as_deref() == Some(FHIR_JSON)
    }

    fn new_subscription(&self, endpoint: &str, header: Option<String>) -> Subscription {
        Subscription {
            resource_type: "Subscription".to_string(),
            id: None,
            status: STATUS_REQUESTED.to_string(),
            reason: Some("fhir-bridge change notifications".to_string()),
            criteria: self.criteria.clone(),
            channel: SubscriptionChannel {
                channel_type: CHANNEL_REST_HOOK.to_string(),
                endpoint: Some(endpoint.to_string()),
                payload: Some(FHIR_JSON.to_string()),
                header: header.into_iter().collect(),
                extra: Map::new(),
            },
            extra: Map::new(),
        }
    }
}

/// Builds the criteria string, e.g. `[Patient,ServiceRequest]`.
///
/// Types are sorted and deduplicated so the string does not depend on the
/// configured order.
pub fn subscription_criteria(resource_types: &[ResourceType]) -> String {
    let mut names: Vec<&str> = resource_types.iter().map(|t| t.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    format!("[{}]", names.join(","))
}

/// Points `channel` at `endpoint` with `header` as its only `Authorization`
/// header. Other headers are kept. Returns whether anything changed.
fn apply_channel(channel: &mut SubscriptionChannel, endpoint: &str, header: Option<String>) -> bool {
    let mut headers: Vec<String> = channel
        .header
        .iter()
        .filter(|h| !is_authorization_header(h))
        .cloned()
        .collect();
    headers.extend(header);

    let changed = channel.endpoint.as_deref() != Some(endpoint) || headers != channel.header;
    if changed {
        channel.endpoint = Some(endpoint.to_string());
        channel.header = headers;
    }
    changed
}

fn is_authorization_header(header: &str) -> bool {
    header
        .split_once(':')
        .is_some_and(|(name, _)| name.trim().eq_ignore_ascii_case("authorization"))
}
