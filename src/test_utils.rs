//! Shared test utilities: arbitrary generators and in-memory FHIR servers.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::json;

use crate::fhir::{DownstreamApi, FhirError, SourceApi, Subscription, SubscriptionApi};
use crate::types::{Resource, ResourceId, ResourceType, Version, format_timestamp};

/// Millisecond-precision instants between 2000 and 2100.
pub fn arb_version() -> impl Strategy<Value = Version> {
    (946_684_800_000i64..4_102_444_800_000i64)
        .prop_map(|ms| Utc.timestamp_millis_opt(ms).single().unwrap())
}

pub fn ts(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

/// A minimal resource payload with a `meta.lastUpdated` version.
pub fn resource(resource_type: &str, id: &str, last_updated: DateTime<Utc>) -> Resource {
    Resource::new(json!({
        "resourceType": resource_type,
        "id": id,
        "meta": { "lastUpdated": format_timestamp(&last_updated) }
    }))
}

/// A source server with canned search results per resource type.
#[derive(Debug, Default)]
pub struct MockSource {
    results: Mutex<HashMap<ResourceType, Vec<Resource>>>,
    failing: Mutex<HashSet<ResourceType>>,
    queries: Mutex<Vec<(ResourceType, DateTime<Utc>)>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_results(&self, resource_type: &str, resources: Vec<Resource>) {
        self.results
            .lock()
            .unwrap()
            .insert(ResourceType::new(resource_type), resources);
    }

    pub fn fail_queries_for(&self, resource_type: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert(ResourceType::new(resource_type));
    }

    /// Every `(type, since)` the source was queried with, in order.
    pub fn queries(&self) -> Vec<(ResourceType, DateTime<Utc>)> {
        self.queries.lock().unwrap().clone()
    }
}

impl SourceApi for MockSource {
    async fn modified_since(
        &self,
        resource_type: &ResourceType,
        since: DateTime<Utc>,
    ) -> Result<Vec<Resource>, FhirError> {
        self.queries
            .lock()
            .unwrap()
            .push((resource_type.clone(), since));
        if self.failing.lock().unwrap().contains(resource_type) {
            return Err(FhirError::status(503, "source unavailable"));
        }
        Ok(self
            .results
            .lock()
            .unwrap()
            .get(resource_type)
            .cloned()
            .unwrap_or_default())
    }
}

/// A source server's Subscription endpoint.
#[derive(Debug, Default)]
pub struct MockSubscriptions {
    existing: Mutex<Vec<Subscription>>,
    created: Mutex<Vec<Subscription>>,
    updated: Mutex<Vec<Subscription>>,
    searches: Mutex<Vec<(String, String, String)>>,
}

impl MockSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_existing(existing: Vec<Subscription>) -> Self {
        MockSubscriptions {
            existing: Mutex::new(existing),
            ..Self::default()
        }
    }

    pub fn created(&self) -> Vec<Subscription> {
        self.created.lock().unwrap().clone()
    }

    pub fn updated(&self) -> Vec<Subscription> {
        self.updated.lock().unwrap().clone()
    }

    pub fn searches(&self) -> Vec<(String, String, String)> {
        self.searches.lock().unwrap().clone()
    }
}

impl SubscriptionApi for MockSubscriptions {
    async fn find_subscriptions(
        &self,
        criteria: &str,
        channel_type: &str,
        payload: &str,
    ) -> Result<Vec<Subscription>, FhirError> {
        self.searches.lock().unwrap().push((
            criteria.to_string(),
            channel_type.to_string(),
            payload.to_string(),
        ));
        Ok(self.existing.lock().unwrap().clone())
    }

    async fn create_subscription(&self, subscription: &Subscription) -> Result<(), FhirError> {
        self.created.lock().unwrap().push(subscription.clone());
        Ok(())
    }

    async fn update_subscription(&self, subscription: &Subscription) -> Result<(), FhirError> {
        self.updated.lock().unwrap().push(subscription.clone());
        Ok(())
    }
}

/// A downstream server recording every write. Writes for ids registered
/// with [`MockDownstream::fail_id`] return HTTP 500.
#[derive(Debug)]
pub struct MockDownstream {
    upserts: Mutex<Vec<(ResourceType, ResourceId, Resource)>>,
    deletes: Mutex<Vec<(ResourceType, ResourceId)>>,
    failing_ids: Mutex<HashSet<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    upsert_status: u16,
}

impl Default for MockDownstream {
    fn default() -> Self {
        MockDownstream {
            upserts: Mutex::default(),
            deletes: Mutex::default(),
            failing_ids: Mutex::default(),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            upsert_status: 200,
        }
    }
}

impl MockDownstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_upsert_status(status: u16) -> Self {
        MockDownstream {
            upsert_status: status,
            ..Self::default()
        }
    }

    pub fn fail_id(&self, id: &str) {
        self.failing_ids.lock().unwrap().insert(id.to_string());
    }

    pub fn upserts(&self) -> Vec<(ResourceType, ResourceId, Resource)> {
        self.upserts.lock().unwrap().clone()
    }

    pub fn upserted_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .upserts
            .lock()
            .unwrap()
            .iter()
            .map(|(_, id, _)| id.to_string())
            .collect();
        ids.sort();
        ids
    }

    pub fn deletes(&self) -> Vec<(ResourceType, ResourceId)> {
        self.deletes.lock().unwrap().clone()
    }

    /// The highest number of concurrent upserts observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn fails(&self, id: &ResourceId) -> bool {
        self.failing_ids.lock().unwrap().contains(id.as_str())
    }
}

impl DownstreamApi for MockDownstream {
    async fn upsert(
        &self,
        resource_type: &ResourceType,
        id: &ResourceId,
        resource: &Resource,
    ) -> Result<u16, FhirError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::task::yield_now().await;

        self.upserts
            .lock()
            .unwrap()
            .push((resource_type.clone(), id.clone(), resource.clone()));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fails(id) {
            return Err(FhirError::status(500, format!("upsert {resource_type}/{id} failed")));
        }
        Ok(self.upsert_status)
    }

    async fn delete(&self, resource_type: &ResourceType, id: &ResourceId) -> Result<u16, FhirError> {
        self.deletes
            .lock()
            .unwrap()
            .push((resource_type.clone(), id.clone()));
        if self.fails(id) {
            return Err(FhirError::status(500, format!("delete {resource_type}/{id} failed")));
        }
        Ok(204)
    }
}
