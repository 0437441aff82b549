//! Collaborator traits for the two FHIR servers.
//!
//! The synchronization engine only talks to these traits. [`FhirClient`]
//! implements all of them over HTTP; tests use in-memory mocks.
//!
//! [`FhirClient`]: super::FhirClient

use std::future::Future;

use chrono::{DateTime, Utc};

use super::error::FhirError;
use super::subscription::Subscription;
use crate::types::{Resource, ResourceId, ResourceType};

/// The source of truth: answers delta queries.
pub trait SourceApi: Send + Sync {
    /// Returns every resource of `resource_type` whose server-side
    /// last-modified instant is at or after `since`.
    fn modified_since(
        &self,
        resource_type: &ResourceType,
        since: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Resource>, FhirError>> + Send;
}

/// Subscription management on the source system.
pub trait SubscriptionApi: Send + Sync {
    /// Searches for subscriptions with exactly these criteria, channel type
    /// and payload type.
    fn find_subscriptions(
        &self,
        criteria: &str,
        channel_type: &str,
        payload: &str,
    ) -> impl Future<Output = Result<Vec<Subscription>, FhirError>> + Send;

    fn create_subscription(
        &self,
        subscription: &Subscription,
    ) -> impl Future<Output = Result<(), FhirError>> + Send;

    /// Updates an existing subscription in place; `subscription.id` must be set.
    fn update_subscription(
        &self,
        subscription: &Subscription,
    ) -> impl Future<Output = Result<(), FhirError>> + Send;
}

/// The downstream system: receives writes.
pub trait DownstreamApi: Send + Sync {
    /// Creates or replaces a resource. Returns the HTTP status code.
    fn upsert(
        &self,
        resource_type: &ResourceType,
        id: &ResourceId,
        resource: &Resource,
    ) -> impl Future<Output = Result<u16, FhirError>> + Send;

    /// Deletes a resource. Returns the HTTP status code.
    fn delete(
        &self,
        resource_type: &ResourceType,
        id: &ResourceId,
    ) -> impl Future<Output = Result<u16, FhirError>> + Send;
}
