//! FHIR REST access: collaborator traits, the HTTP client, and the
//! `Subscription` model.

pub mod api;
pub mod bundle;
pub mod client;
pub mod error;
pub mod retry;
pub mod subscription;

pub use api::{DownstreamApi, SourceApi, SubscriptionApi};
pub use client::{FhirClient, FhirClientConfig};
pub use error::{FhirError, FhirErrorKind};
pub use retry::{RetryConfig, retry_with_backoff};
pub use subscription::{
    CHANNEL_REST_HOOK, FHIR_JSON, STATUS_REQUESTED, Subscription, SubscriptionChannel,
};
