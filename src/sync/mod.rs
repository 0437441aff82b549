//! Change synchronization from the source to the downstream system.
//!
//! Two channels carry changes: the push channel ([`ingest`]) driven by the
//! source's subscription, and the pull channel ([`poller`]) that periodically
//! asks for everything modified since the last checkpoint. They share a
//! [`ChangeDedupCache`] and a [`PollGate`].

pub mod dedup;
pub mod gate;
pub mod ingest;
pub mod poller;
pub mod subscription;

pub use dedup::{ChangeDedupCache, DedupMark};
pub use gate::{PollGate, RunningGuard};
pub use ingest::WebhookIngestGate;
pub use poller::{CycleReport, DeltaPoller, PollError, PollerConfig};
pub use subscription::{
    ReconcileOutcome, SubscriptionError, SubscriptionReconciler, subscription_criteria,
};
