//! The FHIR R4 `Subscription` resource, as far as the bridge manages it.
//!
//! Only the criteria and channel are interpreted. Every other field the
//! source server returns is kept in `extra` so that an in-place update does
//! not strip server-managed data.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Channel type for REST push notifications.
pub const CHANNEL_REST_HOOK: &str = "rest-hook";

/// Payload content type for FHIR JSON.
pub const FHIR_JSON: &str = "application/fhir+json";

/// Status assigned to subscriptions created by the bridge.
pub const STATUS_REQUESTED: &str = "requested";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    #[serde(default = "subscription_resource_type")]
    pub resource_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default)]
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default)]
    pub criteria: String,

    pub channel: SubscriptionChannel,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionChannel {
    #[serde(rename = "type")]
    pub channel_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,

    /// Raw HTTP headers (`Name: value`) the source sends with each push.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header: Vec<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn subscription_resource_type() -> String {
    "Subscription".to_string()
}
