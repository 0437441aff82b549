//! FHIR resource payloads.
//!
//! The bridge never interprets clinical content; it only needs the resource
//! type, the id and the `meta.lastUpdated` version marker. Everything else is
//! carried through untouched as JSON.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::{InvalidIdentifier, ResourceId, ResourceType};
use super::time::{Version, parse_timestamp};

/// Errors raised when reading bridge-relevant fields from a payload.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("resource has no {0} field")]
    MissingField(&'static str),

    #[error("invalid meta.lastUpdated {value:?}: {source}")]
    InvalidVersion {
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    #[error(transparent)]
    InvalidIdentifier(#[from] InvalidIdentifier),
}

/// A FHIR resource as raw JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource(serde_json::Value);

impl Resource {
    pub fn new(value: serde_json::Value) -> Self {
        Resource(value)
    }

    /// Returns the `resourceType` field.
    pub fn resource_type(&self) -> Result<ResourceType, ResourceError> {
        let name = self
            .0
            .get("resourceType")
            .and_then(|v| v.as_str())
            .ok_or(ResourceError::MissingField("resourceType"))?;
        Ok(ResourceType::parse(name)?)
    }

    /// Returns the logical `id` field.
    pub fn id(&self) -> Result<ResourceId, ResourceError> {
        let id = self
            .0
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or(ResourceError::MissingField("id"))?;
        Ok(ResourceId::parse(id)?)
    }

    /// Returns the version marker, `meta.lastUpdated`.
    pub fn last_updated(&self) -> Result<Version, ResourceError> {
        let raw = self
            .0
            .get("meta")
            .and_then(|m| m.get("lastUpdated"))
            .and_then(|v| v.as_str())
            .ok_or(ResourceError::MissingField("meta.lastUpdated"))?;
        parse_timestamp(raw).map_err(|source| ResourceError::InvalidVersion {
            value: raw.to_string(),
            source,
        })
    }

    pub fn as_json(&self) -> &serde_json::Value {
        &self.0
    }
}

impl From<serde_json::Value> for Resource {
    fn from(value: serde_json::Value) -> Self {
        Resource(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn reads_bridge_fields() {
        let resource = Resource::new(json!({
            "resourceType": "Patient",
            "id": "p-1",
            "meta": { "lastUpdated": "2024-03-05T10:00:00.250+01:00" },
            "name": [{ "family": "Doe" }]
        }));

        assert_eq!(resource.resource_type().unwrap().as_str(), "Patient");
        assert_eq!(resource.id().unwrap().as_str(), "p-1");
        assert_eq!(
            resource.last_updated().unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 5, 9, 0, 0).unwrap()
                + chrono::Duration::milliseconds(250)
        );
    }

    #[test]
    fn missing_meta_is_reported() {
        let resource = Resource::new(json!({ "resourceType": "Patient", "id": "p-1" }));
        assert!(matches!(
            resource.last_updated(),
            Err(ResourceError::MissingField("meta.lastUpdated"))
        ));
    }

    #[test]
    fn malformed_version_is_reported() {
        let resource = Resource::new(json!({ "meta": { "lastUpdated": "yesterday" } }));
        assert!(matches!(
            resource.last_updated(),
            Err(ResourceError::InvalidVersion { .. })
        ));
    }

    #[test]
    fn invalid_id_is_rejected() {
        let resource = Resource::new(json!({ "resourceType": "Patient", "id": "a/b" }));
        assert!(matches!(
            resource.id(),
            Err(ResourceError::InvalidIdentifier(_))
        ));
    }
}
