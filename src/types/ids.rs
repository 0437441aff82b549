//! Newtype wrappers for FHIR identifiers.
//!
//! These types prevent accidental mixing of resource type names and resource ids,
//! and guarantee that values taken from a webhook path are safe to splice into
//! a downstream URL.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum length of a FHIR resource id.
const MAX_ID_LEN: usize = 64;

/// Maximum length accepted for a resource type name.
const MAX_TYPE_LEN: usize = 64;

/// Error returned when an identifier does not follow FHIR syntax.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidIdentifier {
    #[error("invalid resource type: {0:?}")]
    ResourceType(String),

    #[error("invalid resource id: {0:?}")]
    ResourceId(String),
}

/// A FHIR resource type name such as `Patient` or `ServiceRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceType(String);

impl ResourceType {
    /// Creates a resource type without validation.
    ///
    /// Use [`ResourceType::parse`] for values that come from the network.
    pub fn new(s: impl Into<String>) -> Self {
        ResourceType(s.into())
    }

    /// Parses a resource type name.
    ///
    /// Accepts an ASCII uppercase letter followed by up to 63 ASCII letters.
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidIdentifier> {
        let s = s.into();
        let mut chars = s.chars();
        let valid = s.len() <= MAX_TYPE_LEN
            && chars.next().is_some_and(|c| c.is_ascii_uppercase())
            && chars.all(|c| c.is_ascii_alphabetic());
        if valid {
            Ok(ResourceType(s))
        } else {
            Err(InvalidIdentifier::ResourceType(s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ResourceType {
    fn from(s: &str) -> Self {
        ResourceType(s.to_string())
    }
}

/// The logical id of a FHIR resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(s: impl Into<String>) -> Self {
        ResourceId(s.into())
    }

    /// Parses a resource id using the FHIR `id` rule: 1-64 characters drawn
    /// from ASCII letters, digits, `-` and `.`.
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidIdentifier> {
        let s = s.into();
        let valid = !s.is_empty()
            && s.len() <= MAX_ID_LEN
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
        if valid {
            Ok(ResourceId(s))
        } else {
            Err(InvalidIdentifier::ResourceId(s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        ResourceId(s.to_string())
    }
}

/// Identifies one resource instance across both systems.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub resource_type: ResourceType,
    pub id: ResourceId,
}

impl ResourceKey {
    pub fn new(resource_type: ResourceType, id: ResourceId) -> Self {
        ResourceKey { resource_type, id }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.id)
    }
}
