//! Core domain types for the bridge.
//!
//! Identifiers, version timestamps and the JSON resource wrapper shared by
//! both synchronization channels.

pub mod ids;
pub mod resource;
pub mod time;

pub use ids::{InvalidIdentifier, ResourceId, ResourceKey, ResourceType};
pub use resource::{Resource, ResourceError};
pub use time::{Version, epoch, format_timestamp, parse_timestamp, to_millis};
