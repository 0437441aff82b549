//! Short-lived deduplication of changes seen through either channel.
//!
//! The webhook channel and the poller can both observe the same change. The
//! cache remembers, per `(resource type, id)`, the newest version that was
//! already forwarded downstream, or that a deletion was forwarded
//! (a tombstone). The poller clears the cache at the end of every cycle, so
//! entries only live for one poll window.
//!
//! # Skip Rules
//!
//! | stored      | candidate | skip?       |
//! |-------------|-----------|-------------|
//! | none        | any       | no          |
//! | `T`         | `C`       | iff `C <= T`|
//! | tombstone   | delete    | yes         |
//! | tombstone   | `C`       | no          |
//! | `T`         | delete    | no          |

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::types::{ResourceId, ResourceKey, ResourceType, Version};

/// What the cache remembers about one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupMark {
    /// The resource was forwarded at this version.
    Seen(Version),
    /// A deletion of the resource was forwarded.
    Tombstone,
}

impl DedupMark {
    fn from_version(version: Option<Version>) -> Self {
        match version {
            Some(v) => DedupMark::Seen(v),
            None => DedupMark::Tombstone,
        }
    }
}

/// Concurrency-safe map of recently forwarded changes.
///
/// One instance is shared (via `Arc`) by the webhook ingest gate and the
/// poller.
#[derive(Debug, Default)]
pub struct ChangeDedupCache {
    entries: Mutex<HashMap<ResourceKey, DedupMark>>,
}

impl ChangeDedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that a change was forwarded.
    ///
    /// `None` records a tombstone (the resource was deleted).
    pub fn save(&self, resource_type: &ResourceType, id: &ResourceId, version: Option<Version>) {
        let mark = DedupMark::from_version(version);
        debug!(resource_type = %resource_type, id = %id, ?mark, "Recording processed change");
        self.lock().insert(
            ResourceKey::new(resource_type.clone(), id.clone()),
            mark,
        );
    }

    /// Returns `true` if a change with the given version was already handled.
    ///
    /// `None` as the candidate means the change is a deletion.
    pub fn skip(&self, resource_type: &ResourceType, id: &ResourceId, candidate: Option<Version>) -> bool {
        let key = ResourceKey::new(resource_type.clone(), id.clone());
        let entries = self.lock();
        match (entries.get(&key), candidate) {
            (None, _) => false,
            (Some(DedupMark::Seen(seen)), Some(candidate)) => candidate <= *seen,
            (Some(DedupMark::Tombstone), None) => true,
            (Some(DedupMark::Tombstone), Some(_)) | (Some(DedupMark::Seen(_)), None) => false,
        }
    }

    /// Returns the stored mark for a resource, if any.
    pub fn get(&self, resource_type: &ResourceType, id: &ResourceId) -> Option<DedupMark> {
        let key = ResourceKey::new(resource_type.clone(), id.clone());
        self.lock().get(&key).copied()
    }

    /// Removes every entry.
    pub fn clear(&self) {
        let mut entries = self.lock();
        let removed = entries.len();
        entries.clear();
        debug!(removed, "Cleared dedup cache");
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ResourceKey, DedupMark>> {
        // Every critical section is a single map operation; a poisoned map is
        // still consistent.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
