//! Durable per-resource-type poll checkpoints.
//!
//! A checkpoint is the instant at which the last successful poll cycle for a
//! resource type started. The poller resumes from it (minus the overlap
//! window) on the next cycle.
//!
//! # File Format
//!
//! A flat key-value file, one entry per resource type:
//!
//! ```text
//! # fhir-bridge poll checkpoints
//! Patient=2024-01-01T00:00:00.000+00:00
//! ServiceRequest=2024-01-01T00:00:05.120+00:00
//! ```
//!
//! Lines starting with `#` or `!` are comments. Keys and values may use
//! backslash escapes (`\:`), so files produced by a Java `Properties` store
//! load unchanged.
//!
//! # Durability
//!
//! Every advance rewrites the whole snapshot with [`write_atomic`] and only
//! then updates the in-memory copy. A failed write leaves both the file and
//! the cache at their previous values.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use super::atomic::write_atomic;
use crate::types::{ResourceType, format_timestamp, parse_timestamp, to_millis};

/// Checkpoints keyed by resource type.
pub type Checkpoints = BTreeMap<ResourceType, DateTime<Utc>>;

/// Errors that can occur while loading or advancing checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The checkpoint file exists but could not be read.
    #[error("failed to read checkpoints from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The checkpoint snapshot could not be written durably.
    #[error("failed to save checkpoint for {resource_type} to {path}: {source}")]
    Write {
        resource_type: ResourceType,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A line is neither a comment nor a `key=value` entry.
    #[error("malformed checkpoint entry on line {line}: {content:?}")]
    Malformed { line: usize, content: String },

    /// A stored value is not an ISO-8601 timestamp.
    #[error("invalid checkpoint for {resource_type}: {value:?}: {source}")]
    InvalidTimestamp {
        resource_type: ResourceType,
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

/// Result type for checkpoint operations.
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// File-backed checkpoint store.
///
/// The file is read lazily on first access, inside the same critical section
/// that serializes advances. A failed load is retried on the next access.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    cache: Mutex<Option<Checkpoints>>,
}

impl CheckpointStore {
    /// Creates a store backed by the file at `path`.
    ///
    /// The file does not need to exist; it is created on the first advance.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CheckpointStore {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the checkpoint for `resource_type`, or `None` if the type has
    /// never completed a poll cycle.
    pub fn get(&self, resource_type: &ResourceType) -> Result<Option<DateTime<Utc>>> {
        let mut guard = self.lock();
        let checkpoints = self.loaded(&mut guard)?;
        let checkpoint = checkpoints.get(resource_type).copied();
        if checkpoint.is_none() {
            debug!(resource_type = %resource_type, "No saved checkpoint");
        }
        Ok(checkpoint)
    }

    /// Returns a copy of every stored checkpoint.
    pub fn snapshot(&self) -> Result<Checkpoints> {
        let mut guard = self.lock();
        Ok(self.loaded(&mut guard)?.clone())
    }

    /// Moves the checkpoint for `resource_type` forward to `timestamp`.
    ///
    /// The timestamp is truncated to millisecond precision. Advancing to an
    /// instant at or before the stored checkpoint is a no-op and returns
    /// `Ok(false)`; checkpoints never move backward.
    ///
    /// # Errors
    ///
    /// Returns an error if the existing file cannot be loaded or the new
    /// snapshot cannot be written. In both cases the stored checkpoint is
    /// unchanged.
    pub fn advance(&self, resource_type: &ResourceType, timestamp: DateTime<Utc>) -> Result<bool> {
        let timestamp = to_millis(timestamp);
        let mut guard = self.lock();
        let checkpoints = self.loaded(&mut guard)?;

        if let Some(existing) = checkpoints.get(resource_type)
            && *existing >= timestamp
        {
            debug!(
                resource_type = %resource_type,
                existing = %format_timestamp(existing),
                requested = %format_timestamp(&timestamp),
                "Checkpoint already at or past requested instant"
            );
            return Ok(false);
        }

        let mut next = checkpoints.clone();
        next.insert(resource_type.clone(), timestamp);
        let rendered = render_checkpoints(&next);

        debug!(
            resource_type = %resource_type,
            checkpoint = %format_timestamp(&timestamp),
            "Saving checkpoint"
        );
        write_atomic(&self.path, rendered.as_bytes()).map_err(|source| {
            CheckpointError::Write {
                resource_type: resource_type.clone(),
                path: self.path.clone(),
                source,
            }
        })?;

        *checkpoints = next;
        Ok(true)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Checkpoints>> {
        // The cache is only replaced after a successful write, so a panic
        // while the lock was held cannot have left it half-updated.
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn loaded<'a>(&self, slot: &'a mut Option<Checkpoints>) -> Result<&'a mut Checkpoints> {
        if slot.is_none() {
            *slot = Some(self.load()?);
        }
        Ok(slot.get_or_insert_with(Checkpoints::new))
    }

    fn load(&self) -> Result<Checkpoints> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => {
                let checkpoints = parse_checkpoints(&text)?;
                info!(
                    path = %self.path.display(),
                    entries = checkpoints.len(),
                    "Loaded checkpoints"
                );
                Ok(checkpoints)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No checkpoint file yet, starting from scratch");
                Ok(Checkpoints::new())
            }
            Err(source) => Err(CheckpointError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

/// Parses the contents of a checkpoint file.
pub fn parse_checkpoints(text: &str) -> Result<Checkpoints> {
    let mut checkpoints = Checkpoints::new();

    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }

        let (key, value) = split_entry(line).ok_or_else(|| CheckpointError::Malformed {
            line: index + 1,
            content: raw.to_string(),
        })?;
        let resource_type = ResourceType::new(unescape(key.trim()));
        let value = unescape(value.trim());
        let timestamp =
            parse_timestamp(&value).map_err(|source| CheckpointError::InvalidTimestamp {
                resource_type: resource_type.clone(),
                value: value.clone(),
                source,
            })?;

        checkpoints.insert(resource_type, timestamp);
    }

    Ok(checkpoints)
}

/// Renders checkpoints in the file format described in the module docs.
pub fn render_checkpoints(checkpoints: &Checkpoints) -> String {
    let mut out = String::from("# fhir-bridge poll checkpoints\n");
    for (resource_type, timestamp) in checkpoints {
        out.push_str(resource_type.as_str());
        out.push('=');
        out.push_str(&format_timestamp(timestamp));
        out.push('\n');
    }
    out
}

/// Splits a line at the first unescaped `=` or `:`.
fn split_entry(line: &str) -> Option<(&str, &str)> {
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            '=' | ':' if !escaped => return Some((&line[..i], &line[i + 1..])),
            _ => escaped = false,
        }
    }
    None
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}
