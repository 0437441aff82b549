//! Persistence layer for the bridge.
//!
//! The only durable state is the per-resource-type poll checkpoint, stored
//! as a flat key-value file that is rewritten atomically on every advance.
//!
//! # File Layout
//!
//! ```text
//! <checkpoint file>       # Type=timestamp, one line per tracked type
//! <checkpoint file>.tmp   # transient, exists only during a rewrite
//! ```

pub mod atomic;
pub mod checkpoint;

pub use atomic::write_atomic;
pub use checkpoint::{CheckpointError, CheckpointStore, Checkpoints};
