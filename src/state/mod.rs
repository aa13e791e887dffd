//! Durable state: per-workflow records and append-only checkpoints.

pub mod checkpoint;
pub mod store;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use store::{StateStore, Transaction};
