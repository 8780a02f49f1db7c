//! Keypoint Storage - Result Store Trait and In-Memory Implementation
//!
//! Defines the append-only storage abstraction for audit records. The
//! PostgreSQL implementation lives in keypoint-api next to its pool.

pub mod memory;
pub mod store;

pub use memory::InMemoryResultStore;
pub use store::{ResultStore, SharedResultStore};
