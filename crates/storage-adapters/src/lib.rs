//! # storage-adapters
//!
//! Implementations of the `domains::DocumentStore` port.

pub mod memory;

pub use memory::{InMemoryDocumentStore, DEFAULT_MAX_BATCH_WRITES};
