//! community-board/crates/domains/src/lib.rs
//!
//! Entity models, the error taxonomy and the document-store port shared by
//! every other crate in the workspace.

pub mod error;
pub mod models;
pub mod ports;

// Re-exporting for easier access in other crates
pub use error::*;
pub use models::*;
pub use ports::*;
