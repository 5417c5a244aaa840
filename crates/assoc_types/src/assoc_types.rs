//! Association Types - Core data model for generic associations
//!
//! This crate contains the pure data structures shared by the association
//! store and the listing layer:
//!
//! - Type-erased addressing (`GenericReference`) and payload references
//! - The append-only type registry
//! - The error taxonomy used across the workspace

mod error;
mod type_registry;
mod types;

pub use error::*;
pub use type_registry::*;
pub use types::*;
