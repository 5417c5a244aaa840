//! Storefront - catalog admin backend
//!
//! This crate provides the admin side of a small catalog/ordering system:
//! - Catalog entity tables (collections, products, customers, orders, users)
//! - The tag vocabulary
//! - The listing facade over the generic association subsystem
//! - Configuration loading and demo data

// Configuration
pub mod config;

// Error type
pub mod error;

// Entity tables
pub mod catalog;

// Tag vocabulary
pub mod tags;

// Listing facade
pub mod listing;

// Demo data
pub mod seed;

pub use config::StorefrontConfig;
pub use error::{Result, StorefrontError};
pub use listing::{Listing, ListingBuilder, TagOutcome};
