//! Association Store - Persistence and batched queries for generic associations
//!
//! This crate owns association rows and the query paths the listing layer
//! depends on:
//!
//! - `store` - create/delete/lookup of association rows with uniqueness
//! - `query` - explicit predicate builder, materialized exactly once
//! - `resolve` - batched payload resolution bounded by distinct type count
//! - `aggregate` - grouped aggregates over dependents with zero-fill
//! - `cascade` - owner deletion protocol and per-type hook lists
//!
//! Every storage query is recorded in a shared `QueryLog` so callers can
//! assert query budgets.

pub mod aggregate;
pub mod cascade;
pub mod query;
pub mod query_log;
pub mod resolve;
pub mod storage;
pub mod store;
pub mod types_table;

pub use aggregate::{Aggregate, AggregationEngine, AssociationDependents, DependentSource};
pub use cascade::{
    CascadeCoordinator, CascadeCoordinatorBuilder, CascadeHook, OwnerDeletion, PayloadCascade,
};
pub use query::AssociationQuery;
pub use query_log::{QueryKind, QueryLog};
pub use resolve::{OwnerTable, PayloadLoader, ResolutionManager, ResolutionManagerBuilder};
pub use storage::{db_err, Storage};
pub use store::{next_id, AssociationStore};
pub use types_table::{bootstrap_registry, freeze, open_builder};

#[cfg(test)]
pub(crate) mod testing;
