//! Query instrumentation
//!
//! Every underlying storage query issued by the association subsystem is
//! recorded here by kind. Listing code and tests use the counts to verify
//! that batch operations stay bounded by distinct type, not batch size.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Kinds of storage queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueryKind {
    /// Read of the persisted type descriptors
    TypeLoad,
    /// Append of new type descriptors
    TypeInsert,
    /// Insert of one association row
    AssociationInsert,
    /// Delete of one association row by id
    AssociationDelete,
    /// Point read of one association row by id
    AssociationGet,
    /// Lookup of all associations for a single owner
    AssociationLookup,
    /// Range scan over one owner type for a page of owners
    AssociationScan,
    /// Resolution of payload ids; one shared read may also probe owners
    PayloadLookup,
    /// Existence probe against an owner table
    OwnerProbe,
    /// Grouped scan feeding an aggregate
    AggregateScan,
    /// Read of rows from an entity table
    EntityRead,
    /// Removal of all associations of one owner
    CascadeDelete,
    /// Any other write issued through the shared storage
    Write,
}

impl QueryKind {
    /// Queries that only read
    pub fn is_read(self) -> bool {
        matches!(
            self,
            QueryKind::TypeLoad
                | QueryKind::AssociationGet
                | QueryKind::AssociationLookup
                | QueryKind::AssociationScan
                | QueryKind::PayloadLookup
                | QueryKind::OwnerProbe
                | QueryKind::AggregateScan
                | QueryKind::EntityRead
        )
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryKind::TypeLoad => "type_load",
            QueryKind::TypeInsert => "type_insert",
            QueryKind::AssociationInsert => "association_insert",
            QueryKind::AssociationDelete => "association_delete",
            QueryKind::AssociationGet => "association_get",
            QueryKind::AssociationLookup => "association_lookup",
            QueryKind::AssociationScan => "association_scan",
            QueryKind::PayloadLookup => "payload_lookup",
            QueryKind::OwnerProbe => "owner_probe",
            QueryKind::AggregateScan => "aggregate_scan",
            QueryKind::EntityRead => "entity_read",
            QueryKind::CascadeDelete => "cascade_delete",
            QueryKind::Write => "write",
        };
        f.write_str(name)
    }
}

/// Thread-safe query counters
#[derive(Debug, Default)]
pub struct QueryLog {
    counts: DashMap<QueryKind, u64>,
    /// Index entries visited by owner-restricted scans
    rows_visited: AtomicU64,
}

impl QueryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one query of the given kind
    pub fn record(&self, kind: QueryKind) {
        *self.counts.entry(kind).or_insert(0) += 1;
        tracing::trace!("query: {}", kind);
    }

    /// Number of queries recorded for a kind
    pub fn count(&self, kind: QueryKind) -> u64 {
        self.counts.get(&kind).map(|c| *c).unwrap_or(0)
    }

    /// Record index entries visited by a scan
    pub fn record_rows(&self, rows: u64) {
        self.rows_visited.fetch_add(rows, Ordering::Relaxed);
    }

    /// Index entries visited since the last reset
    pub fn rows_visited(&self) -> u64 {
        self.rows_visited.load(Ordering::Relaxed)
    }

    /// Number of read queries recorded
    pub fn reads(&self) -> u64 {
        self.counts
            .iter()
            .filter(|entry| entry.key().is_read())
            .map(|entry| *entry.value())
            .sum()
    }

    /// Number of queries recorded across all kinds
    pub fn total(&self) -> u64 {
        self.counts.iter().map(|entry| *entry.value()).sum()
    }

    /// Clear all counters
    pub fn reset(&self) {
        self.counts.clear();
        self.rows_visited.store(0, Ordering::Relaxed);
    }

    /// Ordered copy of the counters
    pub fn snapshot(&self) -> BTreeMap<QueryKind, u64> {
        self.counts
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }
}
