//! Association query builder
//!
//! Predicates are accumulated on an `AssociationQuery` and executed by
//! `fetch`, which consumes the builder: a query runs exactly once and returns
//! a fully materialized list. One `fetch` is one storage query over the owner
//! index of one owner type; an owner page is read as one short range per
//! owner inside that query, so owners outside the page are never visited.
//!
//! # Example
//!
//! ```rust,ignore
//! let liked = AssociationQuery::for_type(product_type)
//!     .owners([10, 11, 12])
//!     .payload_kind(PayloadKind::Actor)
//!     .fetch(&store)?;
//! ```

use std::collections::BTreeSet;

use assoc_types::{
    Association, GenericReference, ObjectId, PayloadKind, PayloadRef, Result, TypeId,
};
use chrono::DateTime;

use crate::query_log::QueryKind;
use crate::storage::db_err;
use crate::store::{AssociationStore, BY_OWNER_TABLE};

/// Accumulated predicates over associations of one owner type
#[derive(Debug)]
#[must_use = "a query does nothing until fetched"]
pub struct AssociationQuery {
    type_id: TypeId,
    /// Restrict to these owners; `None` scans every owner of the type
    owners: Option<BTreeSet<ObjectId>>,
    kind: Option<PayloadKind>,
    payload: Option<PayloadRef>,
    recorded_as: QueryKind,
}

impl AssociationQuery {
    /// Start a query over owners of one type
    pub fn for_type(type_id: TypeId) -> Self {
        Self {
            type_id,
            owners: None,
            kind: None,
            payload: None,
            recorded_as: QueryKind::AssociationScan,
        }
    }

    /// Restrict to a single owner
    pub fn owner(self, object_id: ObjectId) -> Self {
        self.owners([object_id])
    }

    /// Restrict to a page of owners (adds to any owners already given)
    pub fn owners(mut self, object_ids: impl IntoIterator<Item = ObjectId>) -> Self {
        self.owners
            .get_or_insert_with(BTreeSet::new)
            .extend(object_ids);
        self
    }

    /// Keep only associations of one payload kind
    pub fn payload_kind(mut self, kind: PayloadKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Keep only associations to one payload
    pub fn payload(mut self, payload: PayloadRef) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Record this query under a different kind in the query log
    pub(crate) fn recorded_as(mut self, kind: QueryKind) -> Self {
        self.recorded_as = kind;
        self
    }

    fn matches(&self, payload: &PayloadRef) -> bool {
        if let Some(kind) = self.kind {
            if payload.kind() != kind {
                return false;
            }
        }
        if let Some(expected) = &self.payload {
            if payload != expected {
                return false;
            }
        }
        true
    }

    /// Execute the query
    ///
    /// Rows come back in creation order, ties broken by ascending id. An
    /// explicitly empty owner page returns nothing without touching storage.
    pub fn fetch(self, store: &AssociationStore) -> Result<Vec<Association>> {
        store.registry().resolve(self.type_id)?;

        let t = self.type_id.0;
        let ranges: Vec<(ObjectId, ObjectId)> = match &self.owners {
            Some(owners) if owners.is_empty() => return Ok(Vec::new()),
            Some(owners) => owners.iter().map(|o| (*o, *o)).collect(),
            None => vec![(ObjectId::MIN, ObjectId::MAX)],
        };

        let read_txn = store.storage().read(self.recorded_as)?;
        let table = read_txn.open_table(BY_OWNER_TABLE).map_err(db_err)?;

        let mut rows = Vec::new();
        let mut visited = 0;
        for (low, high) in ranges {
            for entry in table.range((t, low, 0)..=(t, high, u64::MAX)).map_err(db_err)? {
                let (key, value) = entry.map_err(db_err)?;
                visited += 1;
                let (_, object_id, id) = key.value();
                let (code, payload_id, created_micros) = value.value();
                let payload = PayloadRef::from_parts(code, payload_id)?;

                if !self.matches(&payload) {
                    continue;
                }

                rows.push(Association {
                    id,
                    reference: GenericReference::new(self.type_id, object_id),
                    payload,
                    created_at: DateTime::from_timestamp_micros(created_micros).unwrap_or_default(),
                });
            }
        }
        store.storage().log().record_rows(visited);

        rows.sort_by_key(Association::order_key);
        Ok(rows)
    }
}
