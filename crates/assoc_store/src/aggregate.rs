//! Aggregation Engine - grouped aggregates over dependents of an owner page
//!
//! An aggregate is computed with a single grouped query restricted to the
//! supplied owner ids, never the whole table. Owners without dependents are
//! zero-filled rather than omitted.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use assoc_types::{AssocError, ObjectId, PayloadKind, Result, ScopeViolation, TypeId, TypeRegistry};

use crate::query::AssociationQuery;
use crate::query_log::QueryKind;
use crate::store::AssociationStore;

/// Default ceiling on owner ids per aggregate call
pub const DEFAULT_MAX_BATCH: usize = 500;

/// Scalar aggregates over a dependent's measured value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

/// A collection of dependents grouped by owner
pub trait DependentSource: Send + Sync {
    /// Feed `(owner id, measured value)` for every dependent of the given
    /// owners to `sink`, using one grouped query
    fn scan(
        &self,
        owner_type: TypeId,
        owners: &BTreeSet<ObjectId>,
        sink: &mut dyn FnMut(ObjectId, f64),
    ) -> Result<()>;
}

/// Association rows as dependents: tag counts, like counts
///
/// Each association measures `1.0`.
pub struct AssociationDependents {
    store: Arc<AssociationStore>,
    kind: Option<PayloadKind>,
}

impl AssociationDependents {
    /// Every association of the owner
    pub fn all(store: Arc<AssociationStore>) -> Self {
        Self { store, kind: None }
    }

    /// Only associations of one payload kind
    pub fn of_kind(store: Arc<AssociationStore>, kind: PayloadKind) -> Self {
        Self {
            store,
            kind: Some(kind),
        }
    }
}

impl DependentSource for AssociationDependents {
    fn scan(
        &self,
        owner_type: TypeId,
        owners: &BTreeSet<ObjectId>,
        sink: &mut dyn FnMut(ObjectId, f64),
    ) -> Result<()> {
        let mut query = AssociationQuery::for_type(owner_type)
            .owners(owners.iter().copied())
            .recorded_as(QueryKind::AggregateScan);
        if let Some(kind) = self.kind {
            query = query.payload_kind(kind);
        }

        for association in query.fetch(&self.store)? {
            sink(association.reference.object_id, 1.0);
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Accumulator {
    count: u64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl Accumulator {
    fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    /// Zero for owners without dependents, whatever the aggregate
    fn value(&self, aggregate: Aggregate) -> f64 {
        match aggregate {
            Aggregate::Count => self.count as f64,
            Aggregate::Sum => self.sum,
            Aggregate::Avg if self.count == 0 => 0.0,
            Aggregate::Avg => self.sum / self.count as f64,
            Aggregate::Min => self.min.unwrap_or(0.0),
            Aggregate::Max => self.max.unwrap_or(0.0),
        }
    }
}

/// Computes aggregates for pages of owners
pub struct AggregationEngine {
    registry: Arc<TypeRegistry>,
    source: Arc<dyn DependentSource>,
    max_batch: usize,
}

impl AggregationEngine {
    pub fn new(registry: Arc<TypeRegistry>, source: Arc<dyn DependentSource>) -> Self {
        Self {
            registry,
            source,
            max_batch: DEFAULT_MAX_BATCH,
        }
    }

    /// Set the ceiling on owner ids per call
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    fn scope(&self, owner_type: TypeId, owner_ids: &[ObjectId]) -> Result<BTreeSet<ObjectId>> {
        self.registry.resolve(owner_type)?;

        if owner_ids.is_empty() {
            return Err(AssocError::AggregationScope(ScopeViolation::Empty));
        }
        if owner_ids.len() > self.max_batch {
            return Err(AssocError::AggregationScope(ScopeViolation::TooLarge {
                len: owner_ids.len(),
                ceiling: self.max_batch,
            }));
        }
        Ok(owner_ids.iter().copied().collect())
    }

    fn accumulate(
        &self,
        owner_type: TypeId,
        owner_ids: &[ObjectId],
    ) -> Result<BTreeMap<ObjectId, Accumulator>> {
        let owners = self.scope(owner_type, owner_ids)?;

        let mut groups: BTreeMap<ObjectId, Accumulator> = owners
            .iter()
            .map(|id| (*id, Accumulator::default()))
            .collect();
        self.source.scan(owner_type, &owners, &mut |owner: ObjectId, value: f64| {
            if let Some(acc) = groups.get_mut(&owner) {
                acc.push(value);
            }
        })?;

        Ok(groups)
    }

    /// Number of dependents per owner; owners without any map to `0`
    pub fn counts_for(
        &self,
        owner_type: TypeId,
        owner_ids: &[ObjectId],
    ) -> Result<HashMap<ObjectId, u64>> {
        Ok(self
            .accumulate(owner_type, owner_ids)?
            .into_iter()
            .map(|(owner, acc)| (owner, acc.count))
            .collect())
    }

    /// Any scalar aggregate per owner; owners without dependents map to `0.0`
    pub fn aggregate_for(
        &self,
        owner_type: TypeId,
        owner_ids: &[ObjectId],
        aggregate: Aggregate,
    ) -> Result<HashMap<ObjectId, f64>> {
        Ok(self
            .accumulate(owner_type, owner_ids)?
            .into_iter()
            .map(|(owner, acc)| (owner, acc.value(aggregate)))
            .collect())
    }
}
