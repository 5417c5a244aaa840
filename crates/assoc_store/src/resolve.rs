//! Resolution Manager - associations and payloads for one owner or a batch
//!
//! Batch resolution runs in two phases:
//!
//! 1. Raw associations for all owners, one scan per distinct owner type
//! 2. Owner liveness and distinct payload ids across the whole batch
//!
//! Tables living in the association database take part in phase 2 through
//! one shared read transaction, so a batch costs one scan per owner type plus
//! a single read. Tables elsewhere cost one lookup each per payload kind or
//! owner type.
//!
//! Payload entities are then handed back per owner in the owner's association
//! order. Owners and payloads are reached through dispatch tables keyed by
//! owner type and payload kind, so unrelated entity tables never need a common
//! supertype.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use assoc_types::{
    AssocError, DanglingCause, GenericReference, ObjectId, PayloadEntity, PayloadKind, PayloadRef,
    Result, TypeId,
};
use redb::{ReadTransaction, WriteTransaction};

use crate::query_log::QueryKind;
use crate::storage::Storage;
use crate::store::AssociationStore;

// ─────────────────────────────────────────────────────────────────────────────
// Dispatch Traits
// ─────────────────────────────────────────────────────────────────────────────

/// Resolves payload ids of one kind into full entities
pub trait PayloadLoader: Send + Sync {
    /// The payload kind this loader serves
    fn kind(&self) -> PayloadKind;

    /// Load every id in `ids` with a single query
    ///
    /// Ids that no longer exist are simply absent from the result.
    fn load_many(&self, ids: &BTreeSet<u64>) -> Result<HashMap<u64, PayloadEntity>>;

    /// Whether the payload table lives in the association store's database
    /// and can be read through a shared transaction
    fn transactional(&self) -> bool {
        false
    }

    /// Load every id in `ids` through a shared read transaction
    fn load_in(
        &self,
        _txn: &ReadTransaction,
        ids: &BTreeSet<u64>,
    ) -> Result<HashMap<u64, PayloadEntity>> {
        Err(AssocError::Database(format!(
            "{} payloads cannot be read inside a shared transaction ({} ids)",
            self.kind(),
            ids.len()
        )))
    }
}

/// An owning entity table, addressed only by id
pub trait OwnerTable: Send + Sync {
    /// Which of `ids` still identify a live owner (one query)
    fn live_ids(&self, ids: &BTreeSet<ObjectId>) -> Result<HashSet<ObjectId>>;

    /// Delete one owner in its own unit of work
    fn delete(&self, id: ObjectId) -> Result<bool>;

    /// Whether the table lives in the association store's database and can
    /// join its transactions
    fn transactional(&self) -> bool {
        false
    }

    /// Which of `ids` are live, read through a shared transaction
    fn live_ids_in(&self, _txn: &ReadTransaction, ids: &BTreeSet<ObjectId>) -> Result<HashSet<ObjectId>> {
        Err(AssocError::Database(format!(
            "{} owners cannot be probed inside a shared transaction",
            ids.len()
        )))
    }

    /// Delete one owner inside a shared write transaction
    fn delete_in(&self, _txn: &WriteTransaction, id: ObjectId) -> Result<bool> {
        Err(AssocError::Database(format!(
            "owner {} cannot be deleted inside a shared transaction",
            id
        )))
    }
}

/// Read transaction shared by phase 2 of one batch, opened on first use
struct SharedRead<'a> {
    storage: &'a Storage,
    txn: Option<ReadTransaction>,
}

impl<'a> SharedRead<'a> {
    fn new(storage: &'a Storage) -> Self {
        Self { storage, txn: None }
    }

    fn txn(&mut self) -> Result<&ReadTransaction> {
        match &mut self.txn {
            Some(txn) => Ok(&*txn),
            slot => {
                let txn = self.storage.read(QueryKind::PayloadLookup)?;
                Ok(&*slot.insert(txn))
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Resolution Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Builder wiring the per-type and per-kind dispatch tables
pub struct ResolutionManagerBuilder {
    store: Arc<AssociationStore>,
    payloads: HashMap<PayloadKind, Arc<dyn PayloadLoader>>,
    owners: HashMap<TypeId, Arc<dyn OwnerTable>>,
}

impl ResolutionManagerBuilder {
    pub fn new(store: Arc<AssociationStore>) -> Self {
        Self {
            store,
            payloads: HashMap::new(),
            owners: HashMap::new(),
        }
    }

    /// Register the loader for a payload kind (replaces any previous one)
    pub fn payload_loader(mut self, loader: Arc<dyn PayloadLoader>) -> Self {
        self.payloads.insert(loader.kind(), loader);
        self
    }

    /// Register the owner table of a type, used to detect dangling owners
    pub fn owner_table(mut self, type_id: TypeId, table: Arc<dyn OwnerTable>) -> Self {
        self.owners.insert(type_id, table);
        self
    }

    pub fn build(self) -> ResolutionManager {
        ResolutionManager {
            store: self.store,
            payloads: self.payloads,
            owners: self.owners,
        }
    }
}

/// Resolves associations for single owners and batches
pub struct ResolutionManager {
    store: Arc<AssociationStore>,
    payloads: HashMap<PayloadKind, Arc<dyn PayloadLoader>>,
    owners: HashMap<TypeId, Arc<dyn OwnerTable>>,
}

impl ResolutionManager {
    pub fn builder(store: Arc<AssociationStore>) -> ResolutionManagerBuilder {
        ResolutionManagerBuilder::new(store)
    }

    pub fn store(&self) -> &Arc<AssociationStore> {
        &self.store
    }

    /// Owner table registered for a type
    pub fn owner_table(&self, type_id: TypeId) -> Option<&Arc<dyn OwnerTable>> {
        self.owners.get(&type_id)
    }

    /// Payload references of one owner, in association order
    pub fn get_for_one(&self, type_id: TypeId, object_id: ObjectId) -> Result<Vec<PayloadRef>> {
        self.store
            .find_by_reference(GenericReference::new(type_id, object_id))
    }

    /// Resolved payloads for a batch of owners
    ///
    /// Every input owner is present in the result. Associations whose owner
    /// or payload no longer exists are left out and logged; they never fail
    /// the batch.
    pub fn get_for_batch(
        &self,
        owners: &[GenericReference],
    ) -> Result<HashMap<GenericReference, Vec<PayloadEntity>>> {
        if owners.is_empty() {
            return Ok(HashMap::new());
        }

        // Phase 1: raw associations, one scan per distinct type
        let raw = self.store.bulk_find_associations(owners)?;

        // Phase 2: liveness and payloads, sharing one read where possible
        let mut shared = SharedRead::new(self.store.storage());
        let dead_owners = self.dead_owners(&raw, &mut shared)?;

        let mut wanted: BTreeMap<PayloadKind, BTreeSet<u64>> = BTreeMap::new();
        for (reference, rows) in &raw {
            if dead_owners.contains(reference) {
                continue;
            }
            for association in rows {
                wanted
                    .entry(association.payload.kind())
                    .or_default()
                    .insert(association.payload.id());
            }
        }

        let mut resolved: HashMap<PayloadRef, PayloadEntity> = HashMap::new();
        for (kind, ids) in wanted {
            let loader = self
                .payloads
                .get(&kind)
                .ok_or(AssocError::MissingLoader(kind))?;
            let loaded = if loader.transactional() {
                loader.load_in(shared.txn()?, &ids)?
            } else {
                loader.load_many(&ids)?
            };
            for (id, entity) in loaded {
                resolved.insert(PayloadRef::new(kind, id), entity);
            }
        }

        // Distribute per owner, preserving association order
        let mut result = HashMap::with_capacity(raw.len());
        for (reference, rows) in raw {
            if dead_owners.contains(&reference) {
                for association in &rows {
                    report_dangling(reference, Some(association.payload), DanglingCause::OwnerMissing);
                }
                result.insert(reference, Vec::new());
                continue;
            }

            let mut entities = Vec::with_capacity(rows.len());
            for association in rows {
                match resolved.get(&association.payload) {
                    Some(entity) => entities.push(entity.clone()),
                    None => report_dangling(
                        reference,
                        Some(association.payload),
                        DanglingCause::PayloadMissing,
                    ),
                }
            }
            result.insert(reference, entities);
        }

        Ok(result)
    }

    /// Owners that have associations but no longer exist
    ///
    /// Only owners with at least one association are probed, per type that
    /// has an owner table registered.
    fn dead_owners<T>(
        &self,
        raw: &HashMap<GenericReference, Vec<T>>,
        shared: &mut SharedRead<'_>,
    ) -> Result<HashSet<GenericReference>> {
        let mut by_type: BTreeMap<TypeId, BTreeSet<ObjectId>> = BTreeMap::new();
        for (reference, rows) in raw {
            if !rows.is_empty() && self.owners.contains_key(&reference.type_id) {
                by_type
                    .entry(reference.type_id)
                    .or_default()
                    .insert(reference.object_id);
            }
        }

        let mut dead = HashSet::new();
        for (type_id, ids) in by_type {
            let Some(table) = self.owners.get(&type_id) else {
                continue;
            };
            let live = if table.transactional() {
                table.live_ids_in(shared.txn()?, &ids)?
            } else {
                table.live_ids(&ids)?
            };
            dead.extend(
                ids.into_iter()
                    .filter(|id| !live.contains(id))
                    .map(|id| GenericReference::new(type_id, id)),
            );
        }
        Ok(dead)
    }
}

fn report_dangling(reference: GenericReference, payload: Option<PayloadRef>, cause: DanglingCause) {
    let err = AssocError::DanglingReference {
        reference,
        payload,
        cause,
    };
    tracing::warn!("Skipping association: {}", err);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_log::QueryKind;
    use crate::testing::{fixture, MemoryOwners, MemoryPayloads};

    #[test]
    fn test_product_and_article_tagged_sale() {
        let fx = fixture();
        assert_eq!(fx.product, TypeId(1));
        assert_eq!(fx.article, TypeId(2));

        let sale = PayloadRef::Tag(1);
        let product = GenericReference::new(fx.product, 1);
        let article = GenericReference::new(fx.article, 1);
        fx.store.create(product, sale).unwrap();
        fx.store.create(article, sale).unwrap();

        let tags = Arc::new(MemoryPayloads::tags(&fx.storage, &[(1, "sale")]));
        let manager = ResolutionManager::builder(Arc::new(fx.store))
            .payload_loader(tags)
            .build();

        assert_eq!(manager.get_for_one(fx.product, 1).unwrap(), vec![sale]);
        assert_eq!(manager.get_for_one(fx.article, 1).unwrap(), vec![sale]);

        fx.storage.log().reset();
        let batch = manager.get_for_batch(&[product, article]).unwrap();

        let labels = |r: &GenericReference| -> Vec<String> {
            batch[r].iter().map(|e| e.label().to_string()).collect()
        };
        assert_eq!(batch.len(), 2);
        assert_eq!(labels(&product), vec!["sale"]);
        assert_eq!(labels(&article), vec!["sale"]);
        assert_eq!(fx.storage.log().count(QueryKind::AssociationScan), 2);
        assert_eq!(fx.storage.log().count(QueryKind::PayloadLookup), 1);
        assert_eq!(fx.storage.log().total(), 3);
    }

    #[test]
    fn test_empty_batch_performs_no_queries() {
        let fx = fixture();
        let storage = fx.storage.clone();
        let manager = ResolutionManager::builder(Arc::new(fx.store)).build();

        storage.log().reset();
        let batch = manager.get_for_batch(&[]).unwrap();

        assert!(batch.is_empty());
        assert_eq!(storage.log().total(), 0);
    }

    #[test]
    fn test_query_count_is_bounded_by_types_not_batch_size() {
        let fx = fixture();
        let mut owners = Vec::new();
        for object_id in 1..=50 {
            let product = GenericReference::new(fx.product, object_id);
            let article = GenericReference::new(fx.article, object_id);
            fx.store.create(product, PayloadRef::Tag(object_id % 3)).unwrap();
            fx.store.create(article, PayloadRef::Actor(object_id % 4)).unwrap();
            owners.push(product);
            owners.push(article);
        }

        let storage = fx.storage.clone();
        let manager = ResolutionManager::builder(Arc::new(fx.store))
            .payload_loader(Arc::new(MemoryPayloads::tags(
                &storage,
                &[(0, "new"), (1, "sale"), (2, "clearance")],
            )))
            .payload_loader(Arc::new(MemoryPayloads::actors(
                &storage,
                &[(0, "ann"), (1, "bob"), (2, "cy"), (3, "dee")],
            )))
            .build();

        storage.log().reset();
        let batch = manager.get_for_batch(&owners).unwrap();

        assert_eq!(batch.len(), 100);
        let scans = storage.log().count(QueryKind::AssociationScan);
        let lookups = storage.log().count(QueryKind::PayloadLookup);
        assert_eq!(scans, 2);
        assert_eq!(lookups, 2);
        assert!(scans + lookups <= 2 * 2);
    }

    #[test]
    fn test_order_follows_association_order_per_owner() {
        let fx = fixture();
        let product = GenericReference::new(fx.product, 1);
        fx.store.create(product, PayloadRef::Tag(3)).unwrap();
        fx.store.create(product, PayloadRef::Tag(1)).unwrap();
        fx.store.create(product, PayloadRef::Tag(2)).unwrap();

        let storage = fx.storage.clone();
        let manager = ResolutionManager::builder(Arc::new(fx.store))
            .payload_loader(Arc::new(MemoryPayloads::tags(
                &storage,
                &[(1, "a"), (2, "b"), (3, "c")],
            )))
            .build();

        let batch = manager.get_for_batch(&[product]).unwrap();
        let labels: Vec<_> = batch[&product].iter().map(|e| e.label()).collect();
        assert_eq!(labels, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_dangling_payload_is_skipped_not_fatal() {
        let fx = fixture();
        let product = GenericReference::new(fx.product, 1);
        fx.store.create(product, PayloadRef::Tag(1)).unwrap();
        fx.store.create(product, PayloadRef::Tag(404)).unwrap();

        let storage = fx.storage.clone();
        let manager = ResolutionManager::builder(Arc::new(fx.store))
            .payload_loader(Arc::new(MemoryPayloads::tags(&storage, &[(1, "sale")])))
            .build();

        let batch = manager.get_for_batch(&[product]).unwrap();
        assert_eq!(batch[&product].len(), 1);
        assert_eq!(batch[&product][0].label(), "sale");
    }

    #[test]
    fn test_dangling_owner_is_skipped_not_fatal() {
        let fx = fixture();
        let live = GenericReference::new(fx.product, 1);
        let gone = GenericReference::new(fx.product, 2);
        fx.store.create(live, PayloadRef::Tag(1)).unwrap();
        fx.store.create(gone, PayloadRef::Tag(1)).unwrap();

        let storage = fx.storage.clone();
        let product_type = fx.product;
        let manager = ResolutionManager::builder(Arc::new(fx.store))
            .payload_loader(Arc::new(MemoryPayloads::tags(&storage, &[(1, "sale")])))
            .owner_table(product_type, MemoryOwners::with([1]))
            .build();

        let batch = manager.get_for_batch(&[live, gone]).unwrap();
        assert_eq!(batch[&live].len(), 1);
        assert!(batch[&gone].is_empty());
    }

    #[test]
    fn test_missing_loader_is_an_error() {
        let fx = fixture();
        let product = GenericReference::new(fx.product, 1);
        fx.store.create(product, PayloadRef::Actor(1)).unwrap();

        let manager = ResolutionManager::builder(Arc::new(fx.store)).build();
        let result = manager.get_for_batch(&[product]);
        assert!(matches!(
            result,
            Err(AssocError::MissingLoader(PayloadKind::Actor))
        ));
    }
}
