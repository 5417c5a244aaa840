// Association Store - persistence for generic associations
//
// Four tables back the store:
// - rows by association id (full row, JSON encoded)
// - a uniqueness index on (type, object, payload kind, payload id)
// - an owner index on (type, object, association id) carrying the payload
//   and creation time, used for every lookup and scan
// - a payload index on (payload kind, payload id, association id), used to
//   drop the rows of a deleted payload entity
//
// redb allows a single writer at a time, so the check-and-insert in `create`
// is race free: of two concurrent creators of the same triple exactly one
// commits and the other observes the row.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use assoc_types::{
    AssocError, Association, AssociationId, GenericReference, ObjectId, PayloadRef, Result,
    TypeId, TypeRegistry,
};
use chrono::{DateTime, Utc};
use redb::{ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};

use crate::query::AssociationQuery;
use crate::query_log::QueryKind;
use crate::storage::{db_err, Storage};

// Table definition: key is the association id, value is a serialized row
pub(crate) const ASSOCIATIONS_TABLE: TableDefinition<u64, &[u8]> =
    TableDefinition::new("associations");

// Table definition: key is (type, object, payload kind, payload id), value is the association id
pub(crate) const UNIQUE_TABLE: TableDefinition<(u32, u64, u8, u64), u64> =
    TableDefinition::new("associations_unique");

// Table definition: key is (type, object, association id), value is (payload kind, payload id, created micros)
pub(crate) const BY_OWNER_TABLE: TableDefinition<(u32, u64, u64), (u8, u64, i64)> =
    TableDefinition::new("associations_by_owner");

// Table definition: key is (payload kind, payload id, association id), value is (type, object)
pub(crate) const BY_PAYLOAD_TABLE: TableDefinition<(u8, u64, u64), (u32, u64)> =
    TableDefinition::new("associations_by_payload");

// Table definition: key is the sequence name, value is the last issued id
const SEQUENCES_TABLE: TableDefinition<&str, u64> = TableDefinition::new("sequences");

const ASSOCIATION_SEQUENCE: &str = "association";

/// Issue the next id of a named sequence inside a write transaction
///
/// Ids start at 1 and are never handed out twice, even after the row that
/// carried the highest id is deleted.
pub fn next_id(txn: &WriteTransaction, sequence: &str) -> Result<u64> {
    let mut sequences = txn.open_table(SEQUENCES_TABLE).map_err(db_err)?;
    let last = sequences
        .get(sequence)
        .map_err(db_err)?
        .map(|guard| guard.value())
        .unwrap_or(0);
    sequences.insert(sequence, last + 1).map_err(db_err)?;
    Ok(last + 1)
}

/// Stored row format (compact for storage)
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredAssociation {
    /// Owner type id
    t: u32,
    /// Owner object id
    o: u64,
    /// Payload kind code
    k: u8,
    /// Payload id
    p: u64,
    /// Creation time in microseconds since epoch
    ts: i64,
}

impl StoredAssociation {
    fn into_association(self, id: AssociationId) -> Result<Association> {
        Ok(Association {
            id,
            reference: GenericReference::new(TypeId(self.t), self.o),
            payload: PayloadRef::from_parts(self.k, self.p)?,
            created_at: DateTime::from_timestamp_micros(self.ts).unwrap_or_default(),
        })
    }

    fn unique_key(&self) -> (u32, u64, u8, u64) {
        (self.t, self.o, self.k, self.p)
    }
}

fn unique_key(reference: &GenericReference, payload: &PayloadRef) -> (u32, u64, u8, u64) {
    (
        reference.type_id.0,
        reference.object_id,
        payload.kind().code(),
        payload.id(),
    )
}

enum Insert {
    Created(AssociationId),
    Existing(AssociationId),
}

/// Persistent store of association rows
pub struct AssociationStore {
    storage: Storage,
    registry: Arc<TypeRegistry>,
}

impl AssociationStore {
    /// Create the store, making sure its tables exist
    pub fn new(storage: Storage, registry: Arc<TypeRegistry>) -> Result<Self> {
        storage.create_table(ASSOCIATIONS_TABLE)?;
        storage.create_table(UNIQUE_TABLE)?;
        storage.create_table(BY_OWNER_TABLE)?;
        storage.create_table(BY_PAYLOAD_TABLE)?;
        storage.create_table(SEQUENCES_TABLE)?;

        Ok(Self { storage, registry })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Store a new association
    ///
    /// Fails with `DuplicateAssociation` (carrying the existing id) if the
    /// `(type, object, payload)` triple is already stored.
    pub fn create(&self, reference: GenericReference, payload: PayloadRef) -> Result<AssociationId> {
        self.registry.check(&reference)?;

        let created_at = Utc::now();
        let write_txn = self.storage.write(QueryKind::AssociationInsert)?;
        match Self::insert_in(&write_txn, &reference, payload, created_at)? {
            Insert::Created(id) => {
                write_txn.commit().map_err(db_err)?;
                tracing::debug!("Created association {}: {} -> {}", id, reference, payload);
                Ok(id)
            }
            Insert::Existing(existing) => {
                write_txn.abort().map_err(db_err)?;
                Err(AssocError::DuplicateAssociation {
                    reference,
                    payload,
                    existing,
                })
            }
        }
    }

    fn insert_in(
        txn: &WriteTransaction,
        reference: &GenericReference,
        payload: PayloadRef,
        created_at: DateTime<Utc>,
    ) -> Result<Insert> {
        let mut unique = txn.open_table(UNIQUE_TABLE).map_err(db_err)?;
        let key = unique_key(reference, &payload);
        if let Some(existing) = unique.get(key).map_err(db_err)? {
            return Ok(Insert::Existing(existing.value()));
        }

        let id = next_id(txn, ASSOCIATION_SEQUENCE)?;

        let stored = StoredAssociation {
            t: reference.type_id.0,
            o: reference.object_id,
            k: payload.kind().code(),
            p: payload.id(),
            ts: created_at.timestamp_micros(),
        };
        let bytes = serde_json::to_vec(&stored)?;

        unique.insert(key, id).map_err(db_err)?;
        let mut by_owner = txn.open_table(BY_OWNER_TABLE).map_err(db_err)?;
        by_owner
            .insert((stored.t, stored.o, id), (stored.k, stored.p, stored.ts))
            .map_err(db_err)?;
        let mut by_payload = txn.open_table(BY_PAYLOAD_TABLE).map_err(db_err)?;
        by_payload
            .insert((stored.k, stored.p, id), (stored.t, stored.o))
            .map_err(db_err)?;
        let mut rows = txn.open_table(ASSOCIATIONS_TABLE).map_err(db_err)?;
        rows.insert(id, bytes.as_slice()).map_err(db_err)?;

        Ok(Insert::Created(id))
    }

    /// Remove an association by id
    ///
    /// Returns whether a row was removed; deleting an absent id is a no-op.
    pub fn delete(&self, id: AssociationId) -> Result<bool> {
        let write_txn = self.storage.write(QueryKind::AssociationDelete)?;
        let removed = Self::remove_in(&write_txn, id)?;
        write_txn.commit().map_err(db_err)?;

        if removed {
            tracing::debug!("Deleted association {}", id);
        }
        Ok(removed)
    }

    fn remove_in(txn: &WriteTransaction, id: AssociationId) -> Result<bool> {
        let mut rows = txn.open_table(ASSOCIATIONS_TABLE).map_err(db_err)?;
        let stored: StoredAssociation = {
            let removed = rows.remove(id).map_err(db_err)?;
            match removed {
                Some(guard) => serde_json::from_slice(guard.value())?,
                None => return Ok(false),
            }
        };

        let mut unique = txn.open_table(UNIQUE_TABLE).map_err(db_err)?;
        unique.remove(stored.unique_key()).map_err(db_err)?;
        let mut by_owner = txn.open_table(BY_OWNER_TABLE).map_err(db_err)?;
        by_owner.remove((stored.t, stored.o, id)).map_err(db_err)?;
        let mut by_payload = txn.open_table(BY_PAYLOAD_TABLE).map_err(db_err)?;
        by_payload.remove((stored.k, stored.p, id)).map_err(db_err)?;
        Ok(true)
    }

    /// Read one association row
    pub fn get(&self, id: AssociationId) -> Result<Option<Association>> {
        let read_txn = self.storage.read(QueryKind::AssociationGet)?;
        let rows = read_txn.open_table(ASSOCIATIONS_TABLE).map_err(db_err)?;

        let stored: Option<StoredAssociation> = match rows.get(id).map_err(db_err)? {
            Some(guard) => Some(serde_json::from_slice(guard.value())?),
            None => None,
        };
        stored.map(|s| s.into_association(id)).transpose()
    }

    /// Payloads of one owner, in creation order (ties by ascending id)
    pub fn find_by_reference(&self, reference: GenericReference) -> Result<Vec<PayloadRef>> {
        let rows = AssociationQuery::for_type(reference.type_id)
            .owner(reference.object_id)
            .recorded_as(QueryKind::AssociationLookup)
            .fetch(self)?;
        Ok(rows.into_iter().map(|a| a.payload).collect())
    }

    /// Payloads of many owners
    ///
    /// Issues one scan per distinct type in `references`. Every input
    /// reference is present in the result, mapped to an empty list when it
    /// has no associations.
    pub fn bulk_find_by_references(
        &self,
        references: &[GenericReference],
    ) -> Result<HashMap<GenericReference, Vec<PayloadRef>>> {
        Ok(self
            .bulk_find_associations(references)?
            .into_iter()
            .map(|(reference, rows)| (reference, rows.into_iter().map(|a| a.payload).collect()))
            .collect())
    }

    /// Full association rows of many owners, one scan per distinct type
    pub fn bulk_find_associations(
        &self,
        references: &[GenericReference],
    ) -> Result<HashMap<GenericReference, Vec<Association>>> {
        let mut by_type: BTreeMap<TypeId, BTreeSet<ObjectId>> = BTreeMap::new();
        for reference in references {
            self.registry.check(reference)?;
            by_type
                .entry(reference.type_id)
                .or_default()
                .insert(reference.object_id);
        }

        let mut result: HashMap<GenericReference, Vec<Association>> =
            references.iter().map(|r| (*r, Vec::new())).collect();

        for (type_id, owners) in by_type {
            let rows = AssociationQuery::for_type(type_id).owners(owners).fetch(self)?;
            for association in rows {
                if let Some(owner_rows) = result.get_mut(&association.reference) {
                    owner_rows.push(association);
                }
            }
        }

        Ok(result)
    }

    /// Cascade hook: delete every association of an owner in its own transaction
    pub fn on_owner_deleted(&self, type_id: TypeId, object_id: ObjectId) -> Result<usize> {
        let reference = GenericReference::new(type_id, object_id);
        self.registry.check(&reference)?;

        let write_txn = self.storage.write(QueryKind::CascadeDelete)?;
        let removed = Self::remove_owner_in(&write_txn, reference)?;
        write_txn.commit().map_err(db_err)?;

        tracing::debug!("Removed {} associations of deleted owner {}", removed, reference);
        Ok(removed)
    }

    /// Delete every association of an owner inside an existing transaction
    pub(crate) fn remove_owner_in(txn: &WriteTransaction, reference: GenericReference) -> Result<usize> {
        let t = reference.type_id.0;
        let o = reference.object_id;

        let ids: Vec<AssociationId> = {
            let by_owner = txn.open_table(BY_OWNER_TABLE).map_err(db_err)?;
            let mut ids = Vec::new();
            for entry in by_owner.range((t, o, 0)..=(t, o, u64::MAX)).map_err(db_err)? {
                let (key, _) = entry.map_err(db_err)?;
                ids.push(key.value().2);
            }
            ids
        };

        Self::remove_all_in(txn, ids)
    }

    /// Cascade hook for payload entities: delete every association pointing
    /// at `payload`, whatever its owner
    pub fn on_payload_deleted(&self, payload: PayloadRef) -> Result<usize> {
        let write_txn = self.storage.write(QueryKind::CascadeDelete)?;
        let removed = Self::remove_payload_in(&write_txn, payload)?;
        write_txn.commit().map_err(db_err)?;

        tracing::debug!("Removed {} associations to deleted payload {}", removed, payload);
        Ok(removed)
    }

    /// Delete every association to a payload inside an existing transaction
    pub(crate) fn remove_payload_in(txn: &WriteTransaction, payload: PayloadRef) -> Result<usize> {
        let k = payload.kind().code();
        let p = payload.id();

        let ids: Vec<AssociationId> = {
            let by_payload = txn.open_table(BY_PAYLOAD_TABLE).map_err(db_err)?;
            let mut ids = Vec::new();
            for entry in by_payload.range((k, p, 0)..=(k, p, u64::MAX)).map_err(db_err)? {
                let (key, _) = entry.map_err(db_err)?;
                ids.push(key.value().2);
            }
            ids
        };

        Self::remove_all_in(txn, ids)
    }

    fn remove_all_in(txn: &WriteTransaction, ids: Vec<AssociationId>) -> Result<usize> {
        let mut removed = 0;
        for id in ids {
            if Self::remove_in(txn, id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixture;

    #[test]
    fn test_create_and_find_in_creation_order() {
        let fx = fixture();
        let product = GenericReference::new(fx.product, 1);

        fx.store.create(product, PayloadRef::Tag(2)).unwrap();
        fx.store.create(product, PayloadRef::Tag(1)).unwrap();
        fx.store.create(product, PayloadRef::Actor(9)).unwrap();

        let payloads = fx.store.find_by_reference(product).unwrap();
        assert_eq!(
            payloads,
            vec![PayloadRef::Tag(2), PayloadRef::Tag(1), PayloadRef::Actor(9)]
        );
    }

    #[test]
    fn test_duplicate_is_signaled_and_not_stored() {
        let fx = fixture();
        let product = GenericReference::new(fx.product, 1);

        let id = fx.store.create(product, PayloadRef::Tag(1)).unwrap();
        let err = fx.store.create(product, PayloadRef::Tag(1)).unwrap_err();

        assert!(err.is_duplicate());
        assert!(!err.is_fatal());
        assert!(matches!(err, AssocError::DuplicateAssociation { existing, .. } if existing == id));
        assert_eq!(fx.store.find_by_reference(product).unwrap().len(), 1);
    }

    #[test]
    fn test_same_payload_on_different_owner_types_is_not_a_duplicate() {
        let fx = fixture();
        fx.store
            .create(GenericReference::new(fx.product, 1), PayloadRef::Tag(1))
            .unwrap();
        fx.store
            .create(GenericReference::new(fx.article, 1), PayloadRef::Tag(1))
            .unwrap();
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let fx = fixture();
        let result = fx
            .store
            .create(GenericReference::new(TypeId(99), 1), PayloadRef::Tag(1));
        assert!(matches!(result, Err(AssocError::UnknownType(TypeId(99)))));
    }

    #[test]
    fn test_delete_is_noop_safe_and_frees_the_triple() {
        let fx = fixture();
        let product = GenericReference::new(fx.product, 1);

        let id = fx.store.create(product, PayloadRef::Tag(1)).unwrap();
        assert!(fx.store.delete(id).unwrap());
        assert!(!fx.store.delete(id).unwrap());
        assert!(fx.store.get(id).unwrap().is_none());

        // The triple can be stored again, under a fresh id
        let again = fx.store.create(product, PayloadRef::Tag(1)).unwrap();
        assert!(again > id);
    }

    #[test]
    fn test_get_returns_full_row() {
        let fx = fixture();
        let product = GenericReference::new(fx.product, 3);
        let id = fx.store.create(product, PayloadRef::Actor(4)).unwrap();

        let row = fx.store.get(id).unwrap().unwrap();
        assert_eq!(row.reference, product);
        assert_eq!(row.payload, PayloadRef::Actor(4));
    }

    #[test]
    fn test_bulk_find_scans_once_per_type_and_keeps_empty_owners() {
        let fx = fixture();
        for object_id in 1..=20 {
            fx.store
                .create(GenericReference::new(fx.product, object_id), PayloadRef::Tag(1))
                .unwrap();
        }
        fx.store
            .create(GenericReference::new(fx.article, 5), PayloadRef::Tag(2))
            .unwrap();

        let mut references: Vec<_> = (1..=25)
            .map(|id| GenericReference::new(fx.product, id))
            .collect();
        references.push(GenericReference::new(fx.article, 5));
        references.push(GenericReference::new(fx.article, 6));

        fx.storage.log().reset();
        let found = fx.store.bulk_find_by_references(&references).unwrap();

        assert_eq!(fx.storage.log().count(QueryKind::AssociationScan), 2);
        assert_eq!(found.len(), references.len());
        assert_eq!(found[&GenericReference::new(fx.product, 7)], vec![PayloadRef::Tag(1)]);
        assert!(found[&GenericReference::new(fx.product, 22)].is_empty());
        assert!(found[&GenericReference::new(fx.article, 6)].is_empty());
    }

    #[test]
    fn test_bulk_find_with_unknown_type_issues_no_queries() {
        let fx = fixture();
        fx.storage.log().reset();

        let result = fx.store.bulk_find_by_references(&[
            GenericReference::new(fx.product, 1),
            GenericReference::new(TypeId(42), 1),
        ]);

        assert!(matches!(result, Err(AssocError::UnknownType(_))));
        assert_eq!(fx.storage.log().total(), 0);
    }

    #[test]
    fn test_owner_deleted_removes_all_rows() {
        let fx = fixture();
        let product = GenericReference::new(fx.product, 1);
        let other = GenericReference::new(fx.product, 2);
        fx.store.create(product, PayloadRef::Tag(1)).unwrap();
        fx.store.create(product, PayloadRef::Actor(1)).unwrap();
        fx.store.create(other, PayloadRef::Tag(1)).unwrap();

        let removed = fx.store.on_owner_deleted(fx.product, 1).unwrap();

        assert_eq!(removed, 2);
        assert!(fx.store.find_by_reference(product).unwrap().is_empty());
        assert_eq!(fx.store.find_by_reference(other).unwrap().len(), 1);
        // Uniqueness entries went with the rows
        fx.store.create(product, PayloadRef::Tag(1)).unwrap();
    }

    #[test]
    fn test_payload_deleted_removes_rows_across_owners() {
        let fx = fixture();
        let product = GenericReference::new(fx.product, 1);
        let article = GenericReference::new(fx.article, 4);
        fx.store.create(product, PayloadRef::Actor(2)).unwrap();
        fx.store.create(product, PayloadRef::Actor(3)).unwrap();
        fx.store.create(article, PayloadRef::Actor(2)).unwrap();
        fx.store.create(article, PayloadRef::Tag(2)).unwrap();

        let removed = fx.store.on_payload_deleted(PayloadRef::Actor(2)).unwrap();

        assert_eq!(removed, 2);
        assert_eq!(fx.store.find_by_reference(product).unwrap(), vec![PayloadRef::Actor(3)]);
        assert_eq!(fx.store.find_by_reference(article).unwrap(), vec![PayloadRef::Tag(2)]);
        assert_eq!(fx.store.on_payload_deleted(PayloadRef::Actor(2)).unwrap(), 0);
    }

    #[test]
    fn test_sequences_never_reissue_ids() {
        let fx = fixture();
        let txn = fx.storage.write(QueryKind::Write).unwrap();
        assert_eq!(next_id(&txn, "widgets").unwrap(), 1);
        assert_eq!(next_id(&txn, "widgets").unwrap(), 2);
        assert_eq!(next_id(&txn, "gadgets").unwrap(), 1);
        txn.commit().unwrap();

        let txn = fx.storage.write(QueryKind::Write).unwrap();
        assert_eq!(next_id(&txn, "widgets").unwrap(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_creates_have_one_winner() {
        let fx = fixture();
        let store = Arc::new(fx.store);
        let product = GenericReference::new(fx.product, 1);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::task::spawn_blocking(move || {
                store.create(product, PayloadRef::Tag(1))
            }));
        }

        let mut created = 0;
        let mut duplicates = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => created += 1,
                Err(e) if e.is_duplicate() => duplicates += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(created, 1);
        assert_eq!(duplicates, 7);
        assert_eq!(store.find_by_reference(product).unwrap().len(), 1);
    }
}
