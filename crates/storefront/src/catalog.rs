// Catalog - entity tables of the admin backend
//
// Each entity kind is a JSON-encoded redb table keyed by id, living in the
// same database as the associations so owner deletion can share one write
// transaction with its cascade. Entities with a foreign key also maintain a
// `(parent id, own id) -> measured value` index, which feeds the per-parent
// aggregates (products per collection, orders and order totals per customer)
// and the delete protection of parents.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

use assoc_store::{
    db_err, next_id, CascadeHook, DependentSource, OwnerTable, PayloadLoader, QueryKind, Storage,
};
use assoc_types::{
    Actor, AssocError, ContentType, GenericReference, ObjectId, PayloadEntity, PayloadKind, Result,
    TypeId,
};
use chrono::{DateTime, Utc};
use redb::{ReadTransaction, ReadableTable, ReadableTableMetadata, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::tags::TagTable;

// ─────────────────────────────────────────────────────────────────────────────
// Entities
// ─────────────────────────────────────────────────────────────────────────────

/// A row type stored in its own catalog table
pub trait Entity: ContentType + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Table holding the rows
    const TABLE: &'static str;

    /// Index of `(parent id, own id)` for entities with a foreign key
    const PARENT_INDEX: Option<&'static str> = None;

    fn id(&self) -> ObjectId;

    /// Foreign key and the value it contributes to parent aggregates
    fn parent(&self) -> Option<(ObjectId, f64)> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub id: ObjectId,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ObjectId,
    pub title: String,
    pub unit_price: f64,
    pub inventory: u32,
    pub collection_id: ObjectId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: ObjectId,
    pub title: String,
}

/// Customer membership tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    #[default]
    Bronze,
    Silver,
    Gold,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: ObjectId,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub membership: Membership,
}

impl Customer {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Payment state of an order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: ObjectId,
    pub customer_id: ObjectId,
    pub placed_at: DateTime<Utc>,
    #[serde(default)]
    pub payment_status: PaymentStatus,
    /// Sum of the order's line totals
    pub total: f64,
}

/// An admin user, the actor behind likes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: ObjectId,
    pub username: String,
    pub email: String,
}

impl ContentType for Collection {
    const KIND: &'static str = "store.collection";
}

impl ContentType for Product {
    const KIND: &'static str = "store.product";
}

impl ContentType for Article {
    const KIND: &'static str = "blog.article";
}

impl ContentType for Customer {
    const KIND: &'static str = "store.customer";
}

impl ContentType for Order {
    const KIND: &'static str = "store.order";
}

impl ContentType for User {
    const KIND: &'static str = "core.user";
}

impl Entity for Collection {
    const TABLE: &'static str = "collections";

    fn id(&self) -> ObjectId {
        self.id
    }
}

impl Entity for Product {
    const TABLE: &'static str = "products";
    const PARENT_INDEX: Option<&'static str> = Some("products_by_collection");

    fn id(&self) -> ObjectId {
        self.id
    }

    fn parent(&self) -> Option<(ObjectId, f64)> {
        Some((self.collection_id, self.unit_price))
    }
}

impl Entity for Article {
    const TABLE: &'static str = "articles";

    fn id(&self) -> ObjectId {
        self.id
    }
}

impl Entity for Customer {
    const TABLE: &'static str = "customers";

    fn id(&self) -> ObjectId {
        self.id
    }
}

impl Entity for Order {
    const TABLE: &'static str = "orders";
    const PARENT_INDEX: Option<&'static str> = Some("orders_by_customer");

    fn id(&self) -> ObjectId {
        self.id
    }

    fn parent(&self) -> Option<(ObjectId, f64)> {
        Some((self.customer_id, self.total))
    }
}

impl Entity for User {
    const TABLE: &'static str = "users";

    fn id(&self) -> ObjectId {
        self.id
    }
}

/// Kinds registered at startup, in registration order
///
/// On a fresh database products get type id 1 and articles type id 2.
pub const CATALOG_KINDS: [&str; 6] = [
    Product::KIND,
    Article::KIND,
    Collection::KIND,
    Customer::KIND,
    Order::KIND,
    User::KIND,
];

/// Expand a short kind name ("product") to its registry kind
pub fn kind_alias(name: &str) -> &str {
    match name {
        "product" | "products" => Product::KIND,
        "article" | "articles" => Article::KIND,
        "collection" | "collections" => Collection::KIND,
        "customer" | "customers" => Customer::KIND,
        "order" | "orders" => Order::KIND,
        "user" | "users" => User::KIND,
        other => other,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Entity Table
// ─────────────────────────────────────────────────────────────────────────────

fn rows_table<E: Entity>() -> TableDefinition<'static, u64, &'static [u8]> {
    TableDefinition::new(E::TABLE)
}

fn index_table(name: &'static str) -> TableDefinition<'static, (u64, u64), f64> {
    TableDefinition::new(name)
}

/// Typed access to one catalog table
pub struct EntityTable<E> {
    storage: Storage,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> EntityTable<E> {
    /// Open the table, creating it (and its index) if needed
    pub fn open(storage: &Storage) -> Result<Self> {
        storage.create_table(rows_table::<E>())?;
        if let Some(index) = E::PARENT_INDEX {
            storage.create_table(index_table(index))?;
        }

        Ok(Self {
            storage: storage.clone(),
            _entity: PhantomData,
        })
    }

    /// Insert a new row; `build` receives the id assigned to it
    ///
    /// Ids come from a per-table sequence and are never reused after a delete.
    pub fn insert(&self, build: impl FnOnce(ObjectId) -> E) -> Result<E> {
        let write_txn = self.storage.write(QueryKind::Write)?;
        let next = next_id(&write_txn, E::TABLE)?;
        let entity = {
            let mut rows = write_txn.open_table(rows_table::<E>()).map_err(db_err)?;
            let entity = build(next);
            let bytes = serde_json::to_vec(&entity)?;
            rows.insert(entity.id(), bytes.as_slice()).map_err(db_err)?;
            entity
        };

        if let (Some(index), Some((parent, value))) = (E::PARENT_INDEX, entity.parent()) {
            let mut index = write_txn.open_table(index_table(index)).map_err(db_err)?;
            index.insert((parent, entity.id()), value).map_err(db_err)?;
        }
        write_txn.commit().map_err(db_err)?;

        tracing::debug!("Inserted {} {}", E::KIND, entity.id());
        Ok(entity)
    }

    /// Read one row
    pub fn get(&self, id: ObjectId) -> Result<Option<E>> {
        let read_txn = self.storage.read(QueryKind::EntityRead)?;
        let rows = read_txn.open_table(rows_table::<E>()).map_err(db_err)?;

        match rows.get(id).map_err(db_err)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Rows in id order, skipping `offset` and returning at most `limit`
    pub fn page(&self, offset: usize, limit: usize) -> Result<Vec<E>> {
        let read_txn = self.storage.read(QueryKind::EntityRead)?;
        let rows = read_txn.open_table(rows_table::<E>()).map_err(db_err)?;

        let mut page = Vec::with_capacity(limit);
        for entry in rows.iter().map_err(db_err)?.skip(offset).take(limit) {
            let (_, value) = entry.map_err(db_err)?;
            page.push(serde_json::from_slice(value.value())?);
        }
        Ok(page)
    }

    /// Number of rows
    pub fn len(&self) -> Result<u64> {
        let read_txn = self.storage.read(QueryKind::EntityRead)?;
        let rows = read_txn.open_table(rows_table::<E>()).map_err(db_err)?;
        rows.len().map_err(db_err)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove a row and its index entry inside a write transaction
    fn remove_in(&self, txn: &WriteTransaction, id: ObjectId) -> Result<bool> {
        let removed: Option<E> = {
            let mut rows = txn.open_table(rows_table::<E>()).map_err(db_err)?;
            let guard = rows.remove(id).map_err(db_err)?;
            match guard {
                Some(bytes) => Some(serde_json::from_slice(bytes.value())?),
                None => None,
            }
        };
        let Some(entity) = removed else {
            return Ok(false);
        };

        if let (Some(index), Some((parent, _))) = (E::PARENT_INDEX, entity.parent()) {
            let mut index = txn.open_table(index_table(index)).map_err(db_err)?;
            index.remove((parent, id)).map_err(db_err)?;
        }
        Ok(true)
    }

    fn live_in(txn: &ReadTransaction, ids: &BTreeSet<ObjectId>) -> Result<HashSet<ObjectId>> {
        let rows = txn.open_table(rows_table::<E>()).map_err(db_err)?;

        let mut live = HashSet::with_capacity(ids.len());
        for id in ids {
            if rows.get(*id).map_err(db_err)?.is_some() {
                live.insert(*id);
            }
        }
        Ok(live)
    }

    /// Number of rows pointing at `parent` as seen by a write transaction
    fn children_in(&self, txn: &WriteTransaction, parent: ObjectId) -> Result<usize> {
        let Some(index) = E::PARENT_INDEX else {
            return Ok(0);
        };
        let index = txn.open_table(index_table(index)).map_err(db_err)?;
        let mut count = 0;
        for entry in index.range((parent, 0)..=(parent, u64::MAX)).map_err(db_err)? {
            entry.map_err(db_err)?;
            count += 1;
        }
        Ok(count)
    }
}

impl<E: Entity> OwnerTable for EntityTable<E> {
    fn live_ids(&self, ids: &BTreeSet<ObjectId>) -> Result<HashSet<ObjectId>> {
        let read_txn = self.storage.read(QueryKind::OwnerProbe)?;
        Self::live_in(&read_txn, ids)
    }

    fn live_ids_in(&self, txn: &ReadTransaction, ids: &BTreeSet<ObjectId>) -> Result<HashSet<ObjectId>> {
        Self::live_in(txn, ids)
    }

    fn delete(&self, id: ObjectId) -> Result<bool> {
        let write_txn = self.storage.write(QueryKind::Write)?;
        let removed = self.remove_in(&write_txn, id)?;
        write_txn.commit().map_err(db_err)?;
        Ok(removed)
    }

    fn transactional(&self) -> bool {
        true
    }

    fn delete_in(&self, txn: &WriteTransaction, id: ObjectId) -> Result<bool> {
        self.remove_in(txn, id)
    }
}

/// Foreign-key dependents: rows of `E` grouped by their parent id
impl<E: Entity> DependentSource for EntityTable<E> {
    fn scan(
        &self,
        _owner_type: TypeId,
        owners: &BTreeSet<ObjectId>,
        sink: &mut dyn FnMut(ObjectId, f64),
    ) -> Result<()> {
        let Some(index) = E::PARENT_INDEX else {
            return Ok(());
        };
        if owners.is_empty() {
            return Ok(());
        }

        let read_txn = self.storage.read(QueryKind::AggregateScan)?;
        let index = read_txn.open_table(index_table(index)).map_err(db_err)?;
        let mut visited = 0;
        for parent in owners {
            for entry in index.range((*parent, 0)..=(*parent, u64::MAX)).map_err(db_err)? {
                let (_, value) = entry.map_err(db_err)?;
                visited += 1;
                sink(*parent, value.value());
            }
        }
        self.storage.log().record_rows(visited);
        Ok(())
    }
}

/// Users resolve actor payloads
impl PayloadLoader for EntityTable<User> {
    fn kind(&self) -> PayloadKind {
        PayloadKind::Actor
    }

    fn load_many(&self, ids: &BTreeSet<u64>) -> Result<HashMap<u64, PayloadEntity>> {
        let read_txn = self.storage.read(QueryKind::PayloadLookup)?;
        self.load_in(&read_txn, ids)
    }

    fn transactional(&self) -> bool {
        true
    }

    fn load_in(&self, txn: &ReadTransaction, ids: &BTreeSet<u64>) -> Result<HashMap<u64, PayloadEntity>> {
        let rows = txn.open_table(rows_table::<User>()).map_err(db_err)?;

        let mut found = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(guard) = rows.get(*id).map_err(db_err)? {
                let user: User = serde_json::from_slice(guard.value())?;
                let actor = Actor {
                    id: user.id,
                    name: user.username,
                };
                found.insert(*id, PayloadEntity::Actor(actor));
            }
        }
        Ok(found)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Delete Protection
// ─────────────────────────────────────────────────────────────────────────────

/// Cascade hook refusing to delete a parent that still has children of `E`
///
/// Registered ahead of any hook that removes rows, so a refused deletion
/// leaves everything in place.
pub struct ProtectedBy<E> {
    children: Arc<EntityTable<E>>,
}

impl<E: Entity> ProtectedBy<E> {
    pub fn new(children: Arc<EntityTable<E>>) -> Self {
        Self { children }
    }

    fn check(&self, owner: GenericReference, dependents: usize) -> Result<usize> {
        if dependents > 0 {
            tracing::warn!("Refusing to delete {}: {} {} depend on it", owner, dependents, E::TABLE);
            return Err(AssocError::Protected {
                reference: owner,
                dependents,
            });
        }
        Ok(0)
    }
}

impl<E: Entity> CascadeHook for ProtectedBy<E> {
    fn name(&self) -> &str {
        E::TABLE
    }

    fn cascade_in(&self, txn: &WriteTransaction, owner: GenericReference) -> Result<usize> {
        let dependents = self.children.children_in(txn, owner.object_id)?;
        self.check(owner, dependents)
    }

    fn cascade(&self, owner: GenericReference) -> Result<usize> {
        let owners = BTreeSet::from([owner.object_id]);
        let mut dependents = 0;
        self.children.scan(owner.type_id, &owners, &mut |_: ObjectId, _: f64| dependents += 1)?;
        self.check(owner, dependents)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Catalog
// ─────────────────────────────────────────────────────────────────────────────

/// All catalog and payload tables
pub struct Catalog {
    pub collections: Arc<EntityTable<Collection>>,
    pub products: Arc<EntityTable<Product>>,
    pub articles: Arc<EntityTable<Article>>,
    pub customers: Arc<EntityTable<Customer>>,
    pub orders: Arc<EntityTable<Order>>,
    pub users: Arc<EntityTable<User>>,
    pub tags: Arc<TagTable>,
}

impl Catalog {
    pub fn open(storage: &Storage) -> Result<Self> {
        Ok(Self {
            collections: Arc::new(EntityTable::open(storage)?),
            products: Arc::new(EntityTable::open(storage)?),
            articles: Arc::new(EntityTable::open(storage)?),
            customers: Arc::new(EntityTable::open(storage)?),
            orders: Arc::new(EntityTable::open(storage)?),
            users: Arc::new(EntityTable::open(storage)?),
            tags: Arc::new(TagTable::open(storage)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(collection_id: ObjectId, unit_price: f64) -> impl FnOnce(ObjectId) -> Product {
        move |id| Product {
            id,
            title: format!("Product {}", id),
            unit_price,
            inventory: 10,
            collection_id,
        }
    }

    #[test]
    fn test_insert_assigns_sequential_ids() {
        let storage = Storage::in_memory().unwrap();
        let collections = EntityTable::<Collection>::open(&storage).unwrap();

        let first = collections
            .insert(|id| Collection { id, title: "Beauty".into() })
            .unwrap();
        let second = collections
            .insert(|id| Collection { id, title: "Baking".into() })
            .unwrap();

        assert_eq!((first.id, second.id), (1, 2));
        assert_eq!(collections.get(2).unwrap(), Some(second));
        assert_eq!(collections.len().unwrap(), 2);
        assert!(collections.get(3).unwrap().is_none());
    }

    #[test]
    fn test_deleted_ids_are_not_reused() {
        let storage = Storage::in_memory().unwrap();
        let users = EntityTable::<User>::open(&storage).unwrap();
        let user = |name: &'static str| {
            move |id| User {
                id,
                username: name.into(),
                email: format!("{}@example.com", name),
            }
        };

        users.insert(user("ann")).unwrap();
        let bob = users.insert(user("bob")).unwrap();
        assert!(users.delete(bob.id).unwrap());
        let carl = users.insert(user("carl")).unwrap();

        assert_eq!(bob.id, 2);
        assert_eq!(carl.id, 3);
        assert!(users.get(bob.id).unwrap().is_none());
    }

    #[test]
    fn test_sparse_parent_page_visits_only_its_children() {
        let storage = Storage::in_memory().unwrap();
        let products = EntityTable::<Product>::open(&storage).unwrap();
        for parent in 1..=50 {
            products.insert(product(parent, 1.0)).unwrap();
        }
        products.insert(product(9_000, 4.0)).unwrap();

        storage.log().reset();
        let mut seen = Vec::new();
        products
            .scan(TypeId(1), &BTreeSet::from([1, 9_000]), &mut |owner: ObjectId, value: f64| {
                seen.push((owner, value))
            })
            .unwrap();

        assert_eq!(seen, vec![(1, 1.0), (9_000, 4.0)]);
        assert_eq!(storage.log().rows_visited(), 2);
    }

    #[test]
    fn test_page_is_in_id_order() {
        let storage = Storage::in_memory().unwrap();
        let products = EntityTable::<Product>::open(&storage).unwrap();
        for _ in 0..5 {
            products.insert(product(1, 2.0)).unwrap();
        }

        let page: Vec<_> = products.page(1, 3).unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(page, vec![2, 3, 4]);
        assert!(products.page(10, 3).unwrap().is_empty());
    }

    #[test]
    fn test_foreign_key_scan_is_restricted_to_owners() {
        let storage = Storage::in_memory().unwrap();
        let products = EntityTable::<Product>::open(&storage).unwrap();
        products.insert(product(1, 2.0)).unwrap();
        products.insert(product(1, 3.0)).unwrap();
        products.insert(product(2, 5.0)).unwrap();
        products.insert(product(3, 7.0)).unwrap();

        storage.log().reset();
        let mut seen = Vec::new();
        products
            .scan(TypeId(1), &BTreeSet::from([1, 3]), &mut |owner: ObjectId, value: f64| {
                seen.push((owner, value))
            })
            .unwrap();

        seen.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(seen, vec![(1, 2.0), (1, 3.0), (3, 7.0)]);
        assert_eq!(storage.log().count(QueryKind::AggregateScan), 1);
    }

    #[test]
    fn test_delete_removes_index_entry() {
        let storage = Storage::in_memory().unwrap();
        let orders = EntityTable::<Order>::open(&storage).unwrap();
        let order = orders
            .insert(|id| Order {
                id,
                customer_id: 4,
                placed_at: Utc::now(),
                payment_status: PaymentStatus::Complete,
                total: 12.5,
            })
            .unwrap();

        assert!(orders.delete(order.id).unwrap());
        assert!(!orders.delete(order.id).unwrap());

        let mut count = 0;
        orders
            .scan(TypeId(1), &BTreeSet::from([4]), &mut |_: ObjectId, _: f64| count += 1)
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_users_load_as_actors() {
        let storage = Storage::in_memory().unwrap();
        let users = EntityTable::<User>::open(&storage).unwrap();
        users
            .insert(|id| User {
                id,
                username: "ann".into(),
                email: "ann@example.com".into(),
            })
            .unwrap();

        let loaded = users.load_many(&BTreeSet::from([1, 2])).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[&1].label(), "ann");
        assert_eq!(users.kind(), PayloadKind::Actor);
    }

    #[test]
    fn test_live_ids_reports_existing_rows() {
        let storage = Storage::in_memory().unwrap();
        let articles = EntityTable::<Article>::open(&storage).unwrap();
        articles
            .insert(|id| Article { id, title: "Hello".into() })
            .unwrap();

        let live = articles.live_ids(&BTreeSet::from([1, 2])).unwrap();
        assert_eq!(live, HashSet::from([1]));
        assert_eq!(storage.log().count(QueryKind::OwnerProbe), 1);
    }

    #[test]
    fn test_kind_alias() {
        assert_eq!(kind_alias("product"), "store.product");
        assert_eq!(kind_alias("blog.article"), "blog.article");
    }
}
