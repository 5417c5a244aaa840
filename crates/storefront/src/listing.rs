//! Listing Facade - the admin backend's entry point into the association core
//!
//! Owns the wiring done once at startup: the frozen type registry, the
//! association store, the resolution dispatch tables, the aggregation engines
//! and the cascade hook lists. Admin listing pages are built here with a
//! fixed number of queries per page, whatever the page size.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use assoc_store::{
    freeze, open_builder, Aggregate, AggregationEngine, AssociationDependents, AssociationQuery,
    AssociationStore, CascadeCoordinator, OwnerDeletion, OwnerTable, PayloadCascade,
    ResolutionManager, Storage,
};
use assoc_types::{
    AssocError, AssociationId, ObjectId, GenericReference, PayloadEntity, PayloadKind, PayloadRef,
    TypeId, TypeRegistry, TypeRegistryBuilder,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::catalog::{
    kind_alias, Article, Catalog, Collection, Customer, Order, Product, ProtectedBy, User,
    CATALOG_KINDS,
};
use crate::config::ListingConfig;
use crate::error::{Result, StorefrontError};

/// Type ids of the catalog kinds
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CatalogTypes {
    pub product: TypeId,
    pub article: TypeId,
    pub collection: TypeId,
    pub customer: TypeId,
    pub order: TypeId,
    pub user: TypeId,
}

impl CatalogTypes {
    fn resolve(registry: &TypeRegistry) -> Result<Self> {
        Ok(Self {
            product: registry.id_for::<Product>()?,
            article: registry.id_for::<Article>()?,
            collection: registry.id_for::<Collection>()?,
            customer: registry.id_for::<Customer>()?,
            order: registry.id_for::<Order>()?,
            user: registry.id_for::<User>()?,
        })
    }
}

/// Result of tagging or liking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "association_id", rename_all = "snake_case")]
pub enum TagOutcome {
    Created(AssociationId),
    /// The same payload was already attached; nothing changed
    AlreadyPresent(AssociationId),
}

impl TagOutcome {
    pub fn association_id(&self) -> AssociationId {
        match self {
            TagOutcome::Created(id) | TagOutcome::AlreadyPresent(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, TagOutcome::Created(_))
    }
}

/// Product listing row
#[derive(Debug, Clone, Serialize)]
pub struct ProductRow {
    #[serde(flatten)]
    pub product: Product,
    pub tags: Vec<String>,
    pub likes: u64,
}

/// Collection listing row
#[derive(Debug, Clone, Serialize)]
pub struct CollectionRow {
    #[serde(flatten)]
    pub collection: Collection,
    pub products_count: u64,
    pub average_price: f64,
}

/// Customer listing row
#[derive(Debug, Clone, Serialize)]
pub struct CustomerRow {
    #[serde(flatten)]
    pub customer: Customer,
    pub orders_count: u64,
    pub orders_total: f64,
}

/// First page of every listing
#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub products: Vec<ProductRow>,
    pub collections: Vec<CollectionRow>,
    pub customers: Vec<CustomerRow>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Startup phase: the only place types can be registered
pub struct ListingBuilder {
    storage: Storage,
    config: ListingConfig,
    types: TypeRegistryBuilder,
}

impl ListingBuilder {
    /// Seed from the persisted type table and register the catalog kinds
    pub fn new(storage: Storage, config: ListingConfig) -> Result<Self> {
        let mut types = open_builder(&storage)?;
        for kind in CATALOG_KINDS {
            types.register(kind);
        }
        Ok(Self {
            storage,
            config,
            types,
        })
    }

    /// Register an entity kind, returning its durable id
    pub fn register_type(&mut self, kind: &str) -> TypeId {
        self.types.register(kind)
    }

    /// Freeze the registry and wire every component
    pub fn build(self) -> Result<Listing> {
        let storage = self.storage;
        let registry = freeze(&storage, self.types)?.into_shared();
        let types = CatalogTypes::resolve(&registry)?;
        let catalog = Catalog::open(&storage)?;
        let store = Arc::new(AssociationStore::new(storage.clone(), registry.clone())?);

        let owner_tables: [(TypeId, Arc<dyn OwnerTable>); 6] = [
            (types.product, catalog.products.clone()),
            (types.article, catalog.articles.clone()),
            (types.collection, catalog.collections.clone()),
            (types.customer, catalog.customers.clone()),
            (types.order, catalog.orders.clone()),
            (types.user, catalog.users.clone()),
        ];

        let mut resolver = ResolutionManager::builder(store.clone())
            .payload_loader(catalog.tags.clone())
            .payload_loader(catalog.users.clone());
        // Parents refuse deletion while children point at them; these run
        // before the association hook so a refusal removes nothing
        let mut cascade = CascadeCoordinator::builder(storage.clone(), registry.clone())
            .hook(
                types.collection,
                Arc::new(ProtectedBy::new(catalog.products.clone())),
            )
            .hook(
                types.customer,
                Arc::new(ProtectedBy::new(catalog.orders.clone())),
            )
            // A deleted user takes its likes along, wherever they point
            .hook(
                types.user,
                Arc::new(PayloadCascade::new(store.clone(), PayloadKind::Actor)),
            )
            .hook_all(store.clone());
        for (type_id, table) in owner_tables {
            resolver = resolver.owner_table(type_id, table.clone());
            cascade = cascade.owner_table(type_id, table);
        }

        let max_batch = self.config.max_aggregate_batch;
        let engine = |source: Arc<dyn assoc_store::DependentSource>| {
            AggregationEngine::new(registry.clone(), source).with_max_batch(max_batch)
        };
        let associations = engine(Arc::new(AssociationDependents::all(store.clone())));
        let likes = engine(Arc::new(AssociationDependents::of_kind(
            store.clone(),
            PayloadKind::Actor,
        )));
        let products_by_collection = engine(catalog.products.clone());
        let orders_by_customer = engine(catalog.orders.clone());

        info!(
            "Listing ready: {} kinds, page size {}",
            registry.len(),
            self.config.page_size
        );

        Ok(Listing {
            storage,
            config: self.config,
            registry,
            types,
            catalog,
            store,
            resolver: resolver.build(),
            cascade: cascade.build(),
            associations,
            likes,
            products_by_collection,
            orders_by_customer,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Listing
// ─────────────────────────────────────────────────────────────────────────────

/// The facade used by the admin listings
pub struct Listing {
    storage: Storage,
    config: ListingConfig,
    registry: Arc<TypeRegistry>,
    types: CatalogTypes,
    catalog: Catalog,
    store: Arc<AssociationStore>,
    resolver: ResolutionManager,
    cascade: CascadeCoordinator,
    associations: AggregationEngine,
    likes: AggregationEngine,
    products_by_collection: AggregationEngine,
    orders_by_customer: AggregationEngine,
}

impl Listing {
    /// Open with only the catalog kinds registered
    pub fn open(storage: Storage, config: ListingConfig) -> Result<Self> {
        ListingBuilder::new(storage, config)?.build()
    }

    pub fn builder(storage: Storage, config: ListingConfig) -> Result<ListingBuilder> {
        ListingBuilder::new(storage, config)
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn config(&self) -> &ListingConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn types(&self) -> &CatalogTypes {
        &self.types
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Id of a kind, accepting short names like "product"
    pub fn type_id(&self, kind: &str) -> Result<TypeId> {
        Ok(self.registry.id_of(kind_alias(kind))?)
    }

    /// Reference to an object of a kind given by name
    pub fn reference(&self, kind: &str, object_id: ObjectId) -> Result<GenericReference> {
        Ok(GenericReference::new(self.type_id(kind)?, object_id))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Core operations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn create_association(
        &self,
        owner_type: TypeId,
        owner_id: ObjectId,
        payload: PayloadRef,
    ) -> Result<AssociationId> {
        Ok(self
            .store
            .create(GenericReference::new(owner_type, owner_id), payload)?)
    }

    /// Returns whether an association was removed
    pub fn remove_association(&self, id: AssociationId) -> Result<bool> {
        Ok(self.store.delete(id)?)
    }

    pub fn get_payloads_for(&self, owner_type: TypeId, owner_id: ObjectId) -> Result<Vec<PayloadRef>> {
        Ok(self.resolver.get_for_one(owner_type, owner_id)?)
    }

    pub fn get_payloads_batch(
        &self,
        owners: &[(TypeId, ObjectId)],
    ) -> Result<HashMap<GenericReference, Vec<PayloadEntity>>> {
        let references: Vec<_> = owners.iter().map(|pair| GenericReference::from(*pair)).collect();
        Ok(self.resolver.get_for_batch(&references)?)
    }

    pub fn get_aggregate_counts(
        &self,
        owner_type: TypeId,
        owner_ids: &[ObjectId],
    ) -> Result<HashMap<ObjectId, u64>> {
        Ok(self.associations.counts_for(owner_type, owner_ids)?)
    }

    /// Delete an owner and its associations
    pub fn delete_owner(&self, owner: GenericReference) -> Result<OwnerDeletion> {
        Ok(self.cascade.delete_owner(owner)?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tagging and likes
    // ─────────────────────────────────────────────────────────────────────────

    /// Attach a tag by label, creating the tag if it is new
    pub fn tag(&self, owner: GenericReference, label: &str) -> Result<TagOutcome> {
        self.ensure_owner(owner)?;
        let tag = self.catalog.tags.find_or_create(label)?;
        self.attach(owner, PayloadRef::Tag(tag.id))
    }

    /// Remove a tag by label; returns whether it was attached
    pub fn untag(&self, owner: GenericReference, label: &str) -> Result<bool> {
        let Some(tag) = self.catalog.tags.find(label)? else {
            return Ok(false);
        };

        let rows = AssociationQuery::for_type(owner.type_id)
            .owner(owner.object_id)
            .payload(PayloadRef::Tag(tag.id))
            .fetch(&self.store)?;

        let mut removed = false;
        for row in rows {
            removed |= self.store.delete(row.id)?;
        }
        Ok(removed)
    }

    /// Record that a user likes an object
    pub fn like(&self, owner: GenericReference, user_id: ObjectId) -> Result<TagOutcome> {
        self.ensure_owner(owner)?;
        if self.catalog.users.get(user_id)?.is_none() {
            return Err(StorefrontError::NotFound(format!("user {}", user_id)));
        }
        self.attach(owner, PayloadRef::Actor(user_id))
    }

    /// Resolved payloads of one object
    pub fn show(&self, owner: GenericReference) -> Result<Vec<PayloadEntity>> {
        let mut batch = self.resolver.get_for_batch(&[owner])?;
        Ok(batch.remove(&owner).unwrap_or_default())
    }

    fn attach(&self, owner: GenericReference, payload: PayloadRef) -> Result<TagOutcome> {
        match self.store.create(owner, payload) {
            Ok(id) => Ok(TagOutcome::Created(id)),
            Err(AssocError::DuplicateAssociation { existing, .. }) => {
                debug!("{} already has {}", owner, payload);
                Ok(TagOutcome::AlreadyPresent(existing))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn ensure_owner(&self, owner: GenericReference) -> Result<()> {
        self.registry.check(&owner)?;
        let Some(table) = self.resolver.owner_table(owner.type_id) else {
            return Ok(());
        };
        let live = table.live_ids(&BTreeSet::from([owner.object_id]))?;
        if live.is_empty() {
            return Err(StorefrontError::NotFound(owner.to_string()));
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Listing pages
    // ─────────────────────────────────────────────────────────────────────────

    fn offset(&self, page: usize) -> usize {
        page.saturating_mul(self.config.page_size)
    }

    /// Products with their tags and like counts
    pub fn product_page(&self, page: usize) -> Result<Vec<ProductRow>> {
        let products = self
            .catalog
            .products
            .page(self.offset(page), self.config.page_size)?;
        if products.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<ObjectId> = products.iter().map(|p| p.id).collect();
        let references: Vec<_> = ids
            .iter()
            .map(|id| GenericReference::new(self.types.product, *id))
            .collect();
        let mut payloads = self.resolver.get_for_batch(&references)?;
        let likes = self.likes.counts_for(self.types.product, &ids)?;

        Ok(products
            .into_iter()
            .map(|product| {
                let reference = GenericReference::new(self.types.product, product.id);
                let tags = payloads
                    .remove(&reference)
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|entity| match entity {
                        PayloadEntity::Tag(tag) => Some(tag.label),
                        PayloadEntity::Actor(_) => None,
                    })
                    .collect();
                ProductRow {
                    likes: likes.get(&product.id).copied().unwrap_or(0),
                    tags,
                    product,
                }
            })
            .collect())
    }

    /// Collections with product counts and average unit price
    pub fn collection_page(&self, page: usize) -> Result<Vec<CollectionRow>> {
        let collections = self
            .catalog
            .collections
            .page(self.offset(page), self.config.page_size)?;
        if collections.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<ObjectId> = collections.iter().map(|c| c.id).collect();
        let counts = self
            .products_by_collection
            .counts_for(self.types.collection, &ids)?;
        let prices =
            self.products_by_collection
                .aggregate_for(self.types.collection, &ids, Aggregate::Avg)?;

        Ok(collections
            .into_iter()
            .map(|collection| CollectionRow {
                products_count: counts.get(&collection.id).copied().unwrap_or(0),
                average_price: prices.get(&collection.id).copied().unwrap_or(0.0),
                collection,
            })
            .collect())
    }

    /// Customers with order counts and order totals
    pub fn customer_page(&self, page: usize) -> Result<Vec<CustomerRow>> {
        let customers = self
            .catalog
            .customers
            .page(self.offset(page), self.config.page_size)?;
        if customers.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<ObjectId> = customers.iter().map(|c| c.id).collect();
        let counts = self.orders_by_customer.counts_for(self.types.customer, &ids)?;
        let totals =
            self.orders_by_customer
                .aggregate_for(self.types.customer, &ids, Aggregate::Sum)?;

        Ok(customers
            .into_iter()
            .map(|customer| CustomerRow {
                orders_count: counts.get(&customer.id).copied().unwrap_or(0),
                orders_total: totals.get(&customer.id).copied().unwrap_or(0.0),
                customer,
            })
            .collect())
    }

    /// First page of every listing, built concurrently on blocking tasks
    pub async fn dashboard(self: Arc<Self>) -> Result<Dashboard> {
        let products = tokio::task::spawn_blocking({
            let listing = self.clone();
            move || listing.product_page(0)
        });
        let collections = tokio::task::spawn_blocking({
            let listing = self.clone();
            move || listing.collection_page(0)
        });
        let customers = tokio::task::spawn_blocking({
            let listing = self.clone();
            move || listing.customer_page(0)
        });

        let (products, collections, customers) = tokio::join!(products, collections, customers);
        Ok(Dashboard {
            products: products??,
            collections: collections??,
            customers: customers??,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assoc_store::QueryKind;
    use chrono::Utc;
    use tempfile::tempdir;

    use crate::catalog::PaymentStatus;

    fn config() -> ListingConfig {
        ListingConfig {
            page_size: 25,
            max_aggregate_batch: 100,
        }
    }

    fn listing() -> Listing {
        Listing::open(Storage::in_memory().unwrap(), config()).unwrap()
    }

    fn add_products(listing: &Listing, count: usize) -> Vec<ObjectId> {
        let collection = listing
            .catalog()
            .collections
            .insert(|id| Collection {
                id,
                title: "Beauty".into(),
            })
            .unwrap();
        (0..count)
            .map(|n| {
                listing
                    .catalog()
                    .products
                    .insert(|id| Product {
                        id,
                        title: format!("Product {}", n),
                        unit_price: 10.0,
                        inventory: 5,
                        collection_id: collection.id,
                    })
                    .unwrap()
                    .id
            })
            .collect()
    }

    fn add_user(listing: &Listing, name: &str) -> ObjectId {
        listing
            .catalog()
            .users
            .insert(|id| User {
                id,
                username: name.into(),
                email: format!("{}@example.com", name),
            })
            .unwrap()
            .id
    }

    fn add_customer(listing: &Listing, first: &str, order_totals: &[f64]) -> ObjectId {
        let customer = listing
            .catalog()
            .customers
            .insert(|id| Customer {
                id,
                first_name: first.into(),
                last_name: "Doe".into(),
                email: format!("{}@example.com", first),
                membership: Default::default(),
            })
            .unwrap();
        for total in order_totals {
            listing
                .catalog()
                .orders
                .insert(|id| Order {
                    id,
                    customer_id: customer.id,
                    placed_at: Utc::now(),
                    payment_status: PaymentStatus::Complete,
                    total: *total,
                })
                .unwrap();
        }
        customer.id
    }

    #[test]
    fn test_register_type_is_idempotent_across_restarts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shop.redb");

        let first = {
            let mut builder = Listing::builder(Storage::open(&path).unwrap(), config()).unwrap();
            let video = builder.register_type("media.video");
            assert_eq!(builder.register_type("media.video"), video);
            let listing = builder.build().unwrap();
            assert_eq!(listing.types().product, TypeId(1));
            assert_eq!(listing.types().article, TypeId(2));
            video
        };

        let mut builder = Listing::builder(Storage::open(&path).unwrap(), config()).unwrap();
        assert_eq!(builder.register_type("media.video"), first);
    }

    #[test]
    fn test_duplicate_association_is_stored_once() {
        let listing = listing();
        let product = listing.types().product;

        let id = listing
            .create_association(product, 1, PayloadRef::Tag(1))
            .unwrap();
        let err = listing
            .create_association(product, 1, PayloadRef::Tag(1))
            .unwrap_err();

        assert!(matches!(
            err,
            StorefrontError::Assoc(AssocError::DuplicateAssociation { existing, .. }) if existing == id
        ));
        assert_eq!(listing.get_payloads_for(product, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_tag_reports_already_present() {
        let listing = listing();
        let ids = add_products(&listing, 1);
        let owner = listing.reference("product", ids[0]).unwrap();

        let first = listing.tag(owner, "sale").unwrap();
        let second = listing.tag(owner, "sale").unwrap();

        assert!(first.is_created());
        assert_eq!(second, TagOutcome::AlreadyPresent(first.association_id()));
        assert_eq!(listing.get_payloads_for(owner.type_id, owner.object_id).unwrap().len(), 1);
    }

    #[test]
    fn test_tag_and_like_require_live_owner_and_user() {
        let listing = listing();
        let ids = add_products(&listing, 1);
        let owner = listing.reference("product", ids[0]).unwrap();
        let missing = listing.reference("product", 999).unwrap();

        assert!(matches!(
            listing.tag(missing, "sale"),
            Err(StorefrontError::NotFound(_))
        ));
        assert!(matches!(
            listing.like(owner, 42),
            Err(StorefrontError::NotFound(_))
        ));
        assert!(matches!(
            listing.tag(GenericReference::new(TypeId(99), 1), "sale"),
            Err(StorefrontError::Assoc(AssocError::UnknownType(_)))
        ));
    }

    #[test]
    fn test_untag_removes_only_that_tag() {
        let listing = listing();
        let ids = add_products(&listing, 1);
        let owner = listing.reference("product", ids[0]).unwrap();
        listing.tag(owner, "sale").unwrap();
        listing.tag(owner, "new").unwrap();

        assert!(listing.untag(owner, "sale").unwrap());
        assert!(!listing.untag(owner, "sale").unwrap());
        assert!(!listing.untag(owner, "unknown").unwrap());

        let labels: Vec<_> = listing
            .show(owner)
            .unwrap()
            .iter()
            .map(|e| e.label().to_string())
            .collect();
        assert_eq!(labels, vec!["new"]);
    }

    #[test]
    fn test_product_and_article_share_a_tag() {
        let listing = listing();
        let ids = add_products(&listing, 1);
        let article = listing
            .catalog()
            .articles
            .insert(|id| Article {
                id,
                title: "Spring".into(),
            })
            .unwrap();
        let types = *listing.types();
        assert_eq!(types.product, TypeId(1));
        assert_eq!(types.article, TypeId(2));

        listing
            .tag(GenericReference::new(types.product, ids[0]), "sale")
            .unwrap();
        listing
            .tag(GenericReference::new(types.article, article.id), "sale")
            .unwrap();

        let sale = listing.catalog().tags.find("sale").unwrap().unwrap();
        assert_eq!(
            listing.get_payloads_for(types.product, ids[0]).unwrap(),
            vec![PayloadRef::Tag(sale.id)]
        );
        assert_eq!(
            listing.get_payloads_for(types.article, article.id).unwrap(),
            vec![PayloadRef::Tag(sale.id)]
        );

        listing.storage().log().reset();
        let batch = listing
            .get_payloads_batch(&[(types.product, ids[0]), (types.article, article.id)])
            .unwrap();

        for owner in batch.values() {
            let labels: Vec<_> = owner.iter().map(|e| e.label()).collect();
            assert_eq!(labels, vec!["sale"]);
        }
        let log = listing.storage().log();
        assert_eq!(log.count(QueryKind::AssociationScan), 2);
        assert_eq!(log.count(QueryKind::PayloadLookup), 1);
    }

    #[test]
    fn test_batch_queries_bounded_by_type_count() {
        let listing = listing();
        let ids = add_products(&listing, 40);
        let user = add_user(&listing, "ann");
        let types = *listing.types();

        let mut owners = Vec::new();
        for id in &ids {
            let owner = GenericReference::new(types.product, *id);
            listing.tag(owner, &format!("tag-{}", id % 4)).unwrap();
            listing.like(owner, user).unwrap();
            owners.push((types.product, *id));
        }

        listing.storage().log().reset();
        let batch = listing.get_payloads_batch(&owners).unwrap();

        let log = listing.storage().log();
        let distinct_types = 1;
        assert_eq!(batch.len(), 40);
        assert!(batch.values().all(|payloads| payloads.len() == 2));
        assert_eq!(log.count(QueryKind::AssociationScan), 1);
        assert_eq!(log.count(QueryKind::PayloadLookup), 1);
        assert_eq!(log.count(QueryKind::OwnerProbe), 0);
        assert!(log.reads() <= 2 * distinct_types);
    }

    #[test]
    fn test_deleted_user_takes_its_likes_along() {
        let listing = listing();
        let ids = add_products(&listing, 1);
        let product = GenericReference::new(listing.types().product, ids[0]);
        let ann = add_user(&listing, "ann");
        let bob = add_user(&listing, "bob");
        listing.like(product, ann).unwrap();
        listing.like(product, bob).unwrap();

        let outcome = listing
            .delete_owner(GenericReference::new(listing.types().user, bob))
            .unwrap();
        let carl = add_user(&listing, "carl");

        assert!(outcome.owner_existed);
        assert_eq!(outcome.cascaded, 1);
        assert_ne!(carl, bob);
        let names: Vec<_> = listing
            .show(product)
            .unwrap()
            .iter()
            .map(|e| e.label().to_string())
            .collect();
        assert_eq!(names, vec!["ann"]);
        let likes = listing.product_page(0).unwrap();
        assert_eq!(likes[0].likes, 1);
    }

    #[test]
    fn test_blank_tag_is_rejected() {
        let listing = listing();
        let ids = add_products(&listing, 1);
        let owner = listing.reference("product", ids[0]).unwrap();

        assert!(matches!(
            listing.tag(owner, "  "),
            Err(StorefrontError::Assoc(AssocError::InvalidPayload(_)))
        ));
        assert!(listing.show(owner).unwrap().is_empty());
    }

    #[test]
    fn test_aggregate_counts_zero_fill() {
        let listing = listing();
        let product = listing.types().product;
        for tag in 1..=3 {
            listing.create_association(product, 10, PayloadRef::Tag(tag)).unwrap();
        }
        for tag in 1..=5 {
            listing.create_association(product, 12, PayloadRef::Tag(tag)).unwrap();
        }

        let counts = listing.get_aggregate_counts(product, &[10, 11, 12]).unwrap();
        assert_eq!(counts, HashMap::from([(10, 3), (11, 0), (12, 5)]));

        assert!(matches!(
            listing.get_aggregate_counts(product, &[]),
            Err(StorefrontError::Assoc(AssocError::AggregationScope(_)))
        ));
    }

    #[test]
    fn test_delete_owner_empties_payloads() {
        let listing = listing();
        let ids = add_products(&listing, 2);
        let types = *listing.types();
        let owner = GenericReference::new(types.product, ids[0]);
        let other = GenericReference::new(types.product, ids[1]);
        listing.tag(owner, "sale").unwrap();
        listing.tag(owner, "new").unwrap();
        listing.tag(other, "sale").unwrap();

        let outcome = listing.delete_owner(owner).unwrap();

        assert!(outcome.owner_existed);
        assert!(outcome.atomic);
        assert_eq!(outcome.cascaded, 2);
        assert!(listing.get_payloads_for(owner.type_id, owner.object_id).unwrap().is_empty());
        assert_eq!(listing.get_payloads_for(other.type_id, other.object_id).unwrap().len(), 1);
        assert!(listing.catalog().products.get(ids[0]).unwrap().is_none());
    }

    #[test]
    fn test_protected_parent_is_not_deleted() {
        let listing = listing();
        let customer = add_customer(&listing, "jane", &[20.0]);
        let owner = GenericReference::new(listing.types().customer, customer);
        listing.tag(owner, "vip").unwrap();

        let result = listing.delete_owner(owner);

        assert!(matches!(
            result,
            Err(StorefrontError::Assoc(AssocError::Protected { dependents: 1, .. }))
        ));
        assert!(listing.catalog().customers.get(customer).unwrap().is_some());
        assert_eq!(listing.show(owner).unwrap().len(), 1);
    }

    #[test]
    fn test_product_page_query_count_is_independent_of_page_size() {
        let listing = listing();
        let ids = add_products(&listing, 25);
        let user = add_user(&listing, "ann");
        for id in &ids {
            let owner = GenericReference::new(listing.types().product, *id);
            listing.tag(owner, "sale").unwrap();
            if id % 2 == 0 {
                listing.like(owner, user).unwrap();
            }
        }

        listing.storage().log().reset();
        let rows = listing.product_page(0).unwrap();
        let queries = listing.storage().log().reads();

        assert_eq!(rows.len(), 25);
        assert_eq!(rows[0].tags, vec!["sale"]);
        assert_eq!(rows[0].likes, 0);
        assert_eq!(rows[1].likes, 1);
        // page read + scan + shared payload read + like counts
        assert_eq!(queries, 4);
        assert!(listing.product_page(1).unwrap().is_empty());
    }

    #[test]
    fn test_collection_and_customer_pages() {
        let listing = listing();
        add_products(&listing, 3);
        listing
            .catalog()
            .collections
            .insert(|id| Collection {
                id,
                title: "Empty".into(),
            })
            .unwrap();
        add_customer(&listing, "jane", &[20.0, 30.5]);
        add_customer(&listing, "john", &[]);

        let collections = listing.collection_page(0).unwrap();
        assert_eq!(collections[0].products_count, 3);
        assert_eq!(collections[0].average_price, 10.0);
        assert_eq!(collections[1].products_count, 0);
        assert_eq!(collections[1].average_price, 0.0);

        let customers = listing.customer_page(0).unwrap();
        assert_eq!(customers[0].orders_count, 2);
        assert_eq!(customers[0].orders_total, 50.5);
        assert_eq!(customers[1].orders_count, 0);
        assert_eq!(customers[1].orders_total, 0.0);
    }

    #[tokio::test]
    async fn test_dashboard_builds_every_listing() {
        let listing = listing();
        add_products(&listing, 2);
        add_customer(&listing, "jane", &[5.0]);

        let dashboard = Arc::new(listing).dashboard().await.unwrap();

        assert_eq!(dashboard.products.len(), 2);
        assert_eq!(dashboard.collections.len(), 1);
        assert_eq!(dashboard.customers[0].orders_total, 5.0);
    }
}
