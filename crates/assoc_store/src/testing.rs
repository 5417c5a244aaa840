// Shared fixtures for unit tests

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use assoc_types::{Actor, ObjectId, PayloadEntity, PayloadKind, Result, Tag, TypeId};
use parking_lot::RwLock;

use crate::query_log::QueryKind;
use crate::resolve::{OwnerTable, PayloadLoader};
use crate::storage::Storage;
use crate::store::AssociationStore;
use crate::types_table::bootstrap_registry;

pub struct Fixture {
    pub storage: Storage,
    pub store: AssociationStore,
    pub product: TypeId,
    pub article: TypeId,
}

pub fn fixture() -> Fixture {
    let storage = Storage::in_memory().unwrap();
    let registry = bootstrap_registry(&storage, ["store.product", "blog.article"])
        .unwrap()
        .into_shared();
    let product = registry.id_of("store.product").unwrap();
    let article = registry.id_of("blog.article").unwrap();
    let store = AssociationStore::new(storage.clone(), registry).unwrap();
    Fixture {
        storage,
        store,
        product,
        article,
    }
}

/// Payload loader over an in-memory map, counted as payload lookups
pub struct MemoryPayloads {
    kind: PayloadKind,
    storage: Storage,
    entities: HashMap<u64, PayloadEntity>,
}

impl MemoryPayloads {
    pub fn tags(storage: &Storage, labels: &[(u64, &str)]) -> Self {
        Self {
            kind: PayloadKind::Tag,
            storage: storage.clone(),
            entities: labels
                .iter()
                .map(|(id, label)| {
                    let tag = Tag {
                        id: *id,
                        label: label.to_string(),
                    };
                    (*id, PayloadEntity::Tag(tag))
                })
                .collect(),
        }
    }

    pub fn actors(storage: &Storage, names: &[(u64, &str)]) -> Self {
        Self {
            kind: PayloadKind::Actor,
            storage: storage.clone(),
            entities: names
                .iter()
                .map(|(id, name)| {
                    let actor = Actor {
                        id: *id,
                        name: name.to_string(),
                    };
                    (*id, PayloadEntity::Actor(actor))
                })
                .collect(),
        }
    }
}

impl PayloadLoader for MemoryPayloads {
    fn kind(&self) -> PayloadKind {
        self.kind
    }

    fn load_many(&self, ids: &BTreeSet<u64>) -> Result<HashMap<u64, PayloadEntity>> {
        self.storage.log().record(QueryKind::PayloadLookup);
        Ok(ids
            .iter()
            .filter_map(|id| self.entities.get(id).map(|e| (*id, e.clone())))
            .collect())
    }
}

/// Owner table over an in-memory id set
#[derive(Default)]
pub struct MemoryOwners {
    live: RwLock<HashSet<ObjectId>>,
}

impl MemoryOwners {
    pub fn with(ids: impl IntoIterator<Item = ObjectId>) -> Arc<Self> {
        Arc::new(Self {
            live: RwLock::new(ids.into_iter().collect()),
        })
    }

    pub fn remove(&self, id: ObjectId) -> bool {
        self.live.write().remove(&id)
    }
}

impl OwnerTable for MemoryOwners {
    fn live_ids(&self, ids: &BTreeSet<ObjectId>) -> Result<HashSet<ObjectId>> {
        let live = self.live.read();
        Ok(ids.iter().copied().filter(|id| live.contains(id)).collect())
    }

    fn delete(&self, id: ObjectId) -> Result<bool> {
        Ok(self.remove(id))
    }
}
