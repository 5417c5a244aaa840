//! Type Registry for entity kinds
//!
//! Maps entity kinds ("store.product", "blog.article", ...) to durable numeric
//! ids. Registration happens once at startup through a `TypeRegistryBuilder`,
//! which is then frozen into an immutable `TypeRegistry` and shared by `Arc`.
//! Ids are append-only: a kind keeps its id across restarts as long as the
//! persisted descriptors are fed back into the builder.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{AssocError, ContentType, GenericReference, Result, TypeDescriptor, TypeId};

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Mutable registration phase of the registry
#[derive(Debug, Default)]
pub struct TypeRegistryBuilder {
    by_name: HashMap<String, TypeId>,
    by_id: BTreeMap<TypeId, TypeDescriptor>,
    /// Descriptors appended since the builder was seeded
    pending: Vec<TypeDescriptor>,
}

impl TypeRegistryBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the builder from previously persisted descriptors
    ///
    /// Fails if two descriptors share an id or a name, since that would mean
    /// an id was reused.
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = TypeDescriptor>) -> Result<Self> {
        let mut builder = Self::new();
        for desc in descriptors {
            if builder.by_id.contains_key(&desc.id) {
                return Err(AssocError::Registry(format!(
                    "type id {} assigned twice",
                    desc.id.0
                )));
            }
            if builder.by_name.contains_key(&desc.name) {
                return Err(AssocError::Registry(format!(
                    "kind '{}' assigned twice",
                    desc.name
                )));
            }
            builder.by_name.insert(desc.name.clone(), desc.id);
            builder.by_id.insert(desc.id, desc);
        }
        Ok(builder)
    }

    /// Register a kind, returning its id
    ///
    /// Idempotent: a known kind returns its existing id. A new kind gets the
    /// next id after the highest ever issued.
    pub fn register(&mut self, kind: &str) -> TypeId {
        if let Some(id) = self.by_name.get(kind) {
            return *id;
        }

        let next = self.by_id.keys().next_back().map_or(1, |id| id.0 + 1);
        let desc = TypeDescriptor::new(TypeId(next), kind);
        self.by_name.insert(kind.to_string(), desc.id);
        self.by_id.insert(desc.id, desc.clone());
        self.pending.push(desc.clone());
        desc.id
    }

    /// Register the kind named by a Rust type
    pub fn register_type<T: ContentType>(&mut self) -> TypeId {
        self.register(T::KIND)
    }

    /// Descriptors appended since seeding (to be persisted)
    pub fn pending(&self) -> &[TypeDescriptor] {
        &self.pending
    }

    /// Freeze into an immutable registry
    pub fn build(self) -> TypeRegistry {
        TypeRegistry {
            by_name: self.by_name,
            by_id: self.by_id,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Immutable kind ↔ id mapping
///
/// Safe for unsynchronized concurrent reads; there is no mutation after
/// `TypeRegistryBuilder::build`.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    by_name: HashMap<String, TypeId>,
    by_id: BTreeMap<TypeId, TypeDescriptor>,
}

impl TypeRegistry {
    /// Wrap in an Arc for injection into the store and managers
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Resolve an id to its descriptor
    pub fn resolve(&self, id: TypeId) -> Result<&TypeDescriptor> {
        self.by_id.get(&id).ok_or(AssocError::UnknownType(id))
    }

    /// Look up the id of a kind name
    pub fn id_of(&self, kind: &str) -> Result<TypeId> {
        self.by_name
            .get(kind)
            .copied()
            .ok_or_else(|| AssocError::UnknownKind(kind.to_string()))
    }

    /// Look up the id of the kind named by a Rust type
    pub fn id_for<T: ContentType>(&self) -> Result<TypeId> {
        self.id_of(T::KIND)
    }

    /// Build a reference to an object of a statically known kind
    pub fn reference_for<T: ContentType>(&self, object_id: u64) -> Result<GenericReference> {
        Ok(GenericReference::new(self.id_for::<T>()?, object_id))
    }

    /// Check if an id was ever issued
    pub fn contains(&self, id: TypeId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Validate the type half of a reference
    pub fn check(&self, reference: &GenericReference) -> Result<()> {
        if self.contains(reference.type_id) {
            Ok(())
        } else {
            Err(AssocError::UnknownType(reference.type_id))
        }
    }

    /// All descriptors in id order
    pub fn descriptors(&self) -> impl Iterator<Item = &TypeDescriptor> {
        self.by_id.values()
    }

    /// Get the number of registered kinds
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Export the registry as a snapshot (for serialization)
    pub fn snapshot(&self) -> TypeRegistrySnapshot {
        TypeRegistrySnapshot {
            types: self.by_id.values().cloned().collect(),
        }
    }
}

/// A serializable snapshot of the type registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeRegistrySnapshot {
    pub types: Vec<TypeDescriptor>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
