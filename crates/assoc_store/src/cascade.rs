// Cascade protocol for owner deletion
//
// Owners live in unrelated tables, so nothing in storage can enforce that
// their associations go with them. Instead each owner type has an explicit
// list of cascade hooks that the deletion path runs synchronously.
//
// When the owner table shares the association database, hooks and the owner
// delete run in one write transaction. Otherwise hooks run first, each in its
// own transaction, then the owner is deleted; if that last step fails the
// error is surfaced as `CascadeIncomplete` and never retried.
//
// Owner types that are also payload entities (users behind likes) carry a
// `PayloadCascade` as well, so rows pointing at them go too.

use std::collections::HashMap;
use std::sync::Arc;

use assoc_types::{AssocError, GenericReference, PayloadKind, PayloadRef, Result, TypeId, TypeRegistry};
use redb::WriteTransaction;
use serde::Serialize;

use crate::query_log::QueryKind;
use crate::resolve::OwnerTable;
use crate::storage::{db_err, Storage};
use crate::store::AssociationStore;

/// Something that must be cleaned up when an owner is deleted
pub trait CascadeHook: Send + Sync {
    fn name(&self) -> &str;

    /// Clean up inside the owner's deletion transaction
    fn cascade_in(&self, txn: &WriteTransaction, owner: GenericReference) -> Result<usize>;

    /// Clean up in a transaction of its own
    fn cascade(&self, owner: GenericReference) -> Result<usize>;
}

impl CascadeHook for AssociationStore {
    fn name(&self) -> &str {
        "associations"
    }

    fn cascade_in(&self, txn: &WriteTransaction, owner: GenericReference) -> Result<usize> {
        self.registry().check(&owner)?;
        AssociationStore::remove_owner_in(txn, owner)
    }

    fn cascade(&self, owner: GenericReference) -> Result<usize> {
        self.on_owner_deleted(owner.type_id, owner.object_id)
    }
}

/// Removes the associations whose payload is the deleted owner
pub struct PayloadCascade {
    store: Arc<AssociationStore>,
    kind: PayloadKind,
}

impl PayloadCascade {
    /// Owners of the hooked type are referenced as payloads of `kind`
    pub fn new(store: Arc<AssociationStore>, kind: PayloadKind) -> Self {
        Self { store, kind }
    }

    fn payload(&self, owner: GenericReference) -> PayloadRef {
        PayloadRef::new(self.kind, owner.object_id)
    }
}

impl CascadeHook for PayloadCascade {
    fn name(&self) -> &str {
        "payload associations"
    }

    fn cascade_in(&self, txn: &WriteTransaction, owner: GenericReference) -> Result<usize> {
        AssociationStore::remove_payload_in(txn, self.payload(owner))
    }

    fn cascade(&self, owner: GenericReference) -> Result<usize> {
        self.store.on_payload_deleted(self.payload(owner))
    }
}

/// Outcome of an owner deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OwnerDeletion {
    /// Whether the owner row existed
    pub owner_existed: bool,
    /// Rows removed by cascade hooks
    pub cascaded: usize,
    /// Whether hooks and owner delete committed as one transaction
    pub atomic: bool,
}

/// Builder for the per-type hook lists
pub struct CascadeCoordinatorBuilder {
    storage: Storage,
    registry: Arc<TypeRegistry>,
    hooks: HashMap<TypeId, Vec<Arc<dyn CascadeHook>>>,
    owners: HashMap<TypeId, Arc<dyn OwnerTable>>,
}

impl CascadeCoordinatorBuilder {
    pub fn new(storage: Storage, registry: Arc<TypeRegistry>) -> Self {
        Self {
            storage,
            registry,
            hooks: HashMap::new(),
            owners: HashMap::new(),
        }
    }

    /// Add a hook for one owner type
    pub fn hook(mut self, type_id: TypeId, hook: Arc<dyn CascadeHook>) -> Self {
        self.hooks.entry(type_id).or_default().push(hook);
        self
    }

    /// Add a hook for every registered owner type
    pub fn hook_all(mut self, hook: Arc<dyn CascadeHook>) -> Self {
        for desc in self.registry.descriptors() {
            self.hooks.entry(desc.id).or_default().push(hook.clone());
        }
        self
    }

    /// Register the table owners of a type are deleted from
    pub fn owner_table(mut self, type_id: TypeId, table: Arc<dyn OwnerTable>) -> Self {
        self.owners.insert(type_id, table);
        self
    }

    pub fn build(self) -> CascadeCoordinator {
        CascadeCoordinator {
            storage: self.storage,
            registry: self.registry,
            hooks: self.hooks,
            owners: self.owners,
        }
    }
}

/// Runs owner deletions together with their cascade hooks
pub struct CascadeCoordinator {
    storage: Storage,
    registry: Arc<TypeRegistry>,
    hooks: HashMap<TypeId, Vec<Arc<dyn CascadeHook>>>,
    owners: HashMap<TypeId, Arc<dyn OwnerTable>>,
}

impl CascadeCoordinator {
    pub fn builder(storage: Storage, registry: Arc<TypeRegistry>) -> CascadeCoordinatorBuilder {
        CascadeCoordinatorBuilder::new(storage, registry)
    }

    /// Hook names registered for a type, in run order
    pub fn hook_names(&self, type_id: TypeId) -> Vec<&str> {
        self.hooks
            .get(&type_id)
            .map(|hooks| hooks.iter().map(|h| h.name()).collect())
            .unwrap_or_default()
    }

    /// Delete an owner and everything hooked to it
    pub fn delete_owner(&self, owner: GenericReference) -> Result<OwnerDeletion> {
        self.registry.check(&owner)?;
        let table = self
            .owners
            .get(&owner.type_id)
            .ok_or(AssocError::MissingOwnerTable(owner.type_id))?;
        let hooks = self.hooks.get(&owner.type_id).map(Vec::as_slice).unwrap_or(&[]);

        if table.transactional() {
            self.delete_atomic(table.as_ref(), hooks, owner)
        } else {
            self.delete_compensating(table.as_ref(), hooks, owner)
        }
    }

    fn delete_atomic(
        &self,
        table: &dyn OwnerTable,
        hooks: &[Arc<dyn CascadeHook>],
        owner: GenericReference,
    ) -> Result<OwnerDeletion> {
        let write_txn = self.storage.write(QueryKind::CascadeDelete)?;

        let mut cascaded = 0;
        for hook in hooks {
            cascaded += hook.cascade_in(&write_txn, owner)?;
        }
        let owner_existed = table.delete_in(&write_txn, owner.object_id)?;
        write_txn.commit().map_err(db_err)?;

        tracing::info!(
            "Deleted owner {} with {} cascaded rows (atomic)",
            owner,
            cascaded
        );
        Ok(OwnerDeletion {
            owner_existed,
            cascaded,
            atomic: true,
        })
    }

    fn delete_compensating(
        &self,
        table: &dyn OwnerTable,
        hooks: &[Arc<dyn CascadeHook>],
        owner: GenericReference,
    ) -> Result<OwnerDeletion> {
        let mut cascaded = 0;
        for hook in hooks {
            cascaded += hook.cascade(owner)?;
        }

        match table.delete(owner.object_id) {
            Ok(owner_existed) => {
                tracing::info!(
                    "Deleted owner {} with {} cascaded rows (compensating)",
                    owner,
                    cascaded
                );
                Ok(OwnerDeletion {
                    owner_existed,
                    cascaded,
                    atomic: false,
                })
            }
            Err(e) => {
                tracing::error!(
                    "Owner {} not deleted after cascading {} rows: {}",
                    owner,
                    cascaded,
                    e
                );
                Err(AssocError::CascadeIncomplete {
                    reference: owner,
                    removed: cascaded,
                    reason: e.to_string(),
                })
            }
        }
    }
}
