// Type descriptor persistence
//
// The descriptor table maps a stable kind name to its append-only id. At
// startup the persisted descriptors seed the registry builder, the caller's
// kinds are registered, and any new descriptors are written back before the
// registry is frozen.

use assoc_types::{Result, TypeDescriptor, TypeId, TypeRegistry, TypeRegistryBuilder};
use redb::{ReadableTable, TableDefinition};

use crate::query_log::QueryKind;
use crate::storage::{db_err, Storage};

// Table definition: key is the kind name, value is its id
pub(crate) const TYPES_TABLE: TableDefinition<&str, u32> = TableDefinition::new("content_types");

/// Read all persisted descriptors
pub fn load_descriptors(storage: &Storage) -> Result<Vec<TypeDescriptor>> {
    storage.create_table(TYPES_TABLE)?;

    let read_txn = storage.read(QueryKind::TypeLoad)?;
    let table = read_txn.open_table(TYPES_TABLE).map_err(db_err)?;

    let mut descriptors = Vec::new();
    for entry in table.iter().map_err(db_err)? {
        let (name, id) = entry.map_err(db_err)?;
        descriptors.push(TypeDescriptor::new(TypeId(id.value()), name.value()));
    }
    descriptors.sort_by_key(|d| d.id);
    Ok(descriptors)
}

/// Write descriptors appended by the builder
pub fn persist_pending(storage: &Storage, builder: &TypeRegistryBuilder) -> Result<()> {
    if builder.pending().is_empty() {
        return Ok(());
    }

    let write_txn = storage.write(QueryKind::TypeInsert)?;
    {
        let mut table = write_txn.open_table(TYPES_TABLE).map_err(db_err)?;
        for desc in builder.pending() {
            table.insert(desc.name.as_str(), desc.id.0).map_err(db_err)?;
        }
    }
    write_txn.commit().map_err(db_err)?;

    for desc in builder.pending() {
        tracing::info!("Registered content type: {} ({})", desc.name, desc.id);
    }
    Ok(())
}

/// Start the registration phase, seeded from the persisted descriptors
pub fn open_builder(storage: &Storage) -> Result<TypeRegistryBuilder> {
    TypeRegistryBuilder::from_descriptors(load_descriptors(storage)?)
}

/// End the registration phase: persist new descriptors and freeze
pub fn freeze(storage: &Storage, builder: TypeRegistryBuilder) -> Result<TypeRegistry> {
    persist_pending(storage, &builder)?;

    let registry = builder.build();
    tracing::info!("Type registry ready ({} kinds)", registry.len());
    Ok(registry)
}

/// Build the immutable registry for this process
///
/// Registers every kind in `kinds` (idempotently) on top of the persisted
/// descriptors and persists the new ones.
pub fn bootstrap_registry<'a>(
    storage: &Storage,
    kinds: impl IntoIterator<Item = &'a str>,
) -> Result<TypeRegistry> {
    let mut builder = open_builder(storage)?;
    for kind in kinds {
        builder.register(kind);
    }
    freeze(storage, builder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_ids_are_durable_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("types.redb");

        {
            let storage = Storage::open(&path).unwrap();
            let registry =
                bootstrap_registry(&storage, ["store.product", "blog.article"]).unwrap();
            assert_eq!(registry.id_of("store.product").unwrap(), TypeId(1));
            assert_eq!(registry.id_of("blog.article").unwrap(), TypeId(2));
        }

        let storage = Storage::open(&path).unwrap();
        let registry =
            bootstrap_registry(&storage, ["store.customer", "store.product"]).unwrap();
        assert_eq!(registry.id_of("store.product").unwrap(), TypeId(1));
        assert_eq!(registry.id_of("blog.article").unwrap(), TypeId(2));
        assert_eq!(registry.id_of("store.customer").unwrap(), TypeId(3));
    }

    #[test]
    fn test_registering_known_kinds_writes_nothing() {
        let storage = Storage::in_memory().unwrap();
        bootstrap_registry(&storage, ["store.product"]).unwrap();
        bootstrap_registry(&storage, ["store.product"]).unwrap();

        assert_eq!(storage.log().count(QueryKind::TypeInsert), 1);
        assert_eq!(load_descriptors(&storage).unwrap().len(), 1);
    }
}
