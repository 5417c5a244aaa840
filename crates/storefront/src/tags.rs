// Tag vocabulary
//
// Labels keyed by tag id. Tags are never owned by what they are attached to;
// the association rows link them to catalog entities.

use std::collections::{BTreeSet, HashMap};

use assoc_store::{db_err, next_id, PayloadLoader, QueryKind, Storage};
use assoc_types::{AssocError, PayloadEntity, PayloadKind, Result, Tag};
use redb::{ReadTransaction, ReadableTable, TableDefinition};

// Table definition: key is the tag id, value is the label
const TAGS_TABLE: TableDefinition<u64, &str> = TableDefinition::new("tags");

const TAG_SEQUENCE: &str = "tags";

/// Persistent tag vocabulary
pub struct TagTable {
    storage: Storage,
}

impl TagTable {
    pub fn open(storage: &Storage) -> Result<Self> {
        storage.create_table(TAGS_TABLE)?;
        Ok(Self {
            storage: storage.clone(),
        })
    }

    /// Return the tag with exactly this label, creating it if needed
    ///
    /// Labels are trimmed; a label with nothing left is rejected.
    pub fn find_or_create(&self, label: &str) -> Result<Tag> {
        let label = label.trim();
        if label.is_empty() {
            return Err(AssocError::InvalidPayload("tag label is empty".to_string()));
        }

        let write_txn = self.storage.write(QueryKind::Write)?;
        let (tag, created) = {
            let mut table = write_txn.open_table(TAGS_TABLE).map_err(db_err)?;

            let mut existing = None;
            for entry in table.iter().map_err(db_err)? {
                let (id, value) = entry.map_err(db_err)?;
                if value.value() == label {
                    existing = Some(id.value());
                    break;
                }
            }

            match existing {
                Some(id) => (Tag { id, label: label.to_string() }, false),
                None => {
                    let id = next_id(&write_txn, TAG_SEQUENCE)?;
                    table.insert(id, label).map_err(db_err)?;
                    (Tag { id, label: label.to_string() }, true)
                }
            }
        };

        if created {
            write_txn.commit().map_err(db_err)?;
            tracing::debug!("Created tag {} '{}'", tag.id, tag.label);
        } else {
            write_txn.abort().map_err(db_err)?;
        }
        Ok(tag)
    }

    /// The tag with exactly this label
    pub fn find(&self, label: &str) -> Result<Option<Tag>> {
        let label = label.trim();
        let read_txn = self.storage.read(QueryKind::EntityRead)?;
        let table = read_txn.open_table(TAGS_TABLE).map_err(db_err)?;

        for entry in table.iter().map_err(db_err)? {
            let (id, value) = entry.map_err(db_err)?;
            if value.value() == label {
                return Ok(Some(Tag {
                    id: id.value(),
                    label: label.to_string(),
                }));
            }
        }
        Ok(None)
    }

    pub fn get(&self, id: u64) -> Result<Option<Tag>> {
        let read_txn = self.storage.read(QueryKind::EntityRead)?;
        let table = read_txn.open_table(TAGS_TABLE).map_err(db_err)?;

        Ok(table.get(id).map_err(db_err)?.map(|label| Tag {
            id,
            label: label.value().to_string(),
        }))
    }

    /// Tags whose label contains `query`, ignoring case, in id order
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<Tag>> {
        let needle = query.to_lowercase();
        let read_txn = self.storage.read(QueryKind::EntityRead)?;
        let table = read_txn.open_table(TAGS_TABLE).map_err(db_err)?;

        let mut found = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            if found.len() == limit {
                break;
            }
            let (id, label) = entry.map_err(db_err)?;
            if label.value().to_lowercase().contains(&needle) {
                found.push(Tag {
                    id: id.value(),
                    label: label.value().to_string(),
                });
            }
        }
        Ok(found)
    }
}

impl PayloadLoader for TagTable {
    fn kind(&self) -> PayloadKind {
        PayloadKind::Tag
    }

    fn load_many(&self, ids: &BTreeSet<u64>) -> Result<HashMap<u64, PayloadEntity>> {
        let read_txn = self.storage.read(QueryKind::PayloadLookup)?;
        self.load_in(&read_txn, ids)
    }

    fn transactional(&self) -> bool {
        true
    }

    fn load_in(&self, txn: &ReadTransaction, ids: &BTreeSet<u64>) -> Result<HashMap<u64, PayloadEntity>> {
        let table = txn.open_table(TAGS_TABLE).map_err(db_err)?;

        let mut found = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(label) = table.get(*id).map_err(db_err)? {
                let tag = Tag {
                    id: *id,
                    label: label.value().to_string(),
                };
                found.insert(*id, PayloadEntity::Tag(tag));
            }
        }
        Ok(found)
    }
}
