// Association Types - Core data structures for generic associations
//
// A generic reference addresses any registered entity kind by (type, id).
// Associations link such a reference to a payload: a tag or an actor.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AssocError, Result};

/// Identifier of an owning entity within its own table
pub type ObjectId = u64;

/// Identifier of a stored association row
pub type AssociationId = u64;

// ─────────────────────────────────────────────────────────────────────────────
// Type Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Durable numeric id of a registered entity kind
///
/// Issued by the type registry, never reused and never renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeId(pub u32);

impl TypeId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type#{}", self.0)
    }
}

/// A registered entity kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub id: TypeId,
    /// Stable textual name, e.g. "store.product"
    pub name: String,
}

impl TypeDescriptor {
    pub fn new(id: TypeId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// A Rust type that names its registry kind statically
///
/// ```rust,ignore
/// impl ContentType for Product {
///     const KIND: &'static str = "store.product";
/// }
///
/// let product_type = registry.id_for::<Product>()?;
/// ```
pub trait ContentType {
    const KIND: &'static str;
}

// ─────────────────────────────────────────────────────────────────────────────
// Generic Reference
// ─────────────────────────────────────────────────────────────────────────────

/// Untyped `(type, id)` pair addressing any registered entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GenericReference {
    pub type_id: TypeId,
    pub object_id: ObjectId,
}

impl GenericReference {
    pub fn new(type_id: TypeId, object_id: ObjectId) -> Self {
        Self { type_id, object_id }
    }
}

impl From<(TypeId, ObjectId)> for GenericReference {
    fn from((type_id, object_id): (TypeId, ObjectId)) -> Self {
        Self::new(type_id, object_id)
    }
}

impl fmt::Display for GenericReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_id.0, self.object_id)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Which payload table an association points into
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PayloadKind {
    /// A label from the tag vocabulary
    Tag = 0,
    /// A user who liked the owner
    Actor = 1,
}

impl PayloadKind {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(PayloadKind::Tag),
            1 => Ok(PayloadKind::Actor),
            other => Err(AssocError::Encoding(format!("unknown payload kind code {}", other))),
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadKind::Tag => write!(f, "tag"),
            PayloadKind::Actor => write!(f, "actor"),
        }
    }
}

/// Reference to the payload side of an association
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum PayloadRef {
    Tag(u64),
    Actor(u64),
}

impl PayloadRef {
    pub fn new(kind: PayloadKind, id: u64) -> Self {
        match kind {
            PayloadKind::Tag => PayloadRef::Tag(id),
            PayloadKind::Actor => PayloadRef::Actor(id),
        }
    }

    pub fn kind(&self) -> PayloadKind {
        match self {
            PayloadRef::Tag(_) => PayloadKind::Tag,
            PayloadRef::Actor(_) => PayloadKind::Actor,
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            PayloadRef::Tag(id) | PayloadRef::Actor(id) => *id,
        }
    }

    /// Rebuild a payload reference from its stored `(kind code, id)` parts
    pub fn from_parts(code: u8, id: u64) -> Result<Self> {
        Ok(Self::new(PayloadKind::from_code(code)?, id))
    }
}

impl fmt::Display for PayloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// A tag from the tag vocabulary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: u64,
    pub label: String,
}

/// A user that can like catalog entities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: u64,
    pub name: String,
}

/// A fully resolved payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PayloadEntity {
    Tag(Tag),
    Actor(Actor),
}

impl PayloadEntity {
    pub fn payload_ref(&self) -> PayloadRef {
        match self {
            PayloadEntity::Tag(tag) => PayloadRef::Tag(tag.id),
            PayloadEntity::Actor(actor) => PayloadRef::Actor(actor.id),
        }
    }

    /// Display text: the tag label or the actor name
    pub fn label(&self) -> &str {
        match self {
            PayloadEntity::Tag(tag) => &tag.label,
            PayloadEntity::Actor(actor) => &actor.name,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Association
// ─────────────────────────────────────────────────────────────────────────────

/// A stored link between a generic reference and a payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Association {
    pub id: AssociationId,
    pub reference: GenericReference,
    pub payload: PayloadRef,
    pub created_at: DateTime<Utc>,
}

impl Association {
    /// Ordering key: creation time, then ascending id
    pub fn order_key(&self) -> (i64, AssociationId) {
        (self.created_at.timestamp_micros(), self.id)
    }
}
