//! Graph collaborator interfaces used by recovery and change-log replay.
//!
//! Recovery never interprets graph data itself. It asks a [`GraphTx`] to turn
//! logged relation cells back into [`Relation`]s, to list the mixed indexes
//! covering a type, and to re-read elements by id.

mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::index::IndexProvider;
use crate::types::Result;

pub use memory::MemoryGraph;

/// Vertex identifier.
pub type VertexId = u64;
/// Relation (edge or property) identifier.
pub type RelationId = u64;
/// Schema type identifier: a property key or an edge label.
pub type TypeId = u64;
/// Mixed index identifier.
pub type IndexId = u64;

/// Reserved property key marking that a vertex exists.
pub const VERTEX_EXISTS_KEY: TypeId = 1;

/// Identifier of an indexable element.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ElementId {
    /// A vertex.
    Vertex(VertexId),
    /// An edge or property.
    Relation(RelationId),
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementId::Vertex(id) => write!(f, "v{id}"),
            ElementId::Relation(id) => write!(f, "r{id}"),
        }
    }
}

/// Kind of element a mixed index covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ElementCategory {
    /// Vertices, indexed by their properties.
    Vertex,
    /// Edges, indexed by properties set on the edge.
    Edge,
    /// Properties, indexed by their meta-properties.
    Property,
}

/// Whether a relation is an edge or a property.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RelationKind {
    /// Property of the out-vertex; carries a value.
    Property,
    /// Edge from the out-vertex to an in-vertex.
    Edge,
}

/// A relation rebuilt from a logged cell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Relation {
    /// Relation id.
    pub id: RelationId,
    /// Property key or edge label.
    pub type_id: TypeId,
    /// Edge or property.
    pub kind: RelationKind,
    /// Vertex the relation is stored under.
    pub out_vertex: VertexId,
    /// Target of an edge.
    pub in_vertex: Option<VertexId>,
    /// Value of a property.
    pub value: Option<Bytes>,
    /// Properties set on the relation itself.
    pub properties: BTreeMap<TypeId, Bytes>,
    /// Internal relations are not shown to change processors.
    pub invisible: bool,
}

impl Relation {
    /// Whether this is the internal vertex-existence marker.
    pub fn is_vertex_exists(&self) -> bool {
        self.kind == RelationKind::Property && self.type_id == VERTEX_EXISTS_KEY
    }

    /// Category of the relation viewed as an indexable element.
    pub fn category(&self) -> ElementCategory {
        match self.kind {
            RelationKind::Property => ElementCategory::Property,
            RelationKind::Edge => ElementCategory::Edge,
        }
    }
}

/// Current state of an element as read by a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Element {
    /// Element id.
    pub id: ElementId,
    /// Element category.
    pub category: ElementCategory,
    /// Property values keyed by property key.
    pub properties: BTreeMap<TypeId, Bytes>,
}

/// One indexed property of a mixed index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexField {
    /// Indexed property key.
    pub key: TypeId,
    /// Field name in the external index.
    pub name: String,
}

/// A secondary index maintained by an external index service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MixedIndex {
    /// Schema id of the index.
    pub id: IndexId,
    /// Store name inside the backing index.
    pub name: String,
    /// Name of the index backend holding this index.
    pub backing_index: String,
    /// Kind of element indexed.
    pub element: ElementCategory,
    /// Indexed fields.
    pub fields: Vec<IndexField>,
}

impl MixedIndex {
    /// Whether `key` is one of the indexed properties.
    pub fn indexes_key(&self, key: TypeId) -> bool {
        self.fields.iter().any(|f| f.key == key)
    }
}

/// A graph transaction.
pub trait GraphTx: Send {
    /// Rebuilds the relation stored as `cell` under `out_vertex`.
    fn parse_relation(&self, out_vertex: VertexId, cell: &Bytes) -> Result<Relation>;

    /// Mixed indexes having property key `key` as a field.
    fn mixed_indexes(&self, key: TypeId) -> Result<Vec<MixedIndex>>;

    /// Looks up a mixed index by id.
    fn mixed_index(&self, id: IndexId) -> Result<MixedIndex>;

    /// Reads the element, or `None` if it no longer exists.
    fn retrieve(&self, id: ElementId, category: ElementCategory) -> Result<Option<Element>>;

    /// Commits the transaction.
    fn commit(self: Box<Self>) -> Result<()>;

    /// Discards the transaction.
    fn rollback(self: Box<Self>);
}

/// Entry point to the graph and its index backends.
pub trait GraphProvider: Send + Sync {
    /// Opens a new transaction.
    fn begin(&self) -> Result<Box<dyn GraphTx>>;

    /// Index backend registered under `backing_index`.
    fn index_provider(&self, backing_index: &str) -> Result<Arc<dyn IndexProvider>>;
}
