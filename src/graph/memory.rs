use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::trace;

use super::{
    Element, ElementCategory, ElementId, GraphProvider, GraphTx, IndexField, IndexId, MixedIndex,
    Relation, RelationId, RelationKind, TypeId, VertexId, VERTEX_EXISTS_KEY,
};
use crate::index::{IndexProvider, MemoryIndex};
use crate::log::{Change, Modification};
use crate::primitives::bytes::{buf::Reader, ord, var};
use crate::types::{Result, UmbralError};

const FIRST_USER_TYPE: TypeId = 16;

#[derive(Default)]
struct Schema {
    next_type: TypeId,
    types: BTreeMap<TypeId, (String, RelationKind)>,
    next_index: IndexId,
    indexes: BTreeMap<IndexId, MixedIndex>,
}

#[derive(Default)]
struct Data {
    next_vertex: VertexId,
    next_relation: RelationId,
    vertices: BTreeSet<VertexId>,
    relations: BTreeMap<RelationId, Relation>,
}

struct Inner {
    schema: RwLock<Schema>,
    data: RwLock<Data>,
    backends: DashMap<String, MemoryIndex>,
}

/// In-memory graph with a schema, mixed indexes, and index backends.
///
/// Mutations return the [`Modification`] records a commit would log, so
/// callers can write them to a transaction log themselves. Index backends
/// are not updated by mutations.
#[derive(Clone)]
pub struct MemoryGraph {
    inner: Arc<Inner>,
}

impl Default for MemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        let mut schema = Schema {
            next_type: FIRST_USER_TYPE,
            next_index: 1,
            ..Schema::default()
        };
        schema.types.insert(
            VERTEX_EXISTS_KEY,
            ("~exists".to_string(), RelationKind::Property),
        );
        Self {
            inner: Arc::new(Inner {
                schema: RwLock::new(schema),
                data: RwLock::new(Data {
                    next_vertex: 1,
                    next_relation: 1,
                    ..Data::default()
                }),
                backends: DashMap::new(),
            }),
        }
    }

    fn define(&self, name: &str, kind: RelationKind) -> TypeId {
        let mut schema = self.inner.schema.write();
        if let Some((id, _)) = schema.types.iter().find(|(_, (n, _))| n == name) {
            return *id;
        }
        let id = schema.next_type;
        schema.next_type += 1;
        schema.types.insert(id, (name.to_string(), kind));
        id
    }

    /// Defines (or looks up) a property key.
    pub fn property_key(&self, name: &str) -> TypeId {
        self.define(name, RelationKind::Property)
    }

    /// Defines (or looks up) an edge label.
    pub fn edge_label(&self, name: &str) -> TypeId {
        self.define(name, RelationKind::Edge)
    }

    /// Defines a mixed index over property `keys` stored in backend `backing`.
    pub fn mixed_index(
        &self,
        name: &str,
        backing: &str,
        element: ElementCategory,
        keys: &[TypeId],
    ) -> Result<IndexId> {
        let mut schema = self.inner.schema.write();
        let mut fields = Vec::with_capacity(keys.len());
        for key in keys {
            match schema.types.get(key) {
                Some((field, RelationKind::Property)) => fields.push(IndexField {
                    key: *key,
                    name: field.clone(),
                }),
                _ => {
                    return Err(UmbralError::Invalid(format!(
                        "type {key} is not a property key"
                    )))
                }
            }
        }
        let id = schema.next_index;
        schema.next_index += 1;
        schema.indexes.insert(
            id,
            MixedIndex {
                id,
                name: name.to_string(),
                backing_index: backing.to_string(),
                element,
                fields,
            },
        );
        self.inner
            .backends
            .entry(backing.to_string())
            .or_insert_with(|| MemoryIndex::new(backing));
        Ok(id)
    }

    /// Concrete handle to an index backend.
    pub fn backend(&self, backing: &str) -> Option<MemoryIndex> {
        self.inner.backends.get(backing).map(|b| b.value().clone())
    }

    /// Creates a vertex; returns it with the logged existence marker.
    pub fn add_vertex(&self) -> (VertexId, Modification) {
        let mut data = self.inner.data.write();
        let vertex = data.next_vertex;
        data.next_vertex += 1;
        data.vertices.insert(vertex);
        let marker = Self::insert(
            &mut data,
            VERTEX_EXISTS_KEY,
            RelationKind::Property,
            vertex,
            None,
            Some(Bytes::new()),
            BTreeMap::new(),
            true,
        );
        (vertex, Self::modification(Change::Added, &marker))
    }

    /// Adds a property to `vertex`; the newest value of a key wins on reads.
    pub fn add_property(
        &self,
        vertex: VertexId,
        key: TypeId,
        value: impl Into<Bytes>,
    ) -> Result<(RelationId, Modification)> {
        self.expect_kind(key, RelationKind::Property)?;
        let mut data = self.inner.data.write();
        if !data.vertices.contains(&vertex) {
            return Err(UmbralError::NotFound("vertex"));
        }
        let rel = Self::insert(
            &mut data,
            key,
            RelationKind::Property,
            vertex,
            None,
            Some(value.into()),
            BTreeMap::new(),
            false,
        );
        Ok((rel.id, Self::modification(Change::Added, &rel)))
    }

    /// Adds an edge carrying `properties`.
    pub fn add_edge(
        &self,
        label: TypeId,
        out_vertex: VertexId,
        in_vertex: VertexId,
        properties: BTreeMap<TypeId, Bytes>,
    ) -> Result<(RelationId, Modification)> {
        self.expect_kind(label, RelationKind::Edge)?;
        let mut data = self.inner.data.write();
        if !data.vertices.contains(&out_vertex) || !data.vertices.contains(&in_vertex) {
            return Err(UmbralError::NotFound("vertex"));
        }
        let rel = Self::insert(
            &mut data,
            label,
            RelationKind::Edge,
            out_vertex,
            Some(in_vertex),
            None,
            properties,
            false,
        );
        Ok((rel.id, Self::modification(Change::Added, &rel)))
    }

    /// Deletes a relation; returns the logged removal.
    pub fn remove_relation(&self, id: RelationId) -> Result<Modification> {
        let mut data = self.inner.data.write();
        let rel = data
            .relations
            .remove(&id)
            .ok_or(UmbralError::NotFound("relation"))?;
        Ok(Self::modification(Change::Removed, &rel))
    }

    /// Deletes a vertex with all relations touching it.
    pub fn remove_vertex(&self, vertex: VertexId) -> Result<Vec<Modification>> {
        let mut data = self.inner.data.write();
        if !data.vertices.remove(&vertex) {
            return Err(UmbralError::NotFound("vertex"));
        }
        let doomed: Vec<RelationId> = data
            .relations
            .values()
            .filter(|r| r.out_vertex == vertex || r.in_vertex == Some(vertex))
            .map(|r| r.id)
            .collect();
        Ok(doomed
            .into_iter()
            .filter_map(|id| data.relations.remove(&id))
            .map(|rel| Self::modification(Change::Removed, &rel))
            .collect())
    }

    fn expect_kind(&self, type_id: TypeId, kind: RelationKind) -> Result<()> {
        match self.inner.schema.read().types.get(&type_id) {
            Some((_, k)) if *k == kind => Ok(()),
            Some(_) => Err(UmbralError::Invalid(format!(
                "type {type_id} is not a {kind:?} type"
            ))),
            None => Err(UmbralError::NotFound("type")),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn insert(
        data: &mut Data,
        type_id: TypeId,
        kind: RelationKind,
        out_vertex: VertexId,
        in_vertex: Option<VertexId>,
        value: Option<Bytes>,
        properties: BTreeMap<TypeId, Bytes>,
        invisible: bool,
    ) -> Relation {
        let id = data.next_relation;
        data.next_relation += 1;
        let rel = Relation {
            id,
            type_id,
            kind,
            out_vertex,
            in_vertex,
            value,
            properties,
            invisible,
        };
        data.relations.insert(id, rel.clone());
        rel
    }

    fn modification(change: Change, rel: &Relation) -> Modification {
        Modification::new(change, rel.out_vertex, encode_relation(rel))
    }
}

/// Serializes a relation into the cell format read by [`GraphTx::parse_relation`].
pub(crate) fn encode_relation(rel: &Relation) -> Bytes {
    let mut out = BytesMut::with_capacity(32);
    var::encode_u64(rel.id, &mut out);
    var::encode_u64(rel.type_id, &mut out);
    out.put_u8(match rel.kind {
        RelationKind::Property => 0,
        RelationKind::Edge => 1,
    });
    out.put_u8(u8::from(rel.invisible));
    match rel.kind {
        RelationKind::Edge => var::encode_u64(rel.in_vertex.unwrap_or_default(), &mut out),
        RelationKind::Property => {
            ord::put_len_prefixed(&mut out, rel.value.as_deref().unwrap_or_default())
        }
    }
    var::encode_u64(rel.properties.len() as u64, &mut out);
    for (key, value) in &rel.properties {
        var::encode_u64(*key, &mut out);
        ord::put_len_prefixed(&mut out, value);
    }
    out.freeze()
}

fn decode_relation(out_vertex: VertexId, cell: &Bytes) -> Result<Relation> {
    let mut r = Reader::new(cell.clone());
    let id = r.varint()?;
    let type_id = r.varint()?;
    let kind = match r.u8()? {
        0 => RelationKind::Property,
        1 => RelationKind::Edge,
        other => {
            return Err(UmbralError::Corruption(format!(
                "unknown relation kind {other}"
            )))
        }
    };
    let invisible = r.u8()? != 0;
    let (in_vertex, value) = match kind {
        RelationKind::Edge => (Some(r.varint()?), None),
        RelationKind::Property => (None, Some(r.len_prefixed()?)),
    };
    let count = r.varint()?;
    let mut properties = BTreeMap::new();
    for _ in 0..count {
        let key = r.varint()?;
        properties.insert(key, r.len_prefixed()?);
    }
    Ok(Relation {
        id,
        type_id,
        kind,
        out_vertex,
        in_vertex,
        value,
        properties,
        invisible,
    })
}

struct MemoryGraphTx {
    inner: Arc<Inner>,
}

impl GraphTx for MemoryGraphTx {
    fn parse_relation(&self, out_vertex: VertexId, cell: &Bytes) -> Result<Relation> {
        decode_relation(out_vertex, cell)
    }

    fn mixed_indexes(&self, key: TypeId) -> Result<Vec<MixedIndex>> {
        let schema = self.inner.schema.read();
        Ok(schema
            .indexes
            .values()
            .filter(|index| index.indexes_key(key))
            .cloned()
            .collect())
    }

    fn mixed_index(&self, id: IndexId) -> Result<MixedIndex> {
        self.inner
            .schema
            .read()
            .indexes
            .get(&id)
            .cloned()
            .ok_or(UmbralError::NotFound("mixed index"))
    }

    fn retrieve(&self, id: ElementId, category: ElementCategory) -> Result<Option<Element>> {
        let data = self.inner.data.read();
        let element = match (id, category) {
            (ElementId::Vertex(vertex), ElementCategory::Vertex) => {
                if !data.vertices.contains(&vertex) {
                    return Ok(None);
                }
                // Relations iterate in id order, so later values overwrite earlier ones.
                let properties = data
                    .relations
                    .values()
                    .filter(|r| {
                        r.out_vertex == vertex
                            && r.kind == RelationKind::Property
                            && !r.is_vertex_exists()
                    })
                    .filter_map(|r| r.value.clone().map(|v| (r.type_id, v)))
                    .collect();
                Element {
                    id,
                    category,
                    properties,
                }
            }
            (ElementId::Relation(rel_id), ElementCategory::Edge | ElementCategory::Property) => {
                match data.relations.get(&rel_id) {
                    Some(rel) if rel.category() == category => Element {
                        id,
                        category,
                        properties: rel.properties.clone(),
                    },
                    _ => return Ok(None),
                }
            }
            _ => {
                return Err(UmbralError::Invalid(format!(
                    "{id} cannot be read as {category:?}"
                )))
            }
        };
        trace!(element = %id, "graph.retrieve");
        Ok(Some(element))
    }

    fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    fn rollback(self: Box<Self>) {}
}

impl GraphProvider for MemoryGraph {
    fn begin(&self) -> Result<Box<dyn GraphTx>> {
        Ok(Box::new(MemoryGraphTx {
            inner: Arc::clone(&self.inner),
        }))
    }

    fn index_provider(&self, backing_index: &str) -> Result<Arc<dyn IndexProvider>> {
        self.backend(backing_index)
            .map(|b| Arc::new(b) as Arc<dyn IndexProvider>)
            .ok_or(UmbralError::NotFound("index backend"))
    }
}
