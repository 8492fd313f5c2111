use std::collections::BTreeSet;

use crate::graph::{GraphTx, Relation, RelationKind, TypeId, VertexId};
use crate::log::{Change, Modification};
use crate::types::Result;

/// Logical changes of one committed transaction.
///
/// Vertex creation and deletion appear as vertex events; the internal
/// existence marker behind them is never exposed. Invisible relations are
/// dropped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeState {
    vertices: Vec<(Change, VertexId)>,
    relations: Vec<(Change, Relation)>,
}

impl ChangeState {
    /// Rebuilds the change set of `modifications` through `tx`.
    pub fn from_modifications(tx: &dyn GraphTx, modifications: &[Modification]) -> Result<Self> {
        let mut state = ChangeState::default();
        for modification in modifications {
            let rel = tx.parse_relation(modification.out_vertex_id, &modification.relation_cell)?;
            if rel.is_vertex_exists() {
                state.vertices.push((modification.change, rel.out_vertex));
            } else if !rel.invisible {
                state.relations.push((modification.change, rel));
            }
        }
        Ok(state)
    }

    /// Whether the transaction changed nothing visible.
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() && self.relations.is_empty()
    }

    /// Vertices created or deleted, per `change`.
    pub fn vertices(&self, change: Change) -> BTreeSet<VertexId> {
        self.vertices
            .iter()
            .filter(|(c, _)| *c == change)
            .map(|(_, v)| *v)
            .collect()
    }

    /// Relations added or removed, optionally restricted to `types`.
    pub fn relations(&self, change: Change, types: &[TypeId]) -> Vec<&Relation> {
        self.relations
            .iter()
            .filter(|(c, rel)| *c == change && (types.is_empty() || types.contains(&rel.type_id)))
            .map(|(_, rel)| rel)
            .collect()
    }

    /// Properties of `vertex` added or removed, optionally restricted to `keys`.
    pub fn properties(&self, vertex: VertexId, change: Change, keys: &[TypeId]) -> Vec<&Relation> {
        self.relations(change, keys)
            .into_iter()
            .filter(|rel| rel.kind == RelationKind::Property && rel.out_vertex == vertex)
            .collect()
    }

    /// Edges touching `vertex` in either direction, optionally restricted to
    /// `labels`.
    pub fn edges(&self, vertex: VertexId, change: Change, labels: &[TypeId]) -> Vec<&Relation> {
        self.relations(change, labels)
            .into_iter()
            .filter(|rel| {
                rel.kind == RelationKind::Edge
                    && (rel.out_vertex == vertex || rel.in_vertex == Some(vertex))
            })
            .collect()
    }
}
