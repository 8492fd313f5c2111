//! External index contract.
//!
//! Repairs rebuild whole documents: for each element the current field
//! values are serialized into [`RestoreDocs`] and written with
//! [`IndexTransaction::restore`], replacing whatever the index held before.

mod memory;

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::graph::{Element, ElementId, MixedIndex};
use crate::types::Result;

pub use memory::MemoryIndex;

/// One field of an index document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    /// Field name.
    pub field: String,
    /// Field value.
    pub value: Bytes,
}

/// Documents to restore: store name, then document id, then fields.
///
/// An empty field list deletes the document.
pub type RestoreDocs = BTreeMap<String, BTreeMap<String, Vec<IndexEntry>>>;

/// Document id under which an element is indexed.
pub fn document_id(id: ElementId) -> String {
    id.to_string()
}

/// A batch of index mutations.
pub trait IndexTransaction: Send {
    /// Queues full-document replacements.
    fn restore(&mut self, docs: RestoreDocs) -> Result<()>;

    /// Applies queued mutations.
    fn commit(self: Box<Self>) -> Result<()>;

    /// Drops queued mutations.
    fn rollback(self: Box<Self>);
}

/// An index backend holding one or more mixed indexes.
pub trait IndexProvider: Send + Sync {
    /// Backend name, matched against [`MixedIndex::backing_index`].
    fn name(&self) -> &str;

    /// Starts a mutation batch.
    fn begin_transaction(&self) -> Result<Box<dyn IndexTransaction>>;

    /// Adds the current document of `element` for `index` to `docs`.
    fn reindex_element(&self, element: &Element, index: &MixedIndex, docs: &mut RestoreDocs) {
        if element.category != index.element {
            return;
        }
        let entries = index
            .fields
            .iter()
            .filter_map(|field| {
                element.properties.get(&field.key).map(|value| IndexEntry {
                    field: field.name.clone(),
                    value: value.clone(),
                })
            })
            .collect();
        docs.entry(index.name.clone())
            .or_default()
            .insert(document_id(element.id), entries);
    }

    /// Adds a deletion of the document of `id` for `index` to `docs`.
    fn remove_element(&self, id: ElementId, index: &MixedIndex, docs: &mut RestoreDocs) {
        docs.entry(index.name.clone())
            .or_default()
            .insert(document_id(id), Vec::new());
    }
}
