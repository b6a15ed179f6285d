//! Object summaries and edge attribution

use crate::census::format_size;
use crate::heap::{HeapSnapshotProvider, ATTRIBUTE_TABLE};
use crate::types::{EdgeVia, ObjectHandle, ObjectSummary};

/// Placeholder for an object whose representation could not be produced
pub const UNREPRESENTABLE: &str = "<unrepresentable>";

/// Name the key or attribute through which `referrer` holds `referent`.
///
/// Mapping entries are checked first, then named attributes, then the attribute
/// table itself. Matching is by identity only: an equal but distinct value is not
/// the edge being explained.
pub fn edge_via(
    provider: &dyn HeapSnapshotProvider,
    referrer: &ObjectHandle,
    referent: &ObjectHandle,
) -> Option<EdgeVia> {
    if let Some(entries) = provider.entries(referrer) {
        if let Some((key, _)) = entries.into_iter().find(|(_, value)| value.id == referent.id) {
            return Some(EdgeVia::Key(key));
        }
    }

    let by_attribute = provider
        .attribute_names(referrer)
        .into_iter()
        .find(|name| {
            provider
                .read_attribute(referrer, name)
                .map_or(false, |value| value.id == referent.id)
        });
    if let Some(name) = by_attribute {
        return Some(EdgeVia::Attribute(name));
    }

    provider
        .attribute_table(referrer)
        .filter(|table| table.id == referent.id)
        .map(|_| EdgeVia::Attribute(ATTRIBUTE_TABLE.to_string()))
}

/// Builds [`ObjectSummary`] values, degrading every failure to a placeholder
pub struct Renderer<'a> {
    provider: &'a dyn HeapSnapshotProvider,
    repr_limit: usize,
    with_sizes: bool,
}

impl<'a> Renderer<'a> {
    pub fn new(provider: &'a dyn HeapSnapshotProvider, repr_limit: usize) -> Self {
        Self {
            provider,
            repr_limit,
            with_sizes: provider.supports_size_estimation(),
        }
    }

    /// Summarise `handle`, attributing the edge to `referent` when given
    pub fn summary(&self, handle: &ObjectHandle, referent: Option<&ObjectHandle>) -> ObjectSummary {
        let size = self.with_sizes.then(|| {
            format_size(self.provider.estimate_size(handle).unwrap_or(0))
        });

        ObjectSummary {
            id: handle.id,
            type_name: handle.type_name.clone(),
            name: self.provider.name(handle),
            via: referent.and_then(|referent| edge_via(self.provider, handle, referent)),
            size,
            repr: self.repr(handle),
        }
    }

    /// Capped representation, or the placeholder
    pub fn repr(&self, handle: &ObjectHandle) -> String {
        self.provider
            .describe(handle, self.repr_limit)
            .unwrap_or_else(|_| UNREPRESENTABLE.to_string())
    }
}
