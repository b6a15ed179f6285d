//! Attribute listing for a single object

use crate::heap::HeapSnapshotProvider;
use crate::types::{AttributeEntry, ObjectHandle, ObjectKind};
use tracing::trace;

/// List the readable attributes of `handle`
///
/// A failed read becomes a placeholder entry and never hides the other attributes.
/// Callables that merely wrap methods are left out.
pub fn inspect_attributes(
    provider: &dyn HeapSnapshotProvider,
    handle: &ObjectHandle,
    repr_limit: usize,
) -> Vec<AttributeEntry> {
    let mut listing = Vec::new();

    for name in provider.attribute_names(handle) {
        let value = match provider.read_attribute(handle, &name) {
            Ok(value) => value,
            Err(e) => {
                trace!(%name, error = %e, "attribute read failed");
                listing.push(AttributeEntry {
                    value: unreadable(&e),
                    name,
                });
                continue;
            }
        };

        if let ObjectKind::Callable { callable } = provider.kind(&value) {
            if callable.is_method_wrapper() {
                continue;
            }
        }

        let value = provider
            .describe(&value, repr_limit)
            .unwrap_or_else(|e| unreadable(&e));
        listing.push(AttributeEntry { name, value });
    }

    listing
}

fn unreadable(reason: &dyn std::fmt::Display) -> String {
    format!("<unrepresentable attribute: {}>", reason)
}
