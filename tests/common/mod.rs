//! Common test utilities and helpers
#![allow(dead_code)]

use heapscope_core::{
    Field, Heapscope, HeapscopeConfig, HeapValue, ManagedHeap, MapKey, ObjectId,
};
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Build a service over `heap` with default configuration
pub fn create_test_scope(heap: &ManagedHeap) -> Arc<Heapscope> {
    create_scope_with(heap, HeapscopeConfig::default())
}

pub fn create_scope_with(heap: &ManagedHeap, config: HeapscopeConfig) -> Arc<Heapscope> {
    Arc::new(Heapscope::new(Arc::new(heap.clone()), &config))
}

/// Unrooted instance with reference fields
pub fn instance(heap: &ManagedHeap, type_name: &str, fields: &[(&str, ObjectId)]) -> ObjectId {
    heap.alloc(
        type_name,
        HeapValue::Instance {
            fields: fields
                .iter()
                .map(|(name, id)| (name.to_string(), Field::Ref(*id)))
                .collect(),
            table: None,
        },
    )
}

/// Rooted string-keyed map
pub fn rooted_map(heap: &ManagedHeap, entries: &[(&str, ObjectId)]) -> ObjectId {
    heap.alloc_root(
        "core::Map",
        HeapValue::Map(
            entries
                .iter()
                .map(|(key, id)| (MapKey::Str(key.to_string()), *id))
                .collect(),
        ),
    )
}

/// A linked chain of `len` nodes, each holding the previous one; returns them head first
pub fn chain(heap: &ManagedHeap, len: usize) -> Vec<ObjectId> {
    let mut nodes = Vec::with_capacity(len);
    let mut previous: Option<ObjectId> = None;
    for _ in 0..len {
        let fields: Vec<(&str, ObjectId)> = previous.iter().map(|id| ("next", *id)).collect();
        let node = instance(heap, "test::Link", &fields);
        nodes.push(node);
        previous = Some(node);
    }
    if let Some(last) = nodes.last() {
        heap.add_root(*last);
    }
    nodes
}

/// Write a TOML configuration file
pub fn config_file(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("Failed to create temp config");
    file.write_all(contents.as_bytes())
        .expect("Failed to write temp config");
    file
}
