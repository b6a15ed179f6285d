//! Heap snapshot capability
//!
//! The census and the tracer never touch program memory directly. Everything they
//! know about live objects comes through [`HeapSnapshotProvider`], so any runtime
//! able to enumerate its objects and their edges can host the service unchanged.
//! [`managed::ManagedHeap`] is the in-process implementation shipped with the crate.

pub mod managed;

pub use managed::{Field, HeapValue, ManagedHeap};

use crate::error::{IntrospectionError, Result};
use crate::types::{MapKey, ObjectHandle, ObjectId, ObjectKind};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;

/// Attribute name under which an object's attribute table is reachable
pub const ATTRIBUTE_TABLE: &str = "__dict__";

/// Point-in-time enumeration of all live objects
///
/// Handles stay valid while the snapshot is held: providers attach a pin that keeps
/// the enumerated objects from being reclaimed until the snapshot is dropped.
pub struct HeapSnapshot {
    objects: Vec<ObjectHandle>,
    scratch: Vec<ObjectId>,
    _pin: Option<Box<dyn Any + Send + Sync>>,
}

impl HeapSnapshot {
    pub fn new(objects: Vec<ObjectHandle>) -> Self {
        Self {
            objects,
            scratch: Vec::new(),
            _pin: None,
        }
    }

    /// Identities of objects the provider allocated to produce this snapshot
    pub fn with_scratch(mut self, scratch: Vec<ObjectId>) -> Self {
        self.scratch = scratch;
        self
    }

    /// Keep `pin` alive for as long as the snapshot
    pub fn with_pin(mut self, pin: Box<dyn Any + Send + Sync>) -> Self {
        self._pin = Some(pin);
        self
    }

    pub fn objects(&self) -> &[ObjectHandle] {
        &self.objects
    }

    pub fn scratch(&self) -> &[ObjectId] {
        &self.scratch
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Find the handle with the given identity
    pub fn find(&self, id: ObjectId) -> Option<&ObjectHandle> {
        self.objects.iter().find(|handle| handle.id == id)
    }

    /// All handles of the given type, in enumeration order
    pub fn of_type<'a>(&'a self, type_name: &'a str) -> impl Iterator<Item = &'a ObjectHandle> {
        self.objects
            .iter()
            .filter(move |handle| handle.type_name == type_name)
    }
}

impl fmt::Debug for HeapSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapSnapshot")
            .field("objects", &self.objects.len())
            .field("scratch", &self.scratch)
            .field("pinned", &self._pin.is_some())
            .finish()
    }
}

/// Source location responsible for a group of live objects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationSite {
    /// `file:line` of the allocating call
    pub location: String,
    /// Live objects allocated there
    pub count: usize,
    /// Estimated bytes held by those objects
    pub bytes: u64,
}

/// Introspection capability supplied by the host runtime
///
/// Queries about a single object return [`IntrospectionError`] rather than panicking
/// when the object vanished or resists inspection; callers degrade those failures to
/// placeholders.
pub trait HeapSnapshotProvider: Send + Sync {
    /// Reclaim unreachable objects so the next enumeration is accurate
    fn collect(&self) {}

    /// Enumerate every live object
    fn snapshot(&self) -> Result<HeapSnapshot>;

    /// Current handle for an identity, if an object holds it
    fn resolve(&self, id: ObjectId) -> Option<ObjectHandle>;

    /// Objects holding a direct reference to `handle`
    fn referrers(&self, handle: &ObjectHandle) -> Vec<ObjectHandle>;

    /// Objects directly referenced by `handle`
    fn referents(&self, handle: &ObjectHandle) -> Vec<ObjectHandle>;

    /// Short textual representation, at most `limit` characters
    fn describe(&self, handle: &ObjectHandle, limit: usize) -> std::result::Result<String, IntrospectionError>;

    fn kind(&self, handle: &ObjectHandle) -> ObjectKind;

    /// Declared name of the object (modules, functions, types)
    fn name(&self, handle: &ObjectHandle) -> Option<String>;

    /// Key/value pairs of a mapping-like object, `None` for anything else
    fn entries(&self, handle: &ObjectHandle) -> Option<Vec<(MapKey, ObjectHandle)>>;

    /// Names of readable attributes
    fn attribute_names(&self, handle: &ObjectHandle) -> Vec<String>;

    /// Read one attribute
    fn read_attribute(
        &self,
        handle: &ObjectHandle,
        name: &str,
    ) -> std::result::Result<ObjectHandle, IntrospectionError>;

    /// Object backing the attribute table, when the runtime stores attributes apart
    fn attribute_table(&self, _handle: &ObjectHandle) -> Option<ObjectHandle> {
        None
    }

    /// Whether [`estimate_size`](Self::estimate_size) is implemented
    fn supports_size_estimation(&self) -> bool {
        false
    }

    /// Best-effort size of one object in bytes
    fn estimate_size(&self, handle: &ObjectHandle) -> std::result::Result<u64, IntrospectionError> {
        Err(IntrospectionError::Unmeasurable(handle.id))
    }

    /// Live objects grouped by allocation site, most populous first
    ///
    /// `None` when the runtime does not record allocation sites.
    fn allocation_sites(&self, _limit: usize) -> Option<Vec<AllocationSite>> {
        None
    }
}
