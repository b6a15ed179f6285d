//! In-process object heap
//!
//! `ManagedHeap` is a small garbage-collected object store: values are allocated
//! into numbered slots, roots are explicit, and [`ManagedHeap::reclaim`] frees
//! everything not reachable from a root or from a pinned snapshot. It implements
//! [`HeapSnapshotProvider`] so the census and tracer can observe it, and it is
//! what the `heapscope` binary's demo workload runs on.

use super::{AllocationSite, HeapSnapshot, HeapSnapshotProvider, ATTRIBUTE_TABLE};
use crate::error::{HeapscopeError, IntrospectionError, Result};
use crate::types::{CallableKind, MapKey, ObjectHandle, ObjectId, ObjectKind, TypeName};
use crate::utils::cap_chars;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::panic::Location;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tracing::{debug, trace};

type Introspect<T> = std::result::Result<T, IntrospectionError>;

const HEADER_BYTES: u64 = 16;
const REF_BYTES: u64 = 8;

/// Attribute slot of an instance
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    /// Reference to another heap object
    Ref(ObjectId),
    /// Attribute whose read fails with this reason
    Faulty(String),
}

/// Payload of one heap object
#[derive(Debug, Clone, PartialEq)]
pub enum HeapValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<ObjectId>),
    Tuple(Vec<ObjectId>),
    Map(Vec<(MapKey, ObjectId)>),
    /// User-defined object with named fields and an optional separate attribute table
    Instance {
        fields: Vec<(String, Field)>,
        table: Option<ObjectId>,
    },
    Module {
        name: String,
        members: Vec<(String, ObjectId)>,
    },
    Frame {
        origin: String,
        locals: Vec<(String, ObjectId)>,
    },
    Callable {
        kind: CallableKind,
        name: String,
        receiver: Option<ObjectId>,
    },
    /// Object whose representation cannot be produced
    Opaque { reason: String },
}

impl HeapValue {
    /// Type name used by [`ManagedHeap::alloc_value`]
    pub fn default_type_name(&self) -> &'static str {
        match self {
            HeapValue::Int(_) => "core::Int",
            HeapValue::Float(_) => "core::Float",
            HeapValue::Str(_) => "core::Str",
            HeapValue::Bytes(_) => "core::Bytes",
            HeapValue::List(_) => "core::List",
            HeapValue::Tuple(_) => "core::Tuple",
            HeapValue::Map(_) => "core::Map",
            HeapValue::Instance { .. } => "core::Object",
            HeapValue::Module { .. } => "core::Module",
            HeapValue::Frame { .. } => "core::Frame",
            HeapValue::Callable { kind, .. } => match kind {
                CallableKind::Function => "core::Function",
                CallableKind::BoundMethod => "core::BoundMethod",
                CallableKind::BuiltinFunction => "core::BuiltinFunction",
                CallableKind::MethodWrapper => "core::MethodWrapper",
                CallableKind::SlotWrapper => "core::SlotWrapper",
            },
            HeapValue::Opaque { .. } => "core::Opaque",
        }
    }

    fn references(&self) -> Vec<ObjectId> {
        match self {
            HeapValue::Int(_) | HeapValue::Float(_) | HeapValue::Str(_) | HeapValue::Bytes(_) => {
                Vec::new()
            }
            HeapValue::Opaque { .. } => Vec::new(),
            HeapValue::List(items) | HeapValue::Tuple(items) => items.clone(),
            HeapValue::Map(entries) => entries.iter().map(|(_, id)| *id).collect(),
            HeapValue::Instance { fields, table } => fields
                .iter()
                .filter_map(|(_, field)| match field {
                    Field::Ref(id) => Some(*id),
                    Field::Faulty(_) => None,
                })
                .chain(*table)
                .collect(),
            HeapValue::Module { members, .. } => members.iter().map(|(_, id)| *id).collect(),
            HeapValue::Frame { locals, .. } => locals.iter().map(|(_, id)| *id).collect(),
            HeapValue::Callable { receiver, .. } => receiver.iter().copied().collect(),
        }
    }

    /// Shallow footprint; `None` for values that cannot be measured
    fn shallow_size(&self) -> Option<u64> {
        let payload = match self {
            HeapValue::Int(_) | HeapValue::Float(_) => 8,
            HeapValue::Str(s) => s.len() as u64,
            HeapValue::Bytes(b) => b.len() as u64,
            HeapValue::List(items) | HeapValue::Tuple(items) => REF_BYTES * items.len() as u64,
            HeapValue::Map(entries) => entries
                .iter()
                .map(|(key, _)| {
                    let key_bytes = match key {
                        MapKey::Str(s) => s.len() as u64,
                        MapKey::Int(_) | MapKey::Opaque(_) => 8,
                    };
                    2 * REF_BYTES + key_bytes
                })
                .sum(),
            HeapValue::Instance { fields, .. } => fields
                .iter()
                .map(|(name, _)| 2 * REF_BYTES + name.len() as u64)
                .sum::<u64>()
                + REF_BYTES,
            HeapValue::Module { members, .. } => members
                .iter()
                .map(|(name, _)| 2 * REF_BYTES + name.len() as u64)
                .sum(),
            HeapValue::Frame { locals, .. } => {
                64 + locals
                    .iter()
                    .map(|(name, _)| 2 * REF_BYTES + name.len() as u64)
                    .sum::<u64>()
            }
            HeapValue::Callable { name, .. } => 3 * REF_BYTES + name.len() as u64,
            HeapValue::Opaque { .. } => return None,
        };
        Some(HEADER_BYTES + payload)
    }
}

#[derive(Debug)]
struct Slot {
    type_name: TypeName,
    value: HeapValue,
    site: &'static Location<'static>,
    pins: usize,
}

#[derive(Debug, Default)]
struct HeapInner {
    slots: Vec<Option<Slot>>,
    free: BTreeSet<usize>,
    roots: HashSet<ObjectId>,
    track_snapshots: bool,
    size_estimation: bool,
}

fn index_of(id: ObjectId) -> Option<usize> {
    (id.0 as usize).checked_sub(1)
}

fn id_of(index: usize) -> ObjectId {
    ObjectId(index as u64 + 1)
}

impl HeapInner {
    fn get(&self, id: ObjectId) -> Option<&Slot> {
        index_of(id)
            .and_then(|index| self.slots.get(index))
            .and_then(Option::as_ref)
    }

    fn get_mut(&mut self, id: ObjectId) -> Option<&mut Slot> {
        index_of(id)
            .and_then(|index| self.slots.get_mut(index))
            .and_then(Option::as_mut)
    }

    /// Slot behind a handle, provided the identity still belongs to the same type
    fn checked(&self, handle: &ObjectHandle) -> Introspect<&Slot> {
        match self.get(handle.id) {
            Some(slot) if slot.type_name == handle.type_name => Ok(slot),
            _ => Err(IntrospectionError::Vanished(handle.id)),
        }
    }

    fn handle(&self, id: ObjectId) -> Option<ObjectHandle> {
        self.get(id)
            .map(|slot| ObjectHandle::new(id, slot.type_name.clone()))
    }

    fn live(&self) -> impl Iterator<Item = (ObjectId, &Slot)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|slot| (id_of(index), slot)))
    }

    fn insert(&mut self, slot: Slot) -> ObjectId {
        match self.free.pop_first() {
            Some(index) => {
                self.slots[index] = Some(slot);
                id_of(index)
            }
            None => {
                self.slots.push(Some(slot));
                id_of(self.slots.len() - 1)
            }
        }
    }

    fn release(&mut self, id: ObjectId) {
        if let Some(index) = index_of(id) {
            if let Some(entry) = self.slots.get_mut(index) {
                if entry.take().is_some() {
                    self.free.insert(index);
                }
            }
        }
    }

    /// Non-recursive representation used for container items
    fn short_repr(&self, id: ObjectId) -> String {
        match self.get(id) {
            None => format!("<freed #{}>", id),
            Some(slot) => match &slot.value {
                HeapValue::Int(i) => i.to_string(),
                HeapValue::Float(x) => format!("{:?}", x),
                HeapValue::Str(s) => format!("{:?}", s),
                _ => format!("<{} #{}>", slot.type_name, id),
            },
        }
    }

    fn render(&self, id: ObjectId, slot: &Slot) -> Introspect<String> {
        let text = match &slot.value {
            HeapValue::Int(i) => i.to_string(),
            HeapValue::Float(x) => format!("{:?}", x),
            HeapValue::Str(s) => format!("{:?}", s),
            HeapValue::Bytes(b) => format!("b{:?}", String::from_utf8_lossy(b)),
            HeapValue::List(items) => format!("[{}]", self.join(items)),
            HeapValue::Tuple(items) if items.len() == 1 => format!("({},)", self.join(items)),
            HeapValue::Tuple(items) => format!("({})", self.join(items)),
            HeapValue::Map(entries) => {
                let body: Vec<String> = entries
                    .iter()
                    .map(|(key, value)| format!("{}: {}", key, self.short_repr(*value)))
                    .collect();
                format!("{{{}}}", body.join(", "))
            }
            HeapValue::Instance { .. } => format!("<{} object #{}>", slot.type_name, id),
            HeapValue::Module { name, .. } => format!("<module {:?}>", name),
            HeapValue::Frame { origin, .. } => format!("<frame #{} in {}>", id, origin),
            HeapValue::Callable {
                kind,
                name,
                receiver,
            } => match (kind, receiver) {
                (CallableKind::Function, _) => format!("<function {}>", name),
                (_, Some(receiver)) => {
                    format!("<bound {} of {}>", name, self.short_repr(*receiver))
                }
                (_, None) => format!("<built-in {}>", name),
            },
            HeapValue::Opaque { reason } => {
                return Err(IntrospectionError::Unrepresentable(reason.clone()))
            }
        };
        Ok(text)
    }

    fn join(&self, items: &[ObjectId]) -> String {
        items
            .iter()
            .map(|id| self.short_repr(*id))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Mark from roots and pinned objects, then free everything unmarked
    fn sweep(&mut self) -> usize {
        let mut marked = vec![false; self.slots.len()];
        let mut stack: Vec<ObjectId> = self.roots.iter().copied().collect();
        stack.extend(
            self.live()
                .filter(|(_, slot)| slot.pins > 0)
                .map(|(id, _)| id),
        );

        while let Some(id) = stack.pop() {
            let Some(index) = index_of(id) else { continue };
            if index >= marked.len() || marked[index] {
                continue;
            }
            let Some(slot) = self.get(id) else { continue };
            marked[index] = true;
            stack.extend(slot.value.references());
        }

        let garbage: Vec<ObjectId> = self
            .live()
            .filter(|(id, _)| index_of(*id).map_or(false, |index| !marked[index]))
            .map(|(id, _)| id)
            .collect();
        for id in &garbage {
            self.release(*id);
        }
        garbage.len()
    }

    fn attribute(&self, handle: &ObjectHandle, slot: &Slot, name: &str) -> Introspect<ObjectId> {
        let missing = || IntrospectionError::AttributeRead {
            name: name.to_string(),
            reason: format!("{} has no attribute {:?}", handle.type_name, name),
        };

        match &slot.value {
            HeapValue::Instance { fields, table } => {
                if name == ATTRIBUTE_TABLE {
                    return table.ok_or_else(missing);
                }
                if let Some((_, field)) = fields.iter().find(|(field_name, _)| field_name == name) {
                    return match field {
                        Field::Ref(id) => Ok(*id),
                        Field::Faulty(reason) => Err(IntrospectionError::AttributeRead {
                            name: name.to_string(),
                            reason: reason.clone(),
                        }),
                    };
                }
                table
                    .and_then(|table| self.get(table))
                    .and_then(|table| match &table.value {
                        HeapValue::Map(entries) => entries.iter().find_map(|(key, id)| match key {
                            MapKey::Str(key) if key == name => Some(*id),
                            _ => None,
                        }),
                        _ => None,
                    })
                    .ok_or_else(missing)
            }
            HeapValue::Module { members, .. } => members
                .iter()
                .find(|(member, _)| member == name)
                .map(|(_, id)| *id)
                .ok_or_else(missing),
            HeapValue::Frame { locals, .. } => locals
                .iter()
                .find(|(local, _)| local == name)
                .map(|(_, id)| *id)
                .ok_or_else(missing),
            HeapValue::Callable {
                receiver: Some(receiver),
                ..
            } if name == "__self__" => Ok(*receiver),
            _ => Err(missing()),
        }
    }
}

/// Keeps the objects of one snapshot alive until dropped
struct SnapshotPin {
    heap: Weak<RwLock<HeapInner>>,
    ids: Vec<ObjectId>,
    scratch: Option<ObjectId>,
}

impl Drop for SnapshotPin {
    fn drop(&mut self) {
        let Some(heap) = self.heap.upgrade() else { return };
        let mut inner = heap.write().unwrap_or_else(PoisonError::into_inner);
        for id in &self.ids {
            if let Some(slot) = inner.get_mut(*id) {
                slot.pins = slot.pins.saturating_sub(1);
            }
        }
        if let Some(scratch) = self.scratch {
            inner.release(scratch);
        }
    }
}

/// Shared handle to an in-process garbage-collected heap
#[derive(Debug, Clone, Default)]
pub struct ManagedHeap {
    inner: Arc<RwLock<HeapInner>>,
}

impl ManagedHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable the shallow size estimator
    pub fn with_size_estimation(self, enabled: bool) -> Self {
        self.write().size_estimation = enabled;
        self
    }

    /// Materialise every snapshot as a list object inside the heap
    ///
    /// Mirrors runtimes whose enumeration result is itself a tracked object; the
    /// list is reported as scratch so the tracer can ignore it.
    pub fn with_snapshot_tracking(self, enabled: bool) -> Self {
        self.write().track_snapshots = enabled;
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, HeapInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HeapInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate an unrooted object of the given type
    #[track_caller]
    pub fn alloc(&self, type_name: impl Into<TypeName>, value: HeapValue) -> ObjectId {
        let slot = Slot {
            type_name: type_name.into(),
            value,
            site: Location::caller(),
            pins: 0,
        };
        let type_name = slot.type_name.clone();
        let id = self.write().insert(slot);
        trace!(%id, %type_name, "allocated");
        id
    }

    /// Allocate an unrooted object typed after its payload
    #[track_caller]
    pub fn alloc_value(&self, value: HeapValue) -> ObjectId {
        let type_name = value.default_type_name();
        self.alloc(type_name, value)
    }

    /// Allocate an object and register it as a root
    #[track_caller]
    pub fn alloc_root(&self, type_name: impl Into<TypeName>, value: HeapValue) -> ObjectId {
        let id = self.alloc(type_name, value);
        self.add_root(id);
        id
    }

    pub fn add_root(&self, id: ObjectId) {
        self.write().roots.insert(id);
    }

    /// Number of live objects
    pub fn len(&self) -> usize {
        self.read().live().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_live(&self, id: ObjectId) -> bool {
        self.read().get(id).is_some()
    }

    pub fn type_of(&self, id: ObjectId) -> Option<TypeName> {
        self.read().get(id).map(|slot| slot.type_name.clone())
    }

    /// Apply `f` to the payload of `id`
    pub fn update<F>(&self, id: ObjectId, f: F) -> Result<()>
    where
        F: FnOnce(&mut HeapValue),
    {
        let mut inner = self.write();
        let slot = inner
            .get_mut(id)
            .ok_or(HeapscopeError::Introspection(IntrospectionError::Vanished(id)))?;
        f(&mut slot.value);
        Ok(())
    }

    /// Set (or add) a field on an instance
    pub fn set_field(&self, id: ObjectId, name: &str, field: Field) -> Result<()> {
        let mut applied = false;
        self.update(id, |value| {
            if let HeapValue::Instance { fields, .. } = value {
                match fields.iter_mut().find(|(field_name, _)| field_name == name) {
                    Some((_, slot)) => *slot = field,
                    None => fields.push((name.to_string(), field)),
                }
                applied = true;
            }
        })?;
        if applied {
            Ok(())
        } else {
            Err(HeapscopeError::Other(format!("object {} is not an instance", id)))
        }
    }

    /// Append to a list
    pub fn push(&self, list: ObjectId, item: ObjectId) -> Result<()> {
        let mut applied = false;
        self.update(list, |value| {
            if let HeapValue::List(items) = value {
                items.push(item);
                applied = true;
            }
        })?;
        if applied {
            Ok(())
        } else {
            Err(HeapscopeError::Other(format!("object {} is not a list", list)))
        }
    }

    /// Insert or replace a map entry
    pub fn insert(&self, map: ObjectId, key: MapKey, item: ObjectId) -> Result<()> {
        let mut applied = false;
        self.update(map, |value| {
            if let HeapValue::Map(entries) = value {
                match entries.iter_mut().find(|(existing, _)| *existing == key) {
                    Some((_, slot)) => *slot = item,
                    None => entries.push((key, item)),
                }
                applied = true;
            }
        })?;
        if applied {
            Ok(())
        } else {
            Err(HeapscopeError::Other(format!("object {} is not a map", map)))
        }
    }

    /// Drop every reference held by a list or map
    pub fn clear(&self, container: ObjectId) -> Result<()> {
        self.update(container, |value| match value {
            HeapValue::List(items) => items.clear(),
            HeapValue::Map(entries) => entries.clear(),
            _ => {}
        })
    }

    /// Free every object unreachable from roots and pinned snapshots
    pub fn reclaim(&self) -> usize {
        let freed = self.write().sweep();
        debug!(freed, "heap reclaimed");
        freed
    }
}

impl HeapSnapshotProvider for ManagedHeap {
    fn collect(&self) {
        self.reclaim();
    }

    fn snapshot(&self) -> Result<HeapSnapshot> {
        let mut inner = self.write();
        let mut objects = Vec::with_capacity(inner.slots.len());
        for index in 0..inner.slots.len() {
            if let Some(slot) = inner.slots[index].as_mut() {
                slot.pins += 1;
                objects.push(ObjectHandle::new(id_of(index), slot.type_name.clone()));
            }
        }

        let ids: Vec<ObjectId> = objects.iter().map(|handle| handle.id).collect();
        let scratch = if inner.track_snapshots {
            Some(inner.insert(Slot {
                type_name: HeapValue::List(Vec::new()).default_type_name().to_string(),
                value: HeapValue::List(ids.clone()),
                site: Location::caller(),
                pins: 1,
            }))
        } else {
            None
        };
        drop(inner);

        let pin = SnapshotPin {
            heap: Arc::downgrade(&self.inner),
            ids,
            scratch,
        };
        Ok(HeapSnapshot::new(objects)
            .with_scratch(scratch.into_iter().collect())
            .with_pin(Box::new(pin)))
    }

    fn resolve(&self, id: ObjectId) -> Option<ObjectHandle> {
        self.read().handle(id)
    }

    fn referrers(&self, handle: &ObjectHandle) -> Vec<ObjectHandle> {
        let inner = self.read();
        if inner.checked(handle).is_err() {
            return Vec::new();
        }
        inner
            .live()
            .filter(|(_, slot)| slot.value.references().contains(&handle.id))
            .map(|(id, slot)| ObjectHandle::new(id, slot.type_name.clone()))
            .collect()
    }

    fn referents(&self, handle: &ObjectHandle) -> Vec<ObjectHandle> {
        let inner = self.read();
        let Ok(slot) = inner.checked(handle) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        slot.value
            .references()
            .into_iter()
            .filter(|id| seen.insert(*id))
            .filter_map(|id| inner.handle(id))
            .collect()
    }

    fn describe(&self, handle: &ObjectHandle, limit: usize) -> Introspect<String> {
        let inner = self.read();
        let slot = inner.checked(handle)?;
        let text = inner.render(handle.id, slot)?;
        Ok(cap_chars(&text, limit))
    }

    fn kind(&self, handle: &ObjectHandle) -> ObjectKind {
        let inner = self.read();
        match inner.checked(handle).map(|slot| &slot.value) {
            Ok(HeapValue::Map(_)) => ObjectKind::Mapping,
            Ok(HeapValue::Module { .. }) => ObjectKind::Module,
            Ok(HeapValue::Frame { origin, .. }) => ObjectKind::Frame {
                origin: origin.clone(),
            },
            Ok(HeapValue::Callable { kind, .. }) => ObjectKind::Callable { callable: *kind },
            _ => ObjectKind::Plain,
        }
    }

    fn name(&self, handle: &ObjectHandle) -> Option<String> {
        let inner = self.read();
        match &inner.checked(handle).ok()?.value {
            HeapValue::Module { name, .. } | HeapValue::Callable { name, .. } => {
                Some(name.clone())
            }
            _ => None,
        }
    }

    fn entries(&self, handle: &ObjectHandle) -> Option<Vec<(MapKey, ObjectHandle)>> {
        let inner = self.read();
        match &inner.checked(handle).ok()?.value {
            HeapValue::Map(entries) => Some(
                entries
                    .iter()
                    .filter_map(|(key, id)| inner.handle(*id).map(|value| (key.clone(), value)))
                    .collect(),
            ),
            _ => None,
        }
    }

    fn attribute_names(&self, handle: &ObjectHandle) -> Vec<String> {
        let inner = self.read();
        let Ok(slot) = inner.checked(handle) else {
            return Vec::new();
        };
        match &slot.value {
            HeapValue::Instance { fields, table } => {
                let mut names: Vec<String> = fields.iter().map(|(name, _)| name.clone()).collect();
                if let Some(HeapValue::Map(entries)) =
                    table.and_then(|table| inner.get(table)).map(|table| &table.value)
                {
                    names.extend(entries.iter().filter_map(|(key, _)| match key {
                        MapKey::Str(key) => Some(key.clone()),
                        _ => None,
                    }));
                }
                names.sort();
                names.dedup();
                names
            }
            HeapValue::Module { members, .. } => {
                members.iter().map(|(name, _)| name.clone()).collect()
            }
            HeapValue::Frame { locals, .. } => {
                locals.iter().map(|(name, _)| name.clone()).collect()
            }
            HeapValue::Callable {
                receiver: Some(_), ..
            } => vec!["__self__".to_string()],
            _ => Vec::new(),
        }
    }

    fn read_attribute(&self, handle: &ObjectHandle, name: &str) -> Introspect<ObjectHandle> {
        let inner = self.read();
        let slot = inner.checked(handle)?;
        let id = inner.attribute(handle, slot, name)?;
        inner.handle(id).ok_or(IntrospectionError::Vanished(id))
    }

    fn attribute_table(&self, handle: &ObjectHandle) -> Option<ObjectHandle> {
        let inner = self.read();
        match &inner.checked(handle).ok()?.value {
            HeapValue::Instance {
                table: Some(table), ..
            } => inner.handle(*table),
            _ => None,
        }
    }

    fn supports_size_estimation(&self) -> bool {
        self.read().size_estimation
    }

    fn estimate_size(&self, handle: &ObjectHandle) -> Introspect<u64> {
        let inner = self.read();
        if !inner.size_estimation {
            return Err(IntrospectionError::Unmeasurable(handle.id));
        }
        inner
            .checked(handle)?
            .value
            .shallow_size()
            .ok_or(IntrospectionError::Unmeasurable(handle.id))
    }

    fn allocation_sites(&self, limit: usize) -> Option<Vec<AllocationSite>> {
        let inner = self.read();
        let mut sites: HashMap<String, AllocationSite> = HashMap::new();
        for (_, slot) in inner.live() {
            let location = format!("{}:{}", slot.site.file(), slot.site.line());
            let site = sites.entry(location.clone()).or_insert(AllocationSite {
                location,
                count: 0,
                bytes: 0,
            });
            site.count += 1;
            site.bytes += slot.value.shallow_size().unwrap_or(0);
        }

        let mut sites: Vec<AllocationSite> = sites.into_values().collect();
        sites.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.location.cmp(&b.location)));
        sites.truncate(limit);
        Some(sites)
    }
}
