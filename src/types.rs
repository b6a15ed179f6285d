//! Core data types shared by the census, the tracer and the API
//!
//! These types describe objects as the diagnostic service sees them: an opaque
//! identity plus a runtime type name, and the rendered summaries produced while
//! walking the reference graph.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fully-qualified runtime type name (`module::Type`)
pub type TypeName = String;

/// Identity of one live object
///
/// Stable for the lifetime of a snapshot and comparable for equality, but identities
/// are reused once an object is reclaimed. `ObjectId(0)` never names an object; the
/// tracer uses it for structural entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// Identity carried by structural tree entries
    pub const MARKER: ObjectId = ObjectId(0);
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to one live object, valid while the snapshot that produced it is held
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectHandle {
    pub id: ObjectId,
    pub type_name: TypeName,
}

impl ObjectHandle {
    pub fn new(id: ObjectId, type_name: impl Into<TypeName>) -> Self {
        Self {
            id,
            type_name: type_name.into(),
        }
    }
}

/// Callable wrapper flavours the attribute inspector treats as noise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallableKind {
    /// Plain function object
    Function,
    /// Function bound to a receiver
    BoundMethod,
    /// Function implemented by the runtime itself
    BuiltinFunction,
    /// Runtime wrapper around a native method of one instance
    MethodWrapper,
    /// Runtime wrapper around a native slot of a type
    SlotWrapper,
}

impl CallableKind {
    /// Whether values of this kind are hidden from attribute listings
    pub fn is_method_wrapper(&self) -> bool {
        !matches!(self, CallableKind::Function)
    }
}

/// Coarse classification of an object, enough for the tracer's filters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjectKind {
    /// Ordinary data object
    Plain,
    /// Key/value container
    Mapping,
    /// Module namespace; high fan-in, rarely informative
    Module,
    /// Execution frame, tagged with the module whose code it runs
    Frame { origin: String },
    /// Callable object
    Callable { callable: CallableKind },
}

/// Key of a mapping-like object, as far as it can be represented
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MapKey {
    Str(String),
    Int(i64),
    /// Key with no textual form; only its type name is known
    Opaque(TypeName),
}

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapKey::Str(s) => write!(f, "{:?}", s),
            MapKey::Int(i) => write!(f, "{}", i),
            MapKey::Opaque(type_name) => write!(f, "<{}>", type_name),
        }
    }
}

/// How a referrer holds its referent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "via", content = "name", rename_all = "snake_case")]
pub enum EdgeVia {
    /// Mapping entry with this key
    Key(MapKey),
    /// Named attribute
    Attribute(String),
}

impl fmt::Display for EdgeVia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeVia::Key(MapKey::Opaque(type_name)) => {
                write!(f, "via its unrepresentable {} key", type_name)
            }
            EdgeVia::Key(key) => write!(f, "via its {} key", key),
            EdgeVia::Attribute(name) => write!(f, "via its {:?} attribute", name),
        }
    }
}

/// Rendered description of one object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub id: ObjectId,
    pub type_name: TypeName,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via: Option<EdgeVia>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    pub repr: String,
}

impl fmt::Display for ObjectSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.id, self.type_name)?;
        if let Some(name) = &self.name {
            write!(f, " {:?}", name)?;
        }
        if let Some(via) = &self.via {
            write!(f, " ({})", via)?;
        }
        if let Some(size) = &self.size {
            write!(f, " - {}", size)?;
        }
        write!(f, ": {}", self.repr)
    }
}

/// One `name: value` line of an attribute listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeEntry {
    pub name: String,
    pub value: String,
}

impl fmt::Display for AttributeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// Outcome of looking up a type or object in a fresh snapshot
///
/// Misses are ordinary results, distinct from both success and faults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Lookup<T> {
    Found { result: T },
    /// No live instance of the requested type
    TypeNotFound,
    /// No live object has the requested identity
    ObjectNotFound,
    /// The identity now belongs to an object of another type
    TypeMismatch { actual: TypeName },
}

impl<T> Lookup<T> {
    pub fn found(result: T) -> Self {
        Lookup::Found { result }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found { .. })
    }

    pub fn into_found(self) -> Option<T> {
        match self {
            Lookup::Found { result } => Some(result),
            _ => None,
        }
    }

    /// Transform a found result, keeping any miss as it is
    pub fn map<U, F>(self, f: F) -> Lookup<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            Lookup::Found { result } => Lookup::Found { result: f(result) },
            Lookup::TypeNotFound => Lookup::TypeNotFound,
            Lookup::ObjectNotFound => Lookup::ObjectNotFound,
            Lookup::TypeMismatch { actual } => Lookup::TypeMismatch { actual },
        }
    }

    /// Human-readable explanation of a miss
    pub fn message(&self) -> Option<String> {
        match self {
            Lookup::Found { .. } => None,
            Lookup::TypeNotFound => Some("The type you requested was not found.".to_string()),
            Lookup::ObjectNotFound => {
                Some("The object you requested was not found.".to_string())
            }
            Lookup::TypeMismatch { actual } => Some(format!(
                "The object you requested is no longer of the correct type (now {}).",
                actual
            )),
        }
    }
}
