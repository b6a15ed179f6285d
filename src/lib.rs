//! Heapscope - heap census and reference-graph tracing
//!
//! Watches a garbage-collected heap and answers two questions about it:
//! - **Which types are growing?** A background sampler counts live objects per type
//!   on a fixed period and keeps a sliding-window history of those counts.
//! - **Why is this object still alive?** The tracer walks "who references this"
//!   edges from one object, breaking cycles and naming the field or key through
//!   which each referrer holds it.
//!
//! # Architecture
//!
//! - **Heap**: the [`HeapSnapshotProvider`] capability and the in-process
//!   [`ManagedHeap`] implementing it
//! - **Census**: [`TypeHistory`], the sampler task, the size aggregator
//! - **Trace**: referrer trees, edge attribution, attribute listings
//! - **Service**: the [`Heapscope`] facade tying them together
//! - **API**: HTTP routes and a census event stream
//!
//! # Example
//!
//! ```ignore
//! use heapscope_core::{Heapscope, HeapscopeConfig, HeapValue, ManagedHeap};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let heap = ManagedHeap::new();
//!     heap.alloc_root("app::Session", HeapValue::Int(1));
//!
//!     let scope = Heapscope::new(Arc::new(heap), &HeapscopeConfig::default());
//!     scope.tick_now().await?;
//!     println!("{:?}", scope.history("app::Session").await);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod census;
pub mod config;
pub mod error;
pub mod heap;
pub mod service;
pub mod trace;
pub mod types;
pub mod utils;
pub mod workload;

// Re-export commonly used types
pub use census::{format_size, TypeHistory, UNKNOWN_SIZE};
pub use config::HeapscopeConfig;
pub use error::{HeapscopeError, IntrospectionError, Result};
pub use heap::{AllocationSite, Field, HeapSnapshot, HeapSnapshotProvider, HeapValue, ManagedHeap};
pub use service::{Heapscope, ObjectReport, SizeRefresh, TypeStats};
pub use trace::{ReferrerTree, TraceOptions, TreeEntry, TreeLine};
pub use types::{
    AttributeEntry, CallableKind, EdgeVia, Lookup, MapKey, ObjectHandle, ObjectId, ObjectKind,
    ObjectSummary, TypeName,
};
