//! Reference-graph tracing
//!
//! Everything here is synchronous and works against a borrowed provider; callers
//! run it on a blocking thread.

pub mod inspect;
pub mod render;
pub mod tree;

pub use inspect::inspect_attributes;
pub use render::{edge_via, Renderer, UNREPRESENTABLE};
pub use tree::{ReferrerTree, TraceOptions, TreeEntry, TreeLine};
