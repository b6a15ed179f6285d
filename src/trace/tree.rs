//! Referrer tree traversal
//!
//! [`ReferrerTree`] walks "who points at this object" depth-first and yields a flat
//! sequence of [`TreeEntry`] values. Nesting is carried by the depth of each entry
//! and by explicit `Open`/`Close` markers around every referrer. The walk keeps its
//! own stack, so deep graphs cannot exhaust the call stack, and every referrer is
//! expanded at most once.

use super::render::Renderer;
use crate::heap::HeapSnapshotProvider;
use crate::types::{ObjectHandle, ObjectId, ObjectKind, ObjectSummary};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::vec;
use tracing::debug;

/// Bounds and filters for one traversal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceOptions {
    /// Stop descending at this depth; `None` walks the whole graph
    pub max_depth: Option<usize>,
    /// Stop after this many referrer nodes; `None` is unbounded
    pub max_results: Option<usize>,
    /// Never expand module objects
    pub ignore_modules: bool,
    /// Type-name and frame-origin prefixes identifying the tracer's own objects
    pub self_prefixes: Vec<String>,
    /// Character cap for object representations
    pub repr_limit: usize,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            max_depth: None,
            max_results: None,
            ignore_modules: true,
            self_prefixes: vec!["heapscope".to_string()],
            repr_limit: 100,
        }
    }
}

impl TraceOptions {
    pub fn with_max_depth(mut self, max_depth: Option<usize>) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_max_results(mut self, max_results: Option<usize>) -> Self {
        self.max_results = max_results;
        self
    }
}

/// One entry of a flattened referrer tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum TreeEntry {
    /// A referrer subtree begins
    Open { depth: usize },
    /// A referrer, seen for the first time
    Referrer { depth: usize, summary: ObjectSummary },
    /// A referrer already rendered earlier in this walk
    SeeAbove { depth: usize, id: ObjectId },
    /// A referrer subtree ends
    Close { depth: usize },
    /// Descent stopped by the depth bound
    MaxDepth { depth: usize },
    /// Walk stopped by the result bound
    MaxResults,
}

impl TreeEntry {
    pub fn depth(&self) -> usize {
        match self {
            TreeEntry::Open { depth }
            | TreeEntry::Referrer { depth, .. }
            | TreeEntry::SeeAbove { depth, .. }
            | TreeEntry::Close { depth }
            | TreeEntry::MaxDepth { depth } => *depth,
            TreeEntry::MaxResults => 0,
        }
    }

    /// Identity of the referrer, [`ObjectId::MARKER`] for structural entries
    pub fn identity(&self) -> ObjectId {
        match self {
            TreeEntry::Referrer { summary, .. } => summary.id,
            TreeEntry::SeeAbove { id, .. } => *id,
            _ => ObjectId::MARKER,
        }
    }

    /// Whether this entry stands for a referrer (and counts against `max_results`)
    pub fn is_node(&self) -> bool {
        matches!(self, TreeEntry::Referrer { .. } | TreeEntry::SeeAbove { .. })
    }

    /// Rendered text of the entry
    pub fn text(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TreeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeEntry::Open { .. } => write!(f, "{{"),
            TreeEntry::Close { .. } => write!(f, "}}"),
            TreeEntry::Referrer { summary, .. } => write!(f, "{}", summary),
            TreeEntry::SeeAbove { id, .. } => write!(f, "see {} above", id),
            TreeEntry::MaxDepth { .. } => write!(f, "---- Max depth reached ----"),
            TreeEntry::MaxResults => write!(f, "==== Max results reached ===="),
        }
    }
}

/// A tree entry as served to clients: depth, identity and rendered text, with the
/// structured entry alongside
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeLine {
    pub depth: usize,
    pub id: ObjectId,
    pub text: String,
    pub entry: TreeEntry,
}

impl From<TreeEntry> for TreeLine {
    fn from(entry: TreeEntry) -> Self {
        Self {
            depth: entry.depth(),
            id: entry.identity(),
            text: entry.text(),
            entry,
        }
    }
}

/// Pending referrers of one expanded object
struct Frame {
    node: ObjectHandle,
    depth: usize,
    referrers: vec::IntoIter<ObjectHandle>,
    /// Depth of the `Close` owed once this frame is exhausted
    closes: Option<usize>,
}

/// Lazy depth-first walk over the referrers of one object
pub struct ReferrerTree<'a> {
    provider: &'a dyn HeapSnapshotProvider,
    renderer: Renderer<'a>,
    options: TraceOptions,
    target: Option<ObjectHandle>,
    stack: Vec<Frame>,
    pending: VecDeque<TreeEntry>,
    visited: HashSet<ObjectId>,
    ignored: HashSet<ObjectId>,
    emitted: usize,
    finished: bool,
}

impl<'a> ReferrerTree<'a> {
    pub fn new(
        provider: &'a dyn HeapSnapshotProvider,
        target: ObjectHandle,
        options: TraceOptions,
    ) -> Self {
        let mut visited = HashSet::new();
        visited.insert(target.id);
        Self {
            provider,
            renderer: Renderer::new(provider, options.repr_limit),
            options,
            target: Some(target),
            stack: Vec::new(),
            pending: VecDeque::new(),
            visited,
            ignored: HashSet::new(),
            emitted: 0,
            finished: false,
        }
    }

    /// Never report these identities as referrers
    pub fn ignore<I>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = ObjectId>,
    {
        self.ignored.extend(ids);
        self
    }

    fn is_own(&self, handle: &ObjectHandle) -> bool {
        let owned_by_us = |name: &str| {
            self.options
                .self_prefixes
                .iter()
                .any(|prefix| name.starts_with(prefix.as_str()))
        };
        if owned_by_us(&handle.type_name) {
            return true;
        }
        match self.provider.kind(handle) {
            ObjectKind::Frame { origin } => owned_by_us(&origin),
            _ => false,
        }
    }

    /// Start expanding `node`; returns whether a frame was pushed
    fn enter(&mut self, node: ObjectHandle, depth: usize, closes: Option<usize>) -> bool {
        if self.options.max_depth.map_or(false, |max| depth >= max) {
            self.pending.push_back(TreeEntry::MaxDepth { depth });
            return false;
        }
        if self.options.ignore_modules && self.provider.kind(&node) == ObjectKind::Module {
            return false;
        }

        let referrers: Vec<ObjectHandle> = self
            .provider
            .referrers(&node)
            .into_iter()
            .filter(|referrer| !self.ignored.contains(&referrer.id))
            .filter(|referrer| !self.is_own(referrer))
            .collect();

        self.stack.push(Frame {
            node,
            depth,
            referrers: referrers.into_iter(),
            closes,
        });
        true
    }

    /// Close every open subtree and stop
    fn truncate(&mut self) {
        while let Some(frame) = self.stack.pop() {
            if let Some(depth) = frame.closes {
                self.pending.push_back(TreeEntry::Close { depth });
            }
        }
        self.pending.push_back(TreeEntry::MaxResults);
        self.finished = true;
        debug!(emitted = self.emitted, "referrer walk stopped at result bound");
    }

    fn limit_reached(&self) -> bool {
        self.options
            .max_results
            .map_or(false, |max| self.emitted >= max)
    }

    /// Produce the entries for the next referrer of the innermost frame
    fn advance(&mut self) {
        let Some(frame) = self.stack.last_mut() else {
            self.finished = true;
            return;
        };
        let depth = frame.depth;

        let Some(referrer) = frame.referrers.next() else {
            if let Some(close) = frame.closes {
                self.pending.push_back(TreeEntry::Close { depth: close });
            }
            self.stack.pop();
            return;
        };
        let current = frame.node.clone();

        self.pending.push_back(TreeEntry::Open { depth });
        self.emitted += 1;

        if !self.visited.insert(referrer.id) {
            self.pending.push_back(TreeEntry::SeeAbove {
                depth,
                id: referrer.id,
            });
            self.pending.push_back(TreeEntry::Close { depth });
            if self.limit_reached() {
                self.truncate();
            }
            return;
        }

        let summary = self.renderer.summary(&referrer, Some(&current));
        self.pending
            .push_back(TreeEntry::Referrer { depth, summary });

        if self.limit_reached() {
            self.pending.push_back(TreeEntry::Close { depth });
            self.truncate();
            return;
        }

        if !self.enter(referrer, depth + 1, Some(depth)) {
            self.pending.push_back(TreeEntry::Close { depth });
        }
    }
}

impl Iterator for ReferrerTree<'_> {
    type Item = TreeEntry;

    fn next(&mut self) -> Option<TreeEntry> {
        loop {
            if let Some(entry) = self.pending.pop_front() {
                return Some(entry);
            }
            if self.finished {
                return None;
            }
            if let Some(target) = self.target.take() {
                if self.options.max_results == Some(0) {
                    self.truncate();
                } else {
                    self.enter(target, 0, None);
                }
                continue;
            }
            self.advance();
        }
    }
}
