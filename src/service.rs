//! The heapscope service facade
//!
//! [`Heapscope`] owns the census state and the sampler, and answers inspection
//! requests. Reads of the census clone what they need under a short read lock;
//! heap walks run on blocking threads against their own snapshot.

use crate::census::{
    CensusBroadcaster, CensusSampler, SizeAggregator, TickOutcome, TypeHistory, TypeSizeTable,
    UNKNOWN_SIZE,
};
use crate::config::{HeapscopeConfig, TraceConfig};
use crate::error::Result;
use crate::heap::{AllocationSite, HeapSnapshot, HeapSnapshotProvider};
use crate::trace::{inspect_attributes, ReferrerTree, Renderer, TreeEntry};
use crate::types::{AttributeEntry, Lookup, ObjectHandle, ObjectId, ObjectSummary, TypeName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// One row of the type overview
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeStats {
    pub type_name: TypeName,
    pub min: u64,
    pub current: u64,
    pub max: u64,
    /// Cumulative size as of the last refresh
    pub size: String,
}

/// Outcome of a size refresh request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SizeRefresh {
    Refreshed {
        types: usize,
        refreshed_at: Option<DateTime<Utc>>,
    },
    /// The heap cannot estimate sizes
    Unavailable,
}

/// Everything known about one object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectReport {
    pub object: ObjectSummary,
    pub attributes: Vec<AttributeEntry>,
    pub referrers: Vec<ObjectSummary>,
    pub referents: Vec<ObjectSummary>,
}

/// Heap census and reference tracer over one provider
pub struct Heapscope {
    provider: Arc<dyn HeapSnapshotProvider>,
    history: Arc<RwLock<TypeHistory>>,
    /// Absent when the provider cannot estimate sizes
    sizes: Option<Arc<RwLock<TypeSizeTable>>>,
    sampler: CensusSampler,
    events: CensusBroadcaster,
    trace: TraceConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl Heapscope {
    pub fn new(provider: Arc<dyn HeapSnapshotProvider>, config: &HeapscopeConfig) -> Self {
        let history = Arc::new(RwLock::new(TypeHistory::new(config.sampler.max_history)));
        let events = CensusBroadcaster::new(config.api.event_capacity);
        let sampler = CensusSampler::new(
            provider.clone(),
            history.clone(),
            events.clone(),
            config.sampler.period(),
        );

        let sizes = provider
            .supports_size_estimation()
            .then(|| Arc::new(RwLock::new(TypeSizeTable::default())));
        if sizes.is_none() {
            info!("heap has no size estimator, sizes will be reported as unknown");
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            provider,
            history,
            sizes,
            sampler,
            events,
            trace: config.trace.clone(),
            shutdown_tx,
        }
    }

    pub fn events(&self) -> &CensusBroadcaster {
        &self.events
    }

    pub fn sampler(&self) -> &CensusSampler {
        &self.sampler
    }

    /// Start the periodic census; it runs until [`Heapscope::shutdown`]
    pub fn start(&self) -> JoinHandle<()> {
        self.sampler.clone().spawn(self.shutdown_tx.subscribe())
    }

    /// Stop background tasks
    pub fn shutdown(&self) {
        let receivers = self.shutdown_tx.send(()).unwrap_or(0);
        debug!(receivers, "shutdown signal sent");
    }

    /// Run a census tick immediately
    pub async fn tick_now(&self) -> Result<TickOutcome> {
        self.sampler.tick().await
    }

    /// Count series of one type, oldest first
    pub async fn history(&self, type_name: &str) -> Option<Vec<u64>> {
        self.history.read().await.series(type_name)
    }

    pub async fn tracked_types(&self) -> Vec<TypeName> {
        self.history.read().await.type_names()
    }

    /// Samples recorded so far (bounded by the window)
    pub async fn samples(&self) -> usize {
        self.history.read().await.samples()
    }

    /// Overview of every type whose peak count exceeds `floor`, sorted by type name
    pub async fn type_stats(&self, floor: u64) -> Vec<TypeStats> {
        let stats = self.history.read().await.stats(floor);
        let sizes = match &self.sizes {
            Some(sizes) => Some(sizes.read().await.clone()),
            None => None,
        };

        stats
            .into_iter()
            .map(|series| TypeStats {
                size: sizes
                    .as_ref()
                    .map(|table| table.label(&series.type_name))
                    .unwrap_or_else(|| UNKNOWN_SIZE.to_string()),
                type_name: series.type_name,
                min: series.min,
                current: series.current,
                max: series.max,
            })
            .collect()
    }

    /// Recompute the per-type size table
    pub async fn refresh_sizes(&self) -> Result<SizeRefresh> {
        let Some(sizes) = &self.sizes else {
            return Ok(SizeRefresh::Unavailable);
        };

        let provider = self.provider.clone();
        let table =
            tokio::task::spawn_blocking(move || SizeAggregator::aggregate(provider.as_ref()))
                .await??;

        let refresh = SizeRefresh::Refreshed {
            types: table.len(),
            refreshed_at: table.refreshed_at(),
        };
        *sizes.write().await = table;
        Ok(refresh)
    }

    /// Summaries of every live object of a type
    pub async fn trace_type(&self, type_name: &str) -> Result<Lookup<Vec<ObjectSummary>>> {
        let provider = self.provider.clone();
        let type_name = type_name.to_string();
        let repr_limit = self.trace.repr_limit;

        tokio::task::spawn_blocking(move || -> Result<Lookup<Vec<ObjectSummary>>> {
            let snapshot = fresh_snapshot(provider.as_ref())?;
            let renderer = Renderer::new(provider.as_ref(), repr_limit);
            let summaries: Vec<ObjectSummary> = snapshot
                .of_type(&type_name)
                .filter(|handle| !snapshot.scratch().contains(&handle.id))
                .map(|handle| renderer.summary(handle, None))
                .collect();

            if summaries.is_empty() {
                debug!(%type_name, "no live objects of type");
                return Ok(Lookup::TypeNotFound);
            }
            Ok(Lookup::found(summaries))
        })
        .await?
    }

    /// Attributes, direct referrers and direct referents of one object
    pub async fn trace_object(&self, type_name: &str, id: ObjectId) -> Result<Lookup<ObjectReport>> {
        let provider = self.provider.clone();
        let type_name = type_name.to_string();
        let trace = self.trace.clone();

        tokio::task::spawn_blocking(move || -> Result<Lookup<ObjectReport>> {
            let provider = provider.as_ref();
            let snapshot = fresh_snapshot(provider)?;
            let target = match locate(&snapshot, &type_name, id) {
                Lookup::Found { result } => result,
                miss => return Ok(retype(miss)),
            };

            let renderer = Renderer::new(provider, trace.repr_limit);
            let options = trace.options().with_max_depth(Some(1));
            let referrers: Vec<ObjectSummary> = ReferrerTree::new(provider, target.clone(), options)
                .ignore(snapshot.scratch().iter().copied())
                .filter_map(|entry| match entry {
                    TreeEntry::Referrer { summary, .. } => Some(summary),
                    // the target itself, when it references itself
                    TreeEntry::SeeAbove { id, .. } => provider
                        .resolve(id)
                        .map(|handle| renderer.summary(&handle, Some(&target))),
                    _ => None,
                })
                .collect();

            let referents: Vec<ObjectSummary> = provider
                .referents(&target)
                .iter()
                .filter(|handle| !snapshot.scratch().contains(&handle.id))
                .map(|handle| renderer.summary(handle, None))
                .collect();

            Ok(Lookup::found(ObjectReport {
                object: renderer.summary(&target, None),
                attributes: inspect_attributes(provider, &target, trace.attribute_repr_limit),
                referrers,
                referents,
            }))
        })
        .await?
    }

    /// Flattened referrer tree of one object
    ///
    /// `max_results` falls back to the configured tree bound.
    pub async fn build_tree(
        &self,
        type_name: &str,
        id: ObjectId,
        max_results: Option<usize>,
    ) -> Result<Lookup<Vec<TreeEntry>>> {
        let provider = self.provider.clone();
        let type_name = type_name.to_string();
        let options = self
            .trace
            .options()
            .with_max_results(Some(max_results.unwrap_or(self.trace.tree_max_results)));

        tokio::task::spawn_blocking(move || -> Result<Lookup<Vec<TreeEntry>>> {
            let provider = provider.as_ref();
            let snapshot = fresh_snapshot(provider)?;
            let target = match locate(&snapshot, &type_name, id) {
                Lookup::Found { result } => result,
                miss => return Ok(retype(miss)),
            };

            let entries: Vec<TreeEntry> = ReferrerTree::new(provider, target, options)
                .ignore(snapshot.scratch().iter().copied())
                .collect();
            debug!(%id, entries = entries.len(), "referrer tree built");
            Ok(Lookup::found(entries))
        })
        .await?
    }

    /// Top allocation sites, if the heap records them
    pub async fn allocation_report(&self, limit: usize) -> Result<Option<Vec<AllocationSite>>> {
        let provider = self.provider.clone();
        Ok(tokio::task::spawn_blocking(move || provider.allocation_sites(limit)).await?)
    }
}

impl Drop for Heapscope {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

fn fresh_snapshot(provider: &dyn HeapSnapshotProvider) -> Result<HeapSnapshot> {
    provider.collect();
    provider.snapshot()
}

/// Find `id` in the snapshot, checking it is still of `type_name`
fn locate(snapshot: &HeapSnapshot, type_name: &str, id: ObjectId) -> Lookup<ObjectHandle> {
    match snapshot.find(id) {
        None => Lookup::ObjectNotFound,
        Some(handle) if handle.type_name != type_name => Lookup::TypeMismatch {
            actual: handle.type_name.clone(),
        },
        Some(handle) => Lookup::found(handle.clone()),
    }
}

/// Carry a miss over to another result type
fn retype<T, U>(miss: Lookup<T>) -> Lookup<U> {
    match miss {
        Lookup::Found { .. } | Lookup::ObjectNotFound => Lookup::ObjectNotFound,
        Lookup::TypeNotFound => Lookup::TypeNotFound,
        Lookup::TypeMismatch { actual } => Lookup::TypeMismatch { actual },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{Field, HeapValue, ManagedHeap};
    use crate::types::MapKey;

    fn service(heap: &ManagedHeap) -> Heapscope {
        Heapscope::new(Arc::new(heap.clone()), &HeapscopeConfig::default())
    }

    #[tokio::test]
    async fn test_type_stats_after_ticks() {
        let heap = ManagedHeap::new();
        let registry = heap.alloc_root("app::Registry", HeapValue::List(Vec::new()));
        let scope = service(&heap);

        scope.tick_now().await.unwrap();
        for _ in 0..3 {
            let session = heap.alloc("app::Session", HeapValue::Int(0));
            heap.push(registry, session).unwrap();
        }
        scope.tick_now().await.unwrap();

        assert_eq!(scope.history("app::Session").await.unwrap(), vec![0, 3]);
        let stats = scope.type_stats(0).await;
        let session = stats.iter().find(|row| row.type_name == "app::Session").unwrap();
        assert_eq!((session.min, session.current, session.max), (0, 3, 3));
        assert_eq!(session.size, UNKNOWN_SIZE);

        assert!(scope.type_stats(3).await.is_empty());
        assert_eq!(
            scope.tracked_types().await,
            vec!["app::Registry".to_string(), "app::Session".to_string()]
        );
    }

    #[tokio::test]
    async fn test_refresh_sizes_unavailable_without_estimator() {
        let heap = ManagedHeap::new();
        let scope = service(&heap);
        assert_eq!(scope.refresh_sizes().await.unwrap(), SizeRefresh::Unavailable);
    }

    #[tokio::test]
    async fn test_refresh_sizes_labels_types() {
        let heap = ManagedHeap::new().with_size_estimation(true);
        heap.alloc_root("app::Blob", HeapValue::Bytes(vec![0; 4096]));
        let scope = service(&heap);

        scope.tick_now().await.unwrap();
        assert!(matches!(
            scope.refresh_sizes().await.unwrap(),
            SizeRefresh::Refreshed { types: 1, .. }
        ));
        let stats = scope.type_stats(0).await;
        assert_eq!(stats[0].size, "4 Kb");
    }

    #[tokio::test]
    async fn test_trace_type_lookup() {
        let heap = ManagedHeap::new();
        heap.alloc_root("app::Job", HeapValue::Int(1));
        heap.alloc_root("app::Job", HeapValue::Int(2));
        let scope = service(&heap);

        let jobs = scope.trace_type("app::Job").await.unwrap().into_found().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].repr, "1");
        assert_eq!(scope.trace_type("app::Missing").await.unwrap(), Lookup::TypeNotFound);
    }

    #[tokio::test]
    async fn test_trace_object_report() {
        let heap = ManagedHeap::new();
        let handler = heap.alloc(
            "app::Handler",
            HeapValue::Instance {
                fields: vec![],
                table: None,
            },
        );
        let name = heap.alloc_value(HeapValue::Str("on_request".into()));
        heap.set_field(handler, "name", Field::Ref(name)).unwrap();
        let routes = heap.alloc_root(
            "core::Map",
            HeapValue::Map(vec![(MapKey::Str("handler".into()), handler)]),
        );
        let scope = service(&heap);

        let report = scope
            .trace_object("app::Handler", handler)
            .await
            .unwrap()
            .into_found()
            .unwrap();
        assert_eq!(report.attributes.len(), 1);
        assert_eq!(report.attributes[0].to_string(), "name: \"on_request\"");
        assert_eq!(report.referrers.len(), 1);
        assert_eq!(report.referrers[0].id, routes);
        assert_eq!(
            report.referrers[0].via.as_ref().unwrap().to_string(),
            "via its \"handler\" key"
        );
        assert_eq!(report.referents.len(), 1);
        assert_eq!(report.referents[0].id, name);
    }

    #[tokio::test]
    async fn test_trace_object_lists_self_reference() {
        let heap = ManagedHeap::new();
        let node = heap.alloc(
            "app::Node",
            HeapValue::Instance {
                fields: vec![],
                table: None,
            },
        );
        heap.set_field(node, "me", Field::Ref(node)).unwrap();
        let holder = heap.alloc_root("core::List", HeapValue::List(vec![node]));
        let scope = service(&heap);

        let report = scope
            .trace_object("app::Node", node)
            .await
            .unwrap()
            .into_found()
            .unwrap();
        let mut ids: Vec<ObjectId> = report.referrers.iter().map(|summary| summary.id).collect();
        ids.sort();
        assert_eq!(ids, vec![node, holder]);

        let own = report.referrers.iter().find(|summary| summary.id == node).unwrap();
        assert_eq!(own.via.as_ref().unwrap().to_string(), "via its \"me\" attribute");
    }

    #[tokio::test]
    async fn test_lookup_misses() {
        let heap = ManagedHeap::new();
        let obj = heap.alloc_root("app::Job", HeapValue::Int(1));
        let scope = service(&heap);

        assert_eq!(
            scope.trace_object("app::Job", ObjectId(999)).await.unwrap(),
            Lookup::ObjectNotFound
        );
        assert_eq!(
            scope.build_tree("app::Other", obj, None).await.unwrap(),
            Lookup::TypeMismatch {
                actual: "app::Job".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_reused_identity_reports_mismatch() {
        let heap = ManagedHeap::new();
        let old = heap.alloc("app::Request", HeapValue::Int(1));
        let scope = service(&heap);
        heap.reclaim();
        let reused = heap.alloc_root("app::Response", HeapValue::Int(2));
        assert_eq!(old, reused);

        assert!(matches!(
            scope.trace_object("app::Request", old).await.unwrap(),
            Lookup::TypeMismatch { .. }
        ));
    }

    #[tokio::test]
    async fn test_build_tree_respects_bound() {
        let heap = ManagedHeap::new().with_snapshot_tracking(true);
        let target = heap.alloc_root("app::Shared", HeapValue::Int(0));
        for _ in 0..10 {
            heap.alloc_root("core::List", HeapValue::List(vec![target]));
        }
        let scope = service(&heap);

        let entries = scope
            .build_tree("app::Shared", target, Some(4))
            .await
            .unwrap()
            .into_found()
            .unwrap();
        assert_eq!(entries.iter().filter(|entry| entry.is_node()).count(), 4);
        assert_eq!(entries.last(), Some(&TreeEntry::MaxResults));

        let all = scope
            .build_tree("app::Shared", target, None)
            .await
            .unwrap()
            .into_found()
            .unwrap();
        // the snapshot's own list never shows up
        assert_eq!(all.iter().filter(|entry| entry.is_node()).count(), 10);
    }

    #[tokio::test]
    async fn test_allocation_report() {
        let heap = ManagedHeap::new();
        heap.alloc_root("app::Job", HeapValue::Int(1));
        let scope = service(&heap);

        let sites = scope.allocation_report(5).await.unwrap().unwrap();
        assert_eq!(sites.len(), 1);
        assert!(sites[0].location.contains("service.rs"));
    }
}
