//! Periodic heap census
//!
//! The sampler is the only writer of [`TypeHistory`]. Each tick enumerates the heap
//! on a blocking thread, then applies the counts under one short write lock so
//! readers never observe series of unequal length.

use super::events::{CensusBroadcaster, CensusEvent};
use super::history::TypeHistory;
use crate::error::Result;
use crate::heap::HeapSnapshotProvider;
use crate::types::TypeName;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Result of one call to [`CensusSampler::tick`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Recorded { types: usize, objects: usize },
    /// Another tick was still running
    Skipped,
}

/// Clears the running flag when a tick ends, however it ends
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Background census task
#[derive(Clone)]
pub struct CensusSampler {
    provider: Arc<dyn HeapSnapshotProvider>,
    history: Arc<RwLock<TypeHistory>>,
    events: CensusBroadcaster,
    period: Duration,
    running: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
}

impl CensusSampler {
    pub fn new(
        provider: Arc<dyn HeapSnapshotProvider>,
        history: Arc<RwLock<TypeHistory>>,
        events: CensusBroadcaster,
        period: Duration,
    ) -> Self {
        Self {
            provider,
            history,
            events,
            period,
            running: Arc::new(AtomicBool::new(false)),
            ticks: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Number of ticks recorded so far
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Reclaim, enumerate, and count live objects per type
    pub fn count_types(provider: &dyn HeapSnapshotProvider) -> Result<(HashMap<TypeName, u64>, usize)> {
        provider.collect();
        let snapshot = provider.snapshot()?;

        let mut counts: HashMap<TypeName, u64> = HashMap::new();
        for handle in snapshot.objects() {
            *counts.entry(handle.type_name.clone()).or_insert(0) += 1;
        }
        Ok((counts, snapshot.len()))
    }

    /// Run one census tick now, unless one is already in progress
    ///
    /// On error the history is left exactly as it was.
    pub async fn tick(&self) -> Result<TickOutcome> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("census tick still running, skipping");
            return Ok(TickOutcome::Skipped);
        }
        let _guard = RunningGuard(self.running.clone());

        let provider = self.provider.clone();
        let (counts, objects) =
            tokio::task::spawn_blocking(move || Self::count_types(provider.as_ref())).await??;

        let types = counts.len();
        let samples = {
            let mut history = self.history.write().await;
            history.record(&counts);
            history.samples()
        };

        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(tick, types, objects, samples, "census tick recorded");
        self.events.broadcast(CensusEvent {
            tick,
            samples,
            types,
            objects,
            timestamp: Utc::now(),
        });

        Ok(TickOutcome::Recorded { types, objects })
    }

    /// Tick every period until `shutdown` fires
    ///
    /// Ticks that fall due while one is still running are skipped, never queued.
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(period_ms = self.period.as_millis() as u64, "census sampler started");
            let mut interval = tokio::time::interval(self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.tick().await {
                            warn!(error = %e, "census tick failed, keeping previous history");
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("census sampler received shutdown signal");
                        break;
                    }
                }
            }
            info!(ticks = self.ticks(), "census sampler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HeapscopeError, IntrospectionError};
    use crate::heap::{HeapSnapshot, HeapValue, ManagedHeap};
    use crate::types::{MapKey, ObjectHandle, ObjectId, ObjectKind};
    use mockall::mock;
    use std::sync::atomic::AtomicUsize;

    mock! {
        FlakyHeap {}

        impl HeapSnapshotProvider for FlakyHeap {
            fn snapshot(&self) -> Result<HeapSnapshot>;
            fn resolve(&self, id: ObjectId) -> Option<ObjectHandle>;
            fn referrers(&self, handle: &ObjectHandle) -> Vec<ObjectHandle>;
            fn referents(&self, handle: &ObjectHandle) -> Vec<ObjectHandle>;
            fn describe(&self, handle: &ObjectHandle, limit: usize) -> std::result::Result<String, IntrospectionError>;
            fn kind(&self, handle: &ObjectHandle) -> ObjectKind;
            fn name(&self, handle: &ObjectHandle) -> Option<String>;
            fn entries(&self, handle: &ObjectHandle) -> Option<Vec<(MapKey, ObjectHandle)>>;
            fn attribute_names(&self, handle: &ObjectHandle) -> Vec<String>;
            fn read_attribute(&self, handle: &ObjectHandle, name: &str) -> std::result::Result<ObjectHandle, IntrospectionError>;
        }
    }

    fn sampler_for(provider: Arc<dyn HeapSnapshotProvider>, max_history: usize) -> CensusSampler {
        CensusSampler::new(
            provider,
            Arc::new(RwLock::new(TypeHistory::new(max_history))),
            CensusBroadcaster::default(),
            Duration::from_millis(20),
        )
    }

    #[tokio::test]
    async fn test_tick_records_counts() {
        let heap = ManagedHeap::new();
        let a = heap.alloc_value(HeapValue::Str("a".into()));
        let b = heap.alloc_value(HeapValue::Str("b".into()));
        heap.alloc_root("core::List", HeapValue::List(vec![a, b]));
        heap.alloc_value(HeapValue::Int(0));

        let sampler = sampler_for(Arc::new(heap), 10);
        let outcome = sampler.tick().await.unwrap();

        // the unrooted Int is reclaimed before counting
        assert_eq!(outcome, TickOutcome::Recorded { types: 2, objects: 3 });
        let history = sampler.history.read().await;
        assert_eq!(history.series("core::Str").unwrap(), vec![2]);
        assert!(history.series("core::Int").is_none());
        assert_eq!(sampler.ticks(), 1);
    }

    #[tokio::test]
    async fn test_failed_tick_keeps_history() {
        let mut flaky = MockFlakyHeap::new();
        flaky
            .expect_snapshot()
            .times(1)
            .returning(|| Err(HeapscopeError::Enumeration("heap busy".into())));

        let sampler = sampler_for(Arc::new(flaky), 10);
        {
            let mut history = sampler.history.write().await;
            history.record(&HashMap::from([("app::Job".to_string(), 4)]));
        }

        assert!(sampler.tick().await.is_err());
        let history = sampler.history.read().await;
        assert_eq!(history.samples(), 1);
        assert_eq!(history.series("app::Job").unwrap(), vec![4]);
        assert_eq!(sampler.ticks(), 0);
        assert!(!sampler.running.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_tick_skipped_while_running() {
        let sampler = sampler_for(Arc::new(ManagedHeap::new()), 10);
        sampler.running.store(true, Ordering::Release);

        assert_eq!(sampler.tick().await.unwrap(), TickOutcome::Skipped);
        assert_eq!(sampler.history.read().await.samples(), 0);
    }

    #[tokio::test]
    async fn test_tick_broadcasts_event() {
        let heap = ManagedHeap::new();
        heap.alloc_root("app::Cache", HeapValue::Map(Vec::new()));
        let sampler = sampler_for(Arc::new(heap), 10);
        let mut rx = sampler.events.subscribe();

        sampler.tick().await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.tick, 1);
        assert_eq!(event.types, 1);
        assert_eq!(event.samples, 1);
    }

    #[tokio::test]
    async fn test_spawned_sampler_ticks_until_shutdown() {
        let heap = ManagedHeap::new();
        heap.alloc_root("app::Registry", HeapValue::List(Vec::new()));
        let sampler = sampler_for(Arc::new(heap), 10);
        let history = sampler.history.clone();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = sampler.clone().spawn(shutdown_rx);
        tokio::time::sleep(Duration::from_millis(120)).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        let history = history.read().await;
        assert!(history.samples() >= 1);
        assert!(history.is_consistent());
        assert_eq!(sampler.ticks() as usize, history.samples());
    }

    #[tokio::test]
    async fn test_spawned_sampler_recovers_after_failed_tick() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut flaky = MockFlakyHeap::new();
        let counter = calls.clone();
        flaky.expect_snapshot().returning(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(HeapscopeError::Enumeration("heap busy".into()))
            } else {
                Ok(HeapSnapshot::new(vec![ObjectHandle::new(ObjectId(1), "app::Job")]))
            }
        });

        let sampler = sampler_for(Arc::new(flaky), 10);
        let history = sampler.history.clone();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = sampler.clone().spawn(shutdown_rx);
        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        assert!(calls.load(Ordering::SeqCst) >= 2);
        let history = history.read().await;
        assert!(history.samples() >= 1);
        assert!(history.series("app::Job").unwrap().iter().all(|count| *count == 1));
        // the failed first tick is never counted
        assert_eq!(sampler.ticks() as usize, history.samples());
    }
}
