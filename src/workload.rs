//! Synthetic leaky workload for the demo heap
//!
//! Each step allocates a session that a registry keeps forever, refills a cache
//! that is emptied every few steps, and drops some temporaries. A pair of nodes
//! pointing at each other and a long-lived worker frame give the tracer cycles and
//! frames to walk through.

use crate::error::Result;
use crate::heap::{Field, HeapValue, ManagedHeap};
use crate::types::{MapKey, ObjectId};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Steps between cache flushes
const CACHE_CYCLE: u64 = 5;

pub const SESSION_TYPE: &str = "demo::Session";
pub const NODE_TYPE: &str = "demo::Node";
pub const HANDLER_TYPE: &str = "demo::Handler";

/// Handles into the objects the workload mutates
pub struct DemoWorkload {
    heap: ManagedHeap,
    registry: ObjectId,
    cache: ObjectId,
    steps: u64,
}

impl DemoWorkload {
    /// Build the long-lived object graph
    pub fn install(heap: &ManagedHeap) -> Result<Self> {
        let registry = heap.alloc("demo::Registry", HeapValue::List(Vec::new()));
        let cache = heap.alloc("demo::Cache", HeapValue::Map(Vec::new()));

        let handler = heap.alloc(
            HANDLER_TYPE,
            HeapValue::Instance {
                fields: vec![("sessions".into(), Field::Ref(registry))],
                table: None,
            },
        );
        let routes = heap.alloc_value(HeapValue::Map(vec![(
            MapKey::Str("handler".into()),
            handler,
        )]));

        let left = heap.alloc(
            NODE_TYPE,
            HeapValue::Instance {
                fields: Vec::new(),
                table: None,
            },
        );
        let right = heap.alloc(
            NODE_TYPE,
            HeapValue::Instance {
                fields: vec![("peer".into(), Field::Ref(left))],
                table: None,
            },
        );
        heap.set_field(left, "peer", Field::Ref(right))?;

        heap.alloc_root(
            "core::Module",
            HeapValue::Module {
                name: "demo.app".into(),
                members: vec![
                    ("REGISTRY".into(), registry),
                    ("CACHE".into(), cache),
                    ("ROUTES".into(), routes),
                    ("GRAPH".into(), left),
                ],
            },
        );
        heap.alloc_root(
            "core::Frame",
            HeapValue::Frame {
                origin: "demo::worker::run".into(),
                locals: vec![("handler".into(), handler), ("node".into(), right)],
            },
        );

        info!(objects = heap.len(), "demo workload installed");
        Ok(Self {
            heap: heap.clone(),
            registry,
            cache,
            steps: 0,
        })
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Advance the workload by one step
    pub fn step(&mut self) -> Result<()> {
        self.steps += 1;
        let heap = &self.heap;

        let user = heap.alloc_value(HeapValue::Str(format!("user-{}", self.steps)));
        let payload = heap.alloc_value(HeapValue::Bytes(vec![0; (256 * self.steps as usize).min(4096)]));
        let session = heap.alloc(
            SESSION_TYPE,
            HeapValue::Instance {
                fields: vec![
                    ("user".into(), Field::Ref(user)),
                    ("payload".into(), Field::Ref(payload)),
                    ("token".into(), Field::Faulty("token is write-only".into())),
                ],
                table: None,
            },
        );
        heap.push(self.registry, session)?;

        if self.steps % CACHE_CYCLE == 0 {
            heap.clear(self.cache)?;
        } else {
            let entry = heap.alloc(
                "demo::CacheEntry",
                HeapValue::Tuple(vec![user, payload]),
            );
            heap.insert(self.cache, MapKey::Int(self.steps as i64), entry)?;
        }

        for i in 0..3 {
            heap.alloc_value(HeapValue::Int(i));
        }

        debug!(step = self.steps, "demo workload stepped");
        Ok(())
    }

    /// Step every `period` until `shutdown` fires
    pub fn spawn(mut self, period: Duration, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.step() {
                            warn!(error = %e, "demo workload step failed");
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("demo workload received shutdown signal");
                        break;
                    }
                }
            }
            info!(steps = self.steps, "demo workload stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapSnapshotProvider;

    #[test]
    fn test_sessions_leak_and_cache_cycles() {
        let heap = ManagedHeap::new();
        let mut workload = DemoWorkload::install(&heap).unwrap();

        for _ in 0..CACHE_CYCLE {
            workload.step().unwrap();
        }
        heap.reclaim();

        let snapshot = heap.snapshot().unwrap();
        assert_eq!(snapshot.of_type(SESSION_TYPE).count(), CACHE_CYCLE as usize);
        assert_eq!(snapshot.of_type("demo::CacheEntry").count(), 0);
        assert_eq!(snapshot.of_type("core::Int").count(), 0);
        assert_eq!(snapshot.of_type(NODE_TYPE).count(), 2);
    }
}
