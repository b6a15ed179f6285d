//! Census tick notifications

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Published after every recorded census tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CensusEvent {
    /// Monotonic tick number since the sampler started
    pub tick: u64,
    /// Samples held per series after this tick
    pub samples: usize,
    /// Distinct types observed this tick
    pub types: usize,
    /// Live objects observed this tick
    pub objects: usize,
    pub timestamp: DateTime<Utc>,
}

/// Fan-out of census events to any number of subscribers
#[derive(Debug, Clone)]
pub struct CensusBroadcaster {
    tx: broadcast::Sender<CensusEvent>,
}

impl CensusBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; returns how many subscribers received it
    pub fn broadcast(&self, event: CensusEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CensusEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for CensusBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
